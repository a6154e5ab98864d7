//! The ridge-regression orchestrator: owns configuration and standardized
//! inputs, sequences map -> reduce -> solve -> cross-validate, and applies the
//! fitted model as whole-genome or leave-one-chromosome-out predictions.

use anyhow::{Context, Result};
use polars::prelude::*;

use crate::apply::{ModelLookup, apply_model_df, flatten_predictions};
use crate::cv::{best_alphas, cross_validation};
use crate::engine::group_apply;
use crate::error::WgrError;
use crate::loco::{chromosome_of, infer_chromosomes, sort_chromosomes};
use crate::normal_eqn::{map_normal_eqn, reduce_normal_eqn};
use crate::schema::{
    ALPHA, CONTIG, HEADER, HEADER_BLOCK, LABEL, SAMPLE_BLOCK, check_schema, model_schema,
    normal_eqn_schema, reduced_matrix_schema,
};
use crate::solver::solve_normal_eqn;
use crate::telemetry;
use crate::types::{
    AlphaSet, LabelFrame, RidgeConfig, SampleBlockMap, prepare_covariates, prepare_labels,
};

/// Fit state as a sum type: `transform` demands `Fitted`, never a null check.
enum FitState {
    Unfit,
    Fitted { model_df: DataFrame, cv_df: DataFrame },
}

/// Fits ridge models of the form `Y_hat ~ XB` against one or more labels over
/// a grid of alpha penalties, choosing per label the alpha that maximizes the
/// mean out-of-fold R^2.
pub struct RidgeRegression {
    reduced_block_df: DataFrame,
    sample_blocks: SampleBlockMap,
    label_df: LabelFrame,
    std_label_df: LabelFrame,
    std_cov_df: LabelFrame,
    alphas: AlphaSet,
    cores: Option<usize>,
    state: FitState,
}

impl RidgeRegression {
    /// Validates and standardizes the inputs. `label_df` and the optional
    /// `cov_df` are sample-by-column frames with a `sample_id` column; the
    /// alpha grid is derived from the matrix when the config leaves it empty.
    pub fn new(
        reduced_block_df: DataFrame,
        label_df: &DataFrame,
        sample_blocks: SampleBlockMap,
        cov_df: Option<&DataFrame>,
        config: RidgeConfig,
    ) -> Result<Self> {
        check_schema(&reduced_block_df, &reduced_matrix_schema(), "reduced matrix")?;
        let labels = LabelFrame::from_dataframe(label_df).context("label table")?;
        let std_labels = prepare_labels(&labels)?;
        sample_blocks.validate_against(&labels)?;
        let covariates = cov_df
            .map(LabelFrame::from_dataframe)
            .transpose()
            .context("covariate table")?;
        let std_cov_df = prepare_covariates(covariates.as_ref(), &labels, config.add_intercept)?;
        let alphas = if config.alphas.is_empty() {
            AlphaSet::generate(&reduced_block_df)?
        } else {
            AlphaSet::from_values(&config.alphas)?
        };
        Ok(Self {
            reduced_block_df,
            sample_blocks,
            label_df: labels,
            std_label_df: std_labels,
            std_cov_df,
            alphas,
            cores: config.cores,
            state: FitState::Unfit,
        })
    }

    pub fn alphas(&self) -> &AlphaSet {
        &self.alphas
    }

    pub fn sample_blocks(&self) -> &SampleBlockMap {
        &self.sample_blocks
    }

    fn fitted(&self) -> Result<(&DataFrame, &DataFrame)> {
        match &self.state {
            FitState::Fitted { model_df, cv_df } => Ok((model_df, cv_df)),
            FitState::Unfit => Err(WgrError::NotFitted.into()),
        }
    }

    pub fn model_df(&self) -> Result<&DataFrame> {
        Ok(self.fitted()?.0)
    }

    pub fn cv_df(&self) -> Result<&DataFrame> {
        Ok(self.fitted()?.1)
    }

    /// Accumulates, reduces and solves the normal equations for every label
    /// and alpha, then cross-validates out of fold. Returns the model table
    /// and the cross-validation table; both are immutable from here on.
    pub fn fit(&mut self) -> Result<(DataFrame, DataFrame)> {
        let map_df = group_apply(
            &self.reduced_block_df,
            &[SAMPLE_BLOCK, LABEL],
            &normal_eqn_schema(),
            self.cores,
            |key, group| {
                map_normal_eqn(
                    key,
                    group,
                    &self.std_label_df,
                    &self.sample_blocks,
                    &self.std_cov_df,
                )
            },
        )
        .context("normal equation map stage")?;

        let reduce_df = group_apply(
            &map_df,
            &[HEADER_BLOCK, HEADER, LABEL],
            &normal_eqn_schema(),
            self.cores,
            reduce_normal_eqn,
        )
        .context("normal equation reduce stage")?;

        let model_df = group_apply(
            &reduce_df,
            &[SAMPLE_BLOCK, LABEL],
            &model_schema(),
            self.cores,
            |key, group| solve_normal_eqn(key, group, &self.alphas),
        )
        .context("ridge solve stage")?
        .sort([LABEL, ALPHA, HEADER_BLOCK, HEADER], Default::default())?;

        let cv_df = cross_validation(
            &self.reduced_block_df,
            &map_df,
            &reduce_df,
            &self.std_label_df,
            &self.sample_blocks,
            &self.std_cov_df,
            &self.alphas,
            self.cores,
        )
        .context("cross validation stage")?;

        self.state = FitState::Fitted {
            model_df: model_df.clone(),
            cv_df: cv_df.clone(),
        };
        telemetry::record_usage_event(telemetry::RIDGE_FIT);
        Ok((model_df, cv_df))
    }

    /// Winning-alpha coefficient lookup; also checks that cross-validation
    /// selected an alpha for every label.
    fn model_lookup(&self) -> Result<ModelLookup> {
        let (model_df, cv_df) = self.fitted()?;
        let best = best_alphas(cv_df, &self.alphas)?;
        for label in self.std_label_df.names() {
            if !best.contains_key(label) {
                return Err(WgrError::Consistency(format!(
                    "cross-validation selected no alpha for label {label}"
                ))
                .into());
            }
        }
        ModelLookup::from_model(model_df, &best)
    }

    /// Applies the fitted model at each label's winning alpha. Returns a dense
    /// prediction table shaped and ordered like the label table.
    pub fn transform(&self) -> Result<DataFrame> {
        let lookup = self.model_lookup()?;
        let blocked = apply_model_df(
            &self.reduced_block_df,
            &lookup,
            &self.sample_blocks,
            &self.std_cov_df,
            self.cores,
            false,
        )
        .context("model apply stage")?;
        let y_hat_df = flatten_predictions(&blocked, &self.sample_blocks, &self.label_df)?;
        telemetry::record_usage_event(telemetry::RIDGE_TRANSFORM);
        Ok(y_hat_df)
    }

    /// Leave-one-chromosome-out predictions: per chromosome, the model is
    /// filtered to exclude that chromosome's headers and applied to the whole
    /// matrix. Chromosomes come from `chromosomes` or, when empty, from the
    /// model's header names. Output rows are keyed by `contig` (primary,
    /// sorted) and sample (secondary, label-table order).
    pub fn transform_loco(&self, chromosomes: &[String]) -> Result<DataFrame> {
        // Hoisted out of the loop so each iteration reuses one materialized
        // lookup; dropped on every exit path, including a failed iteration.
        let lookup = self.model_lookup()?;
        let loco_chromosomes = if chromosomes.is_empty() {
            infer_chromosomes(self.model_df()?)?
        } else {
            sort_chromosomes(chromosomes.to_vec())
        };

        let mut y_hat_df: Option<DataFrame> = None;
        for chromosome in &loco_chromosomes {
            tracing::info!("Generating predictions for chromosome {chromosome}");
            let loco_lookup =
                lookup.filtered(|header| chromosome_of(header) == Some(chromosome.as_str()));
            let blocked = apply_model_df(
                &self.reduced_block_df,
                &loco_lookup,
                &self.sample_blocks,
                &self.std_cov_df,
                self.cores,
                true,
            )
            .with_context(|| format!("model apply stage for chromosome {chromosome}"))?;
            let flat = flatten_predictions(&blocked, &self.sample_blocks, &self.label_df)?;

            let mut columns = vec![crate::df_utils::str_column(
                CONTIG,
                vec![chromosome.clone(); flat.height()],
            )];
            columns.extend(flat.get_columns().iter().cloned());
            let tagged = DataFrame::new(columns)?;
            y_hat_df = Some(match y_hat_df {
                Some(mut acc) => {
                    acc.vstack_mut(&tagged)?;
                    acc
                }
                None => tagged,
            });
        }
        let y_hat_df = y_hat_df
            .ok_or_else(|| WgrError::Consistency("no chromosomes to leave out".into()))?;
        telemetry::record_usage_event(telemetry::RIDGE_TRANSFORM_LOCO);
        Ok(y_hat_df)
    }

    /// `fit` then `transform` on the same inputs.
    pub fn fit_transform(&mut self) -> Result<DataFrame> {
        self.fit()?;
        self.transform()
    }

    /// `fit` then `transform_loco` on the same inputs.
    pub fn fit_transform_loco(&mut self, chromosomes: &[String]) -> Result<DataFrame> {
        self.fit()?;
        self.transform_loco(chromosomes)
    }
}
