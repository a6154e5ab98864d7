//! End-to-end pipeline behavior on small synthetic block matrices.

use std::collections::BTreeMap;

use approx::assert_abs_diff_eq;
use ndarray::Array2;
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use wgr::df_utils::{f64_col, f64_column, i64_column, list_f64_column, str_col, str_column};
use wgr::schema::{HEADER, HEADER_BLOCK, LABEL, SAMPLE_BLOCK, SAMPLE_ID, SORT_KEY, VALUES};
use wgr::{RidgeConfig, RidgeRegression, SampleBlockMap, WgrError};

fn sample_ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("s{i}")).collect()
}

fn block_map(assignment: &[(&str, &[usize])], ids: &[String]) -> SampleBlockMap {
    let mut blocks = BTreeMap::new();
    for (block, rows) in assignment {
        blocks.insert(
            block.to_string(),
            rows.iter().map(|r| ids[*r].clone()).collect(),
        );
    }
    SampleBlockMap::new(blocks).unwrap()
}

fn label_df(ids: &[String], columns: &[(&str, Vec<f64>)]) -> DataFrame {
    let mut cols = vec![str_column(SAMPLE_ID, ids.to_vec())];
    for (name, values) in columns {
        cols.push(f64_column(name, values.clone()));
    }
    DataFrame::new(cols).unwrap()
}

/// Builds a reduced block matrix from a dense feature matrix: one row per
/// (header, sample_block, label), values in sample-block order.
fn reduced_matrix(
    x: &Array2<f64>,
    headers: &[(&str, &str)],
    labels: &[&str],
    blocks: &SampleBlockMap,
    ids: &[String],
) -> DataFrame {
    let row_of: BTreeMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(row, id)| (id.as_str(), row))
        .collect();
    let mut header_block_col = Vec::new();
    let mut sample_block_col = Vec::new();
    let mut header_col = Vec::new();
    let mut label_col = Vec::new();
    let mut sort_key_col = Vec::new();
    let mut values_col = Vec::new();
    for label in labels {
        for (block, samples) in blocks.iter() {
            for (col, (header_block, header)) in headers.iter().enumerate() {
                header_block_col.push(header_block.to_string());
                sample_block_col.push(block.clone());
                header_col.push(header.to_string());
                label_col.push(label.to_string());
                sort_key_col.push(col as i64);
                values_col.push(
                    samples
                        .iter()
                        .map(|id| x[[row_of[id.as_str()], col]])
                        .collect::<Vec<f64>>(),
                );
            }
        }
    }
    DataFrame::new(vec![
        str_column(HEADER_BLOCK, header_block_col),
        str_column(SAMPLE_BLOCK, sample_block_col),
        str_column(HEADER, header_col),
        str_column(LABEL, label_col),
        i64_column(SORT_KEY, sort_key_col),
        list_f64_column(VALUES, &values_col),
    ])
    .unwrap()
}

fn simulated(n: usize, seed: u64) -> (Vec<String>, Array2<f64>, Vec<f64>, Vec<f64>) {
    let ids = sample_ids(n);
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let x = Array2::from_shape_fn((n, 2), |_| normal.sample(&mut rng));
    let y1: Vec<f64> = (0..n)
        .map(|i| 0.6 * x[[i, 0]] - 0.3 * x[[i, 1]] + 0.1 * normal.sample(&mut rng))
        .collect();
    let y2: Vec<f64> = (0..n)
        .map(|i| -0.8 * x[[i, 0]] + 0.2 * x[[i, 1]] + 0.1 * normal.sample(&mut rng))
        .collect();
    (ids, x, y1, y2)
}

const HEADERS: [(&str, &str); 2] = [("chr_1", "chr_1_block_0"), ("chr_2", "chr_2_block_0")];

fn no_intercept(alphas: &[f64]) -> RidgeConfig {
    RidgeConfig {
        add_intercept: false,
        alphas: alphas.to_vec(),
        cores: None,
    }
}

fn fitted_regression(n: usize, assignment: &[(&str, &[usize])]) -> RidgeRegression {
    let (ids, x, y1, y2) = simulated(n, 7);
    let blocks = block_map(assignment, &ids);
    let matrix = reduced_matrix(&x, &HEADERS, &["y1", "y2"], &blocks, &ids);
    let labels = label_df(&ids, &[("y1", y1), ("y2", y2)]);
    RidgeRegression::new(matrix, &labels, blocks, None, no_intercept(&[0.1, 1.0])).unwrap()
}

#[test]
fn fit_produces_expected_model_and_cv_shapes() {
    let mut rr = fitted_regression(4, &[("b0", &[0, 1]), ("b1", &[2, 3])]);
    let (model_df, cv_df) = rr.fit().unwrap();

    // 2 headers x 2 labels x 2 alphas.
    assert_eq!(model_df.height(), 8);
    // 2 labels x 2 alphas.
    assert_eq!(cv_df.height(), 4);

    let coefficients: Vec<f64> = f64_col(&model_df, "coefficient")
        .unwrap()
        .into_no_null_iter()
        .collect();
    assert!(coefficients.iter().all(|c| c.is_finite()));

    let y_hat = rr.transform().unwrap();
    assert_eq!(y_hat.shape(), (4, 3));
    let ids: Vec<&str> = str_col(&y_hat, SAMPLE_ID)
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(ids, vec!["s1", "s2", "s3", "s4"]);
    assert_eq!(y_hat.get_column_names()[1].as_str(), "y1");
    assert_eq!(y_hat.get_column_names()[2].as_str(), "y2");
}

#[test]
fn transform_before_fit_is_a_precondition_error() {
    let rr = fitted_regression(4, &[("b0", &[0, 1]), ("b1", &[2, 3])]);
    for err in [
        rr.transform().unwrap_err(),
        rr.transform_loco(&[]).unwrap_err(),
    ] {
        assert!(matches!(
            err.downcast_ref::<WgrError>(),
            Some(WgrError::NotFitted)
        ));
    }
}

#[test]
fn fit_transform_matches_fit_then_transform() {
    let mut first = fitted_regression(6, &[("b0", &[0, 1, 2]), ("b1", &[3, 4, 5])]);
    let combined = first.fit_transform().unwrap();

    let mut second = fitted_regression(6, &[("b0", &[0, 1, 2]), ("b1", &[3, 4, 5])]);
    second.fit().unwrap();
    let separate = second.transform().unwrap();

    assert!(combined.equals(&separate));
}

#[test]
fn transform_is_idempotent() {
    let mut rr = fitted_regression(6, &[("b0", &[0, 1, 2]), ("b1", &[3, 4, 5])]);
    rr.fit().unwrap();
    let once = rr.transform().unwrap();
    let twice = rr.transform().unwrap();
    assert!(once.equals(&twice));
}

#[test]
fn model_coefficients_are_invariant_to_sample_partitioning() {
    let mut coarse = fitted_regression(6, &[("b0", &[0, 1, 2]), ("b1", &[3, 4, 5])]);
    let (coarse_model, _) = coarse.fit().unwrap();

    let mut fine = fitted_regression(6, &[("b0", &[0, 1]), ("b1", &[2, 3]), ("b2", &[4, 5])]);
    let (fine_model, _) = fine.fit().unwrap();

    // fit sorts the model table by key, so rows line up.
    assert_eq!(coarse_model.height(), fine_model.height());
    for key in [HEADER, LABEL, "alpha"] {
        let left: Vec<&str> = str_col(&coarse_model, key)
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        let right: Vec<&str> = str_col(&fine_model, key)
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(left, right);
    }
    let left: Vec<f64> = f64_col(&coarse_model, "coefficient")
        .unwrap()
        .into_no_null_iter()
        .collect();
    let right: Vec<f64> = f64_col(&fine_model, "coefficient")
        .unwrap()
        .into_no_null_iter()
        .collect();
    for (l, r) in left.iter().zip(&right) {
        assert_abs_diff_eq!(*l, *r, epsilon = 1e-9);
    }
}

#[test]
fn loco_orders_chromosomes_then_samples() {
    let mut rr = fitted_regression(4, &[("b0", &[0, 1]), ("b1", &[2, 3])]);
    rr.fit().unwrap();
    let loco = rr.transform_loco(&[]).unwrap();

    assert_eq!(loco.shape(), (8, 4));
    let contigs: Vec<&str> = str_col(&loco, "contig")
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(contigs, vec!["1", "1", "1", "1", "2", "2", "2", "2"]);
    let ids: Vec<&str> = str_col(&loco, SAMPLE_ID)
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(ids, vec!["s1", "s2", "s3", "s4", "s1", "s2", "s3", "s4"]);
}

#[test]
fn loco_predictions_sum_to_the_whole_genome_prediction() {
    // With two chromosomes and no covariates, full = c1 + c2, so
    // loco(1) + loco(2) = (full - c1) + (full - c2) = full.
    let mut rr = fitted_regression(6, &[("b0", &[0, 1, 2]), ("b1", &[3, 4, 5])]);
    rr.fit().unwrap();
    let full = rr.transform().unwrap();
    let loco = rr.transform_loco(&[]).unwrap();

    for label in ["y1", "y2"] {
        let full_col: Vec<f64> = f64_col(&full, label).unwrap().into_no_null_iter().collect();
        let loco_col: Vec<f64> = f64_col(&loco, label).unwrap().into_no_null_iter().collect();
        let n = full_col.len();
        for i in 0..n {
            assert_abs_diff_eq!(loco_col[i] + loco_col[n + i], full_col[i], epsilon = 1e-9);
        }
    }
}

#[test]
fn default_alpha_grid_is_derived_from_the_matrix() {
    let (ids, x, y1, y2) = simulated(4, 11);
    let blocks = block_map(&[("b0", &[0, 1]), ("b1", &[2, 3])], &ids);
    let matrix = reduced_matrix(&x, &HEADERS, &["y1", "y2"], &blocks, &ids);
    let labels = label_df(&ids, &[("y1", y1), ("y2", y2)]);
    let rr = RidgeRegression::new(matrix, &labels, blocks, None, RidgeConfig::default()).unwrap();

    // 5-point heritability grid over 2 distinct headers.
    assert_eq!(rr.alphas().len(), 5);
    assert_abs_diff_eq!(rr.alphas().value("alpha_0").unwrap(), 2.0 / 0.99, epsilon = 1e-12);
    assert_abs_diff_eq!(rr.alphas().value("alpha_4").unwrap(), 2.0 / 0.01, epsilon = 1e-12);
}

#[test]
fn covariates_are_modeled_and_survive_loco_filters() {
    let (ids, x, y1, y2) = simulated(6, 23);
    let blocks = block_map(&[("b0", &[0, 1, 2]), ("b1", &[3, 4, 5])], &ids);
    let matrix = reduced_matrix(&x, &HEADERS, &["y1", "y2"], &blocks, &ids);
    let labels = label_df(&ids, &[("y1", y1), ("y2", y2)]);
    let cov = label_df(&ids, &[("age", vec![41.0, 52.0, 37.0, 58.0, 45.0, 66.0])]);
    let config = RidgeConfig {
        add_intercept: true,
        alphas: vec![0.1, 1.0],
        cores: None,
    };
    let mut rr = RidgeRegression::new(matrix, &labels, blocks, Some(&cov), config).unwrap();
    let (model_df, _) = rr.fit().unwrap();

    // (2 features + intercept + age) x 2 labels x 2 alphas.
    assert_eq!(model_df.height(), 16);
    let header_blocks: Vec<&str> = str_col(&model_df, HEADER_BLOCK)
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert!(header_blocks.iter().any(|b| *b == "covariates"));

    // LOCO filters chromosome headers only; covariate terms keep predicting.
    let loco = rr.transform_loco(&[]).unwrap();
    assert_eq!(loco.shape(), (12, 4));
}
