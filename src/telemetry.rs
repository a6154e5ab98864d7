//! Fire-and-forget usage events. Emission is a tracing event on a dedicated
//! target; nothing is consumed in response and emission cannot fail a call.

pub const RIDGE_FIT: &str = "wgr_ridge_regression_fit";
pub const RIDGE_TRANSFORM: &str = "wgr_ridge_regression_transform";
pub const RIDGE_TRANSFORM_LOCO: &str = "wgr_ridge_regression_transform_loco";

pub fn record_usage_event(event: &str) {
    tracing::info!(target: "wgr::usage", event, "usage event");
}
