//! Tunable parameters for a pipeline run

use crate::error::AnalyticsError;

/// Validated options recognised by every component of the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsConfig {
    /// Number of K-Means clusters
    pub n_clusters: usize,
    /// DBSCAN neighbourhood radius, in scaled feature units
    pub eps: f64,
    /// DBSCAN minimum neighbourhood size (the point itself included)
    pub min_samples: usize,
    /// Number of days to forecast past the last observed date
    pub horizon: usize,
    /// Seasonal period of the daily sales series, in days
    pub seasonal_period: usize,
    /// Ceiling applied to the derived LTV target
    pub ltv_cap: f64,
    /// Seed shared by clustering initialisation and the LTV split
    pub seed: u64,
    /// Maximum K-Means iterations
    pub max_iters: u64,
    /// K-Means convergence tolerance
    pub tolerance: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            n_clusters: 5,
            eps: 0.5,
            min_samples: 5,
            horizon: 30,
            seasonal_period: 7,
            ltv_cap: 1_000_000.0,
            seed: 42,
            max_iters: 300,
            tolerance: 1e-4,
        }
    }
}

impl AnalyticsConfig {
    /// Reject values that no component can work with
    pub fn validate(&self) -> Result<(), AnalyticsError> {
        let invalid = |msg: &str| Err(AnalyticsError::InvalidConfig(msg.to_string()));

        if self.n_clusters == 0 {
            return invalid("number of clusters must be at least 1");
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return invalid("DBSCAN radius must be a positive number");
        }
        if self.min_samples < 2 {
            return invalid("DBSCAN minimum neighbourhood size must be at least 2");
        }
        if self.horizon == 0 {
            return invalid("forecast horizon must be at least one day");
        }
        if self.seasonal_period < 2 {
            return invalid("seasonal period must be at least 2 days");
        }
        if !(self.ltv_cap.is_finite() && self.ltv_cap > 0.0) {
            return invalid("LTV cap must be a positive number");
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return invalid("K-Means tolerance must be a positive number");
        }
        Ok(())
    }
}
