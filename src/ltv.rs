//! Customer lifetime-value regression
//!
//! Fits an ordinary least-squares model from standardised
//! recency/frequency/monetary features to the capped LTV target, evaluates it
//! on a held-out split and ranks features by absolute coefficient.

use crate::config::AnalyticsConfig;
use crate::features::{CustomerLtvRecord, LTV_FEATURES};
use crate::scaler::StandardScaler;
use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;
use tracing::{debug, info, warn};

/// Fewest records that still leave a usable train and held-out split
pub const MIN_LTV_RECORDS: usize = 10;

/// Share of records held out for evaluation
pub const TEST_RATIO: f64 = 0.2;

/// Relative squared norm below which a column counts as a combination of
/// earlier ones
const COLLINEARITY_TOLERANCE: f64 = 1e-10;

/// Coefficient of one standardised feature
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureImportance {
    pub feature: &'static str,
    /// Signed model weight
    pub coefficient: f64,
    /// Absolute weight, used for ranking
    pub importance: f64,
}

/// Fit quality of a trained LTV model
#[derive(Debug, Clone, PartialEq)]
pub struct LtvModelReport {
    pub n_train: usize,
    pub n_test: usize,
    pub dropped_non_finite: usize,
    pub dropped_outliers: usize,
    pub intercept: f64,
    pub train_r2: f64,
    /// R² on the held-out partition
    pub r2: f64,
    /// RMSE on the held-out partition
    pub rmse: f64,
    /// Sorted by descending importance
    pub importance: Vec<FeatureImportance>,
}

/// Result of an LTV estimation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum LtvOutcome {
    Fitted(LtvModelReport),
    InsufficientData { available: usize, required: usize },
    FitFailed { reason: String },
}

impl LtvOutcome {
    pub fn report(&self) -> Option<&LtvModelReport> {
        match self {
            LtvOutcome::Fitted(report) => Some(report),
            _ => None,
        }
    }
}

impl fmt::Display for LtvOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LtvOutcome::Fitted(report) => {
                writeln!(f, "Model Performance:")?;
                writeln!(f, "  R² Score: {:.4}", report.r2)?;
                writeln!(f, "  RMSE: ${:.2}", report.rmse)?;
                writeln!(
                    f,
                    "  Train/held-out: {}/{} (dropped {} non-finite, {} outliers)",
                    report.n_train, report.n_test, report.dropped_non_finite, report.dropped_outliers
                )?;
                write!(f, "Feature Importance:")?;
                for item in &report.importance {
                    write!(f, "\n  {:<20} {:>12.4} ({:+.4})", item.feature, item.importance, item.coefficient)?;
                }
                Ok(())
            }
            LtvOutcome::InsufficientData { available, required } => write!(
                f,
                "LTV model: insufficient data ({} usable customers, {} required)",
                available, required
            ),
            LtvOutcome::FitFailed { reason } => write!(f, "LTV model: fit failed ({})", reason),
        }
    }
}

/// Train and evaluate the LTV model
pub fn estimate_ltv(records: &[CustomerLtvRecord], config: &AnalyticsConfig) -> LtvOutcome {
    let finite: Vec<&CustomerLtvRecord> = records.iter().filter(|r| r.is_finite()).collect();
    let dropped_non_finite = records.len() - finite.len();

    let targets: Vec<f64> = finite.iter().map(|r| r.ltv).collect();
    let kept: Vec<&CustomerLtvRecord> = match iqr_bounds(&targets) {
        Some((low, high)) => finite
            .iter()
            .copied()
            .filter(|r| r.ltv >= low && r.ltv <= high)
            .collect(),
        None => finite.clone(),
    };
    let dropped_outliers = finite.len() - kept.len();

    if kept.len() < MIN_LTV_RECORDS {
        warn!(available = kept.len(), "Not enough customers for LTV model");
        return LtvOutcome::InsufficientData {
            available: kept.len(),
            required: MIN_LTV_RECORDS,
        };
    }

    let mut x = Array2::zeros((kept.len(), LTV_FEATURES.len()));
    for (mut row, record) in x.outer_iter_mut().zip(&kept) {
        for (cell, value) in row.iter_mut().zip(record.features()) {
            *cell = value;
        }
    }
    let y: Array1<f64> = kept.iter().map(|r| r.ltv).collect();

    let (train_idx, test_idx) = train_test_split(kept.len(), TEST_RATIO, config.seed);
    let x_train = x.select(Axis(0), &train_idx);
    let x_test = x.select(Axis(0), &test_idx);
    let y_train = y.select(Axis(0), &train_idx);
    let y_test = y.select(Axis(0), &test_idx);

    // Scaling parameters come from the training rows only
    let scaler = StandardScaler::fit(&x_train);
    let x_train = scaler.transform(&x_train);
    let x_test = scaler.transform(&x_test);

    // Constant and collinear columns stay out of the fit and keep weight 0
    let active = independent_columns(&x_train);
    if active.len() < LTV_FEATURES.len() {
        debug!(
            used = ?active.iter().map(|&c| LTV_FEATURES[c]).collect::<Vec<_>>(),
            "Dropped degenerate LTV feature columns"
        );
    }

    let mut coefficients = vec![0.0; LTV_FEATURES.len()];
    let (intercept, train_pred, test_pred) = if active.is_empty() {
        let mean = y_train.mean().unwrap_or(0.0);
        (
            mean,
            Array1::from_elem(y_train.len(), mean),
            Array1::from_elem(y_test.len(), mean),
        )
    } else {
        let x_train = x_train.select(Axis(1), &active);
        let x_test = x_test.select(Axis(1), &active);
        let dataset = Dataset::new(x_train.clone(), y_train.clone());
        let model = match LinearRegression::new().fit(&dataset) {
            Ok(model) => model,
            Err(err) => {
                warn!(error = %err, "LTV regression failed");
                return LtvOutcome::FitFailed {
                    reason: err.to_string(),
                };
            }
        };
        for (&column, &weight) in active.iter().zip(model.params().iter()) {
            coefficients[column] = weight;
        }
        let train_pred: Array1<f64> = model.predict(&x_train);
        let test_pred: Array1<f64> = model.predict(&x_test);
        (model.intercept(), train_pred, test_pred)
    };

    if coefficients.iter().any(|c| !c.is_finite()) || test_pred.iter().any(|p| !p.is_finite()) {
        return LtvOutcome::FitFailed {
            reason: "regression produced non-finite coefficients".to_string(),
        };
    }

    let mut importance: Vec<FeatureImportance> = LTV_FEATURES
        .iter()
        .zip(coefficients)
        .map(|(&feature, coefficient)| FeatureImportance {
            feature,
            coefficient,
            importance: coefficient.abs(),
        })
        .collect();
    importance.sort_by(|a, b| b.importance.total_cmp(&a.importance));

    let report = LtvModelReport {
        n_train: train_idx.len(),
        n_test: test_idx.len(),
        dropped_non_finite,
        dropped_outliers,
        intercept,
        train_r2: r_squared(&y_train, &train_pred),
        r2: r_squared(&y_test, &test_pred),
        rmse: root_mean_squared_error(&y_test, &test_pred),
        importance,
    };
    info!(
        r2 = report.r2,
        rmse = report.rmse,
        train = report.n_train,
        test = report.n_test,
        "LTV model fitted"
    );
    LtvOutcome::Fitted(report)
}

/// Indices of the columns of a centred matrix that are linearly independent
/// of the columns before them
///
/// Gram-Schmidt over the columns in order: all-zero columns and columns
/// (nearly) spanned by already kept ones are skipped, so the normal equations
/// of the kept columns are positive definite.
fn independent_columns(x: &Array2<f64>) -> Vec<usize> {
    let mut basis: Vec<Array1<f64>> = Vec::new();
    let mut kept = Vec::new();
    for (index, column) in x.axis_iter(Axis(1)).enumerate() {
        let norm = column.dot(&column);
        if norm <= f64::EPSILON {
            continue;
        }
        let mut residual = column.to_owned();
        for direction in &basis {
            let projection = residual.dot(direction);
            residual.scaled_add(-projection, direction);
        }
        let residual_norm = residual.dot(&residual);
        if residual_norm <= COLLINEARITY_TOLERANCE * norm {
            continue;
        }
        residual /= residual_norm.sqrt();
        basis.push(residual);
        kept.push(index);
    }
    kept
}

/// Tukey fences `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]`
pub fn iqr_bounds(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    Some((q1 - 1.5 * iqr, q3 + 1.5 * iqr))
}

/// Linearly interpolated quantile of sorted values
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Shuffle `0..n` with a fixed seed and split off `ceil(n * test_ratio)`
/// held-out indices
pub fn train_test_split(n: usize, test_ratio: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));

    let n_test = ((n as f64) * test_ratio).ceil() as usize;
    let test = indices.split_off(n - n_test.min(n));
    (indices, test)
}

/// R²: 1 - SS_res / SS_tot
pub fn r_squared(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    let n = y_true.len();
    if n == 0 {
        return 0.0;
    }
    let mean = y_true.sum() / n as f64;
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();

    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Root mean squared error
pub fn root_mean_squared_error(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    let n = y_true.len();
    if n == 0 {
        return 0.0;
    }
    let mse = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum::<f64>()
        / n as f64;
    mse.sqrt()
}
