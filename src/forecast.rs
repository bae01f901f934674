//! Daily sales decomposition and Holt-Winters forecasting
//!
//! The forecaster fits an additive-trend, additive-seasonal exponential
//! smoothing model whose parameters minimise the one-step-ahead squared error
//! on the history. Strictly positive series are Box-Cox transformed first.
//! Series the model cannot handle (too short, constant, or a fit that does not
//! produce finite values) fall back to a flat continuation of the last
//! observed value, flagged as low confidence.

use crate::config::AnalyticsConfig;
use crate::features::DailySalesSeries;
use chrono::{Duration, NaiveDate};
use std::fmt;
use tracing::{debug, info, warn};

// ============================================================================
// Seasonal decomposition
// ============================================================================

/// Classical additive decomposition `Y = T + S + R`
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub period: usize,
    /// Centred moving average; `None` where the window does not fit
    pub trend: Vec<Option<f64>>,
    /// Repeating seasonal pattern, zero-mean over one period
    pub seasonal: Vec<f64>,
    pub residual: Vec<Option<f64>>,
}

impl Decomposition {
    /// Strength of the trend in [0, 1]
    pub fn trend_strength(&self) -> f64 {
        let (residual, deseasoned): (Vec<f64>, Vec<f64>) = self
            .trend
            .iter()
            .zip(&self.residual)
            .filter_map(|(t, r)| Some((r.as_ref()?, t.as_ref()?)))
            .map(|(r, t)| (*r, t + r))
            .unzip();
        strength(&residual, &deseasoned)
    }

    /// Strength of the seasonal pattern in [0, 1]
    pub fn seasonal_strength(&self) -> f64 {
        let (residual, detrended): (Vec<f64>, Vec<f64>) = self
            .residual
            .iter()
            .zip(&self.seasonal)
            .filter_map(|(r, s)| r.map(|r| (r, s + r)))
            .unzip();
        strength(&residual, &detrended)
    }
}

fn strength(residual: &[f64], combined: &[f64]) -> f64 {
    let var_combined = variance(combined);
    if var_combined == 0.0 {
        return 0.0;
    }
    (1.0 - variance(residual) / var_combined).max(0.0)
}

/// Decompose `values` into trend, seasonal and residual components
///
/// Returns `None` when fewer than two full periods are available.
pub fn decompose(values: &[f64], period: usize) -> Option<Decomposition> {
    let n = values.len();
    if period < 2 || n < period * 2 {
        return None;
    }

    let trend = centred_moving_average(values, period);

    let mut phase_sums = vec![0.0; period];
    let mut phase_counts = vec![0usize; period];
    for (i, (y, t)) in values.iter().zip(&trend).enumerate() {
        if let Some(t) = t {
            phase_sums[i % period] += y - t;
            phase_counts[i % period] += 1;
        }
    }
    let mut pattern: Vec<f64> = phase_sums
        .iter()
        .zip(&phase_counts)
        .map(|(sum, &count)| if count > 0 { sum / count as f64 } else { 0.0 })
        .collect();
    let pattern_mean = mean(&pattern);
    for s in &mut pattern {
        *s -= pattern_mean;
    }

    let seasonal: Vec<f64> = (0..n).map(|i| pattern[i % period]).collect();
    let residual = values
        .iter()
        .zip(&trend)
        .zip(&seasonal)
        .map(|((y, t), s)| t.map(|t| y - t - s))
        .collect();

    Some(Decomposition {
        period,
        trend,
        seasonal,
        residual,
    })
}

/// Centred moving average; even periods use a 2x`period` window
fn centred_moving_average(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let half = period / 2;
    let weights: Vec<f64> = if period % 2 == 1 {
        vec![1.0 / period as f64; period]
    } else {
        let mut w = vec![1.0 / period as f64; period + 1];
        w[0] /= 2.0;
        w[period] /= 2.0;
        w
    };

    (0..n)
        .map(|i| {
            if i < half || i + half >= n {
                return None;
            }
            let window = &values[i - half..=i + half];
            Some(window.iter().zip(&weights).map(|(v, w)| v * w).sum())
        })
        .collect()
}

// ============================================================================
// Holt-Winters (additive trend, additive seasonality)
// ============================================================================

/// Fitted additive Holt-Winters model
#[derive(Debug, Clone, PartialEq)]
pub struct HoltWinters {
    alpha: f64,
    beta: f64,
    gamma: f64,
    period: usize,
    level: f64,
    trend: f64,
    seasonal: Vec<f64>,
    n_obs: usize,
    sse: f64,
}

const PARAM_MIN: f64 = 1e-4;
const PARAM_MAX: f64 = 1.0 - 1e-4;
const MAX_SEARCH_ROUNDS: usize = 500;

impl HoltWinters {
    /// Run the smoothing recursions with fixed parameters
    ///
    /// Requires at least two full periods of data.
    pub fn with_params(values: &[f64], period: usize, alpha: f64, beta: f64, gamma: f64) -> Option<Self> {
        let n = values.len();
        if period < 2 || n < period * 2 {
            return None;
        }

        // Level from the first season, trend from the change between the first two
        let first = mean(&values[..period]);
        let second = mean(&values[period..2 * period]);
        let mut level = first;
        let mut trend = (second - first) / period as f64;
        let mut seasonal: Vec<f64> = values[..period].iter().map(|v| v - first).collect();

        let mut sse = 0.0;
        for (t, &y) in values.iter().enumerate().skip(period) {
            let idx = t % period;
            let prev_seasonal = seasonal[idx];
            let error = y - (level + trend + prev_seasonal);
            sse += error * error;

            let prev_level = level;
            level = alpha * (y - prev_seasonal) + (1.0 - alpha) * (level + trend);
            trend = beta * (level - prev_level) + (1.0 - beta) * trend;
            seasonal[idx] = gamma * (y - level) + (1.0 - gamma) * prev_seasonal;
        }

        Some(Self {
            alpha,
            beta,
            gamma,
            period,
            level,
            trend,
            seasonal,
            n_obs: n,
            sse,
        })
    }

    /// Fit with parameters chosen to minimise the one-step-ahead SSE
    ///
    /// A coarse grid seeds a pattern search over (alpha, beta, gamma).
    /// Returns `None` if no parameter set yields a finite error.
    pub fn fit(values: &[f64], period: usize) -> Option<Self> {
        let evaluate = |p: [f64; 3]| {
            Self::with_params(values, period, p[0], p[1], p[2]).filter(|m| m.sse.is_finite())
        };

        let grid: Vec<f64> = (0..10).map(|i| 0.05 + 0.1 * i as f64).collect();
        let mut best: Option<Self> = None;
        for &alpha in &grid {
            for &beta in &grid {
                for &gamma in &grid {
                    if let Some(model) = evaluate([alpha, beta, gamma]) {
                        if best.as_ref().map_or(true, |b| model.sse < b.sse) {
                            best = Some(model);
                        }
                    }
                }
            }
        }
        let mut best = best?;

        let mut step = 0.05;
        let mut rounds = 0;
        while step > PARAM_MIN && rounds < MAX_SEARCH_ROUNDS {
            rounds += 1;
            let mut improved = false;
            for axis in 0..3 {
                for direction in [-1.0, 1.0] {
                    let mut candidate = best.params();
                    candidate[axis] = (candidate[axis] + direction * step).clamp(PARAM_MIN, PARAM_MAX);
                    if let Some(model) = evaluate(candidate) {
                        if model.sse < best.sse {
                            best = model;
                            improved = true;
                        }
                    }
                }
            }
            if !improved {
                step /= 2.0;
            }
        }

        debug!(
            alpha = best.alpha,
            beta = best.beta,
            gamma = best.gamma,
            sse = best.sse,
            rounds,
            "Holt-Winters parameters selected"
        );
        Some(best)
    }

    /// Point forecasts for the `steps` periods after the last observation
    pub fn forecast(&self, steps: usize) -> Vec<f64> {
        (1..=steps)
            .map(|h| {
                let idx = (self.n_obs + h - 1) % self.period;
                self.level + h as f64 * self.trend + self.seasonal[idx]
            })
            .collect()
    }

    /// `[alpha, beta, gamma]`
    pub fn params(&self) -> [f64; 3] {
        [self.alpha, self.beta, self.gamma]
    }

    /// In-sample one-step-ahead sum of squared errors
    pub fn sse(&self) -> f64 {
        self.sse
    }
}

// ============================================================================
// Box-Cox power transform
// ============================================================================

/// Box-Cox transform of a strictly positive value
pub fn box_cox(value: f64, lambda: f64) -> f64 {
    if lambda.abs() < 1e-12 {
        value.ln()
    } else {
        (value.powf(lambda) - 1.0) / lambda
    }
}

/// Inverse of [`box_cox`]; values outside the transform's range map to
/// zero (positive lambda) or infinity (negative lambda)
pub fn inverse_box_cox(value: f64, lambda: f64) -> f64 {
    if lambda.abs() < 1e-12 {
        return value.exp();
    }
    let base = lambda * value + 1.0;
    if base <= 0.0 {
        return if lambda > 0.0 { 0.0 } else { f64::INFINITY };
    }
    base.powf(1.0 / lambda)
}

/// Maximum-likelihood lambda over [-2, 2], or `None` if any value is not
/// strictly positive
pub fn box_cox_lambda(values: &[f64]) -> Option<f64> {
    if values.len() < 2 || values.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
        return None;
    }
    let n = values.len() as f64;
    let log_sum: f64 = values.iter().map(|v| v.ln()).sum();

    let log_likelihood = |lambda: f64| {
        let transformed: Vec<f64> = values.iter().map(|v| box_cox(*v, lambda)).collect();
        let var = population_variance(&transformed);
        if !(var.is_finite() && var > 0.0) {
            return f64::NEG_INFINITY;
        }
        (lambda - 1.0) * log_sum - n / 2.0 * var.ln()
    };

    (-200..=200)
        .map(|i| i as f64 / 100.0)
        .map(|lambda| (lambda, log_likelihood(lambda)))
        .filter(|(_, llf)| llf.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(lambda, _)| lambda)
}

// ============================================================================
// Forecast
// ============================================================================

/// Direction of the forecast relative to the history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Flat,
}

impl TrendDirection {
    fn classify(historical_mean: f64, forecast_mean: f64) -> Self {
        let tolerance = 1e-9 * historical_mean.abs().max(1.0);
        if forecast_mean > historical_mean + tolerance {
            TrendDirection::Increasing
        } else if forecast_mean < historical_mean - tolerance {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Flat
        }
    }
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendDirection::Increasing => write!(f, "Increasing"),
            TrendDirection::Decreasing => write!(f, "Decreasing"),
            TrendDirection::Flat => write!(f, "Flat"),
        }
    }
}

/// Smoothing parameters of a successful fit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingParams {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub box_cox_lambda: Option<f64>,
    pub sse: f64,
}

/// Sales forecast for the days following the history
#[derive(Debug, Clone)]
pub struct Forecast {
    points: Vec<(NaiveDate, f64)>,
    pub historical_mean: f64,
    pub forecast_mean: f64,
    pub trend: TrendDirection,
    /// Set when the flat fallback replaced the model
    pub low_confidence: bool,
    /// Why the fallback was used
    pub note: Option<String>,
    pub params: Option<SmoothingParams>,
    pub decomposition: Option<Decomposition>,
}

impl Forecast {
    /// `(date, predicted amount)` pairs, one per horizon day
    pub fn points(&self) -> &[(NaiveDate, f64)] {
        &self.points
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|(_, v)| *v).collect()
    }
}

impl fmt::Display for Forecast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Forecast Summary:")?;
        writeln!(f, "  Average Daily Sales (Historical): ${:.2}", self.historical_mean)?;
        writeln!(f, "  Average Daily Sales (Forecast): ${:.2}", self.forecast_mean)?;
        write!(f, "  Forecast Trend: {}", self.trend)?;
        if let Some(params) = &self.params {
            write!(
                f,
                "\n  Smoothing: alpha={:.4} beta={:.4} gamma={:.4}",
                params.alpha, params.beta, params.gamma
            )?;
            if let Some(lambda) = params.box_cox_lambda {
                write!(f, " box-cox lambda={:.2}", lambda)?;
            }
        }
        if let Some(decomposition) = &self.decomposition {
            write!(
                f,
                "\n  Trend strength: {:.3}, seasonal strength: {:.3}",
                decomposition.trend_strength(),
                decomposition.seasonal_strength()
            )?;
        }
        if self.low_confidence {
            write!(
                f,
                "\n  LOW CONFIDENCE: {}",
                self.note.as_deref().unwrap_or("flat continuation")
            )?;
        }
        Ok(())
    }
}

/// Forecast `config.horizon` days of sales after the last observed day
///
/// Errors only on an empty series; model failures produce a flat,
/// low-confidence forecast instead.
pub fn forecast_sales(series: &DailySalesSeries, config: &AnalyticsConfig) -> crate::Result<Forecast> {
    let Some(last_date) = series.last_date() else {
        anyhow::bail!("Cannot forecast an empty sales series");
    };
    let period = config.seasonal_period;
    let horizon = config.horizon;

    let values: Vec<f64> = series
        .amounts()
        .into_iter()
        .map(|v| if v.is_finite() { v.max(0.0) } else { 0.0 })
        .collect();
    let historical_mean = mean(&values);

    let decomposition = decompose(&values, period);
    if decomposition.is_none() {
        debug!(observations = values.len(), "Series too short for decomposition");
    }

    let fitted = fit_model(&values, period, horizon);
    let (predictions, params, note) = match fitted {
        Ok((predictions, params)) => (predictions, Some(params), None),
        Err(reason) => {
            warn!(%reason, "Falling back to flat forecast");
            let last = values.last().copied().unwrap_or(0.0);
            (vec![last; horizon], None, Some(reason))
        }
    };

    let points: Vec<(NaiveDate, f64)> = predictions
        .into_iter()
        .enumerate()
        .map(|(i, v)| (last_date + Duration::days(i as i64 + 1), v))
        .collect();
    let forecast_mean = mean(&points.iter().map(|(_, v)| *v).collect::<Vec<_>>());
    let trend = TrendDirection::classify(historical_mean, forecast_mean);

    info!(
        horizon,
        historical_mean,
        forecast_mean,
        %trend,
        low_confidence = note.is_some(),
        "Sales forecast produced"
    );

    Ok(Forecast {
        points,
        historical_mean,
        forecast_mean,
        trend,
        low_confidence: note.is_some(),
        note,
        params,
        decomposition,
    })
}

/// Fit on (possibly transformed) values and return non-negative forecasts
fn fit_model(values: &[f64], period: usize, horizon: usize) -> Result<(Vec<f64>, SmoothingParams), String> {
    if values.len() < period * 2 {
        return Err(format!(
            "only {} observations, at least {} required",
            values.len(),
            period * 2
        ));
    }
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if max - min <= 1e-12 * mean(values).abs().max(1.0) {
        return Err("series is constant".to_string());
    }

    let lambda = box_cox_lambda(values);
    let working: Vec<f64> = match lambda {
        Some(lambda) => values.iter().map(|v| box_cox(*v, lambda)).collect(),
        None => values.to_vec(),
    };

    let model = HoltWinters::fit(&working, period)
        .ok_or_else(|| "smoothing fit did not converge".to_string())?;

    let predictions: Vec<f64> = model
        .forecast(horizon)
        .into_iter()
        .map(|v| match lambda {
            Some(lambda) => inverse_box_cox(v, lambda),
            None => v,
        })
        .map(|v| v.max(0.0))
        .collect();
    if predictions.iter().any(|v| !v.is_finite()) {
        return Err("smoothing fit produced non-finite forecasts".to_string());
    }

    let [alpha, beta, gamma] = model.params();
    Ok((
        predictions,
        SmoothingParams {
            alpha,
            beta,
            gamma,
            box_cox_lambda: lambda,
            sse: model.sse(),
        },
    ))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series_from(values: &[f64]) -> DailySalesSeries {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        DailySalesSeries::resample(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| (start + Duration::days(i as i64), *v)),
        )
    }

    const WEEKLY: [f64; 7] = [-20.0, -5.0, 0.0, 5.0, 10.0, 25.0, -15.0];

    fn seasonal_trend(days: usize) -> Vec<f64> {
        (0..days)
            .map(|i| 200.0 + 2.0 * i as f64 + WEEKLY[i % 7])
            .collect()
    }

    #[test]
    fn test_flat_series_forecasts_flat() {
        let series = series_from(&[250.0; 60]);
        let forecast = forecast_sales(&series, &AnalyticsConfig::default()).unwrap();

        assert_eq!(forecast.points().len(), 30);
        for value in forecast.values() {
            assert!((value - 250.0).abs() < 1e-6);
        }
        assert_eq!(forecast.trend, TrendDirection::Flat);
        assert!(forecast.low_confidence);
    }

    #[test]
    fn test_forecast_dates_follow_history() {
        let series = series_from(&seasonal_trend(56));
        let config = AnalyticsConfig { horizon: 10, ..Default::default() };
        let forecast = forecast_sales(&series, &config).unwrap();

        assert_eq!(forecast.points().len(), 10);
        let mut expected = series.last_date().unwrap();
        for (date, _) in forecast.points() {
            expected = expected.succ_opt().unwrap();
            assert_eq!(*date, expected);
        }
    }

    #[test]
    fn test_trending_series_is_increasing() {
        let series = series_from(&seasonal_trend(84));
        let forecast = forecast_sales(&series, &AnalyticsConfig::default()).unwrap();

        assert!(!forecast.low_confidence);
        assert_eq!(forecast.trend, TrendDirection::Increasing);
        assert!(forecast.values().iter().all(|v| v.is_finite() && *v >= 0.0));

        let params = forecast.params.unwrap();
        for p in [params.alpha, params.beta, params.gamma] {
            assert!(p > 0.0 && p < 1.0);
        }
        assert!(params.box_cox_lambda.is_some());
        assert!(forecast.decomposition.is_some());
    }

    #[test]
    fn test_short_series_falls_back() {
        let series = series_from(&[10.0, 12.0, 9.0, 11.0, 14.0]);
        let forecast = forecast_sales(&series, &AnalyticsConfig::default()).unwrap();

        assert!(forecast.low_confidence);
        assert!(forecast.decomposition.is_none());
        assert!(forecast.values().iter().all(|v| *v == 14.0));
    }

    #[test]
    fn test_negative_values_clamped() {
        let mut values = seasonal_trend(28);
        values[3] = -50.0;
        let forecast = forecast_sales(&series_from(&values), &AnalyticsConfig::default()).unwrap();

        // Zero in the history disables the power transform
        assert!(forecast.values().iter().all(|v| *v >= 0.0));
        if let Some(params) = forecast.params {
            assert!(params.box_cox_lambda.is_none());
        }
    }

    #[test]
    fn test_empty_series_is_an_error() {
        let empty = DailySalesSeries::default();
        assert!(forecast_sales(&empty, &AnalyticsConfig::default()).is_err());
    }

    #[test]
    fn test_decomposition_recovers_weekly_pattern() {
        let values = seasonal_trend(70);
        let decomposition = decompose(&values, 7).unwrap();

        assert_eq!(decomposition.trend.len(), 70);
        assert!(decomposition.trend[..3].iter().all(Option::is_none));
        assert!(decomposition.trend[67..].iter().all(Option::is_none));
        assert!(decomposition.trend[3..67].iter().all(Option::is_some));

        let weekly_mean = WEEKLY.iter().sum::<f64>() / 7.0;
        for (i, s) in decomposition.seasonal.iter().take(7).enumerate() {
            assert!((s - (WEEKLY[i] - weekly_mean)).abs() < 1e-9);
        }
        assert!(decomposition.trend_strength() > 0.99);
        assert!(decomposition.seasonal_strength() > 0.99);
    }

    #[test]
    fn test_decomposition_needs_two_periods() {
        assert!(decompose(&[1.0; 13], 7).is_none());
        assert!(decompose(&[1.0; 14], 7).is_some());
    }

    #[test]
    fn test_box_cox_round_trip() {
        for lambda in [-0.5, 0.0, 0.5, 1.0] {
            let transformed = box_cox(42.0, lambda);
            assert!((inverse_box_cox(transformed, lambda) - 42.0).abs() < 1e-9);
        }
        assert_eq!(box_cox_lambda(&[1.0, 0.0, 3.0]), None);
    }

    #[test]
    fn test_holt_winters_fixed_params() {
        let values = seasonal_trend(28);
        let model = HoltWinters::with_params(&values, 7, 0.3, 0.1, 0.2).unwrap();
        let forecast = model.forecast(7);
        assert_eq!(forecast.len(), 7);
        assert!(model.sse().is_finite());
        assert!(HoltWinters::with_params(&values[..10], 7, 0.3, 0.1, 0.2).is_none());
    }
}
