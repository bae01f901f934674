//! SVG charts of the pipeline outputs using Plotters
//!
//! Rendering only consumes finished results; nothing here feeds back into
//! the models.

use crate::features::{CustomerFeatureVector, DailySalesSeries};
use crate::forecast::Forecast;
use crate::ltv::FeatureImportance;
use crate::model::{ClusterLabel, Clustering};
use plotters::prelude::*;
use std::path::Path;
use tracing::info;

/// Color palette for different clusters
const CLUSTER_COLORS: [RGBColor; 5] = [RED, BLUE, GREEN, YELLOW, MAGENTA];

fn cluster_color(label: ClusterLabel) -> RGBColor {
    match label {
        ClusterLabel::Cluster(id) => CLUSTER_COLORS[id % CLUSTER_COLORS.len()],
        ClusterLabel::Noise => BLACK,
    }
}

fn bounds<I: Iterator<Item = f64>>(values: I) -> (f64, f64) {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((max - min) * 0.05).max(1.0);
    (min - pad, max + pad)
}

/// Historical daily sales followed by the forecast
///
/// The x axis counts days from the first observed date.
pub fn render_forecast(
    history: &DailySalesSeries,
    forecast: &Forecast,
    output_path: &Path,
) -> crate::Result<()> {
    if history.is_empty() {
        anyhow::bail!("Cannot plot an empty sales history");
    }
    let observed: Vec<(f64, f64)> = history
        .amounts()
        .into_iter()
        .enumerate()
        .map(|(day, amount)| (day as f64, amount))
        .collect();
    let predicted: Vec<(f64, f64)> = forecast
        .values()
        .into_iter()
        .enumerate()
        .map(|(step, amount)| ((history.len() + step) as f64, amount))
        .collect();

    let x_max = (observed.len() + predicted.len()) as f64;
    let (_, y_max) = bounds(observed.iter().chain(&predicted).map(|(_, y)| *y));

    let root = SVGBackend::new(output_path, (1000, 500)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Daily Sales Forecast", ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(0f64..x_max, 0f64..y_max)?;

    chart
        .configure_mesh()
        .x_desc("Day")
        .y_desc("Sales Amount")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart
        .draw_series(LineSeries::new(observed, &BLUE))?
        .label("Historical")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
    chart
        .draw_series(LineSeries::new(predicted, &RED))?
        .label(if forecast.low_confidence {
            "Forecast (low confidence)"
        } else {
            "Forecast"
        })
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;
    info!(path = %output_path.display(), "Forecast chart saved");
    Ok(())
}

/// Horizontal bars of absolute LTV coefficients
pub fn render_feature_importance(
    importance: &[FeatureImportance],
    output_path: &Path,
) -> crate::Result<()> {
    if importance.is_empty() {
        anyhow::bail!("No feature importance to plot");
    }
    let max_importance = importance
        .iter()
        .map(|i| i.importance)
        .fold(0.0f64, f64::max)
        .max(f64::EPSILON);
    let names: Vec<&str> = importance.iter().map(|i| i.feature).collect();

    let root = SVGBackend::new(output_path, (800, 400)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Feature Importance for LTV Prediction", ("sans-serif", 25))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(140)
        .build_cartesian_2d(0f64..(max_importance * 1.1), 0f64..(names.len() as f64))?;

    chart
        .configure_mesh()
        .disable_y_mesh()
        .y_labels(names.len() + 1)
        .y_label_formatter(&|y: &f64| {
            names
                .get(y.floor() as usize)
                .map(|name| name.to_string())
                .unwrap_or_default()
        })
        .x_desc("|coefficient|")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart.draw_series(importance.iter().enumerate().map(|(row, item)| {
        Rectangle::new(
            [(0.0, row as f64 + 0.1), (item.importance, row as f64 + 0.9)],
            BLUE.filled(),
        )
    }))?;

    root.present()?;
    info!(path = %output_path.display(), "Feature importance chart saved");
    Ok(())
}

/// Scatter of total spent against transaction count, colored by segment
pub fn render_segments(
    features: &[CustomerFeatureVector],
    clustering: &Clustering,
    output_path: &Path,
) -> crate::Result<()> {
    if features.is_empty() || features.len() != clustering.labels.len() {
        anyhow::bail!(
            "Cannot plot {} customers against {} labels",
            features.len(),
            clustering.labels.len()
        );
    }

    let (x_min, x_max) = bounds(features.iter().map(|f| f.transaction_count as f64));
    let (y_min, y_max) = bounds(features.iter().map(|f| f.total_spent));

    let root = SVGBackend::new(output_path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let title = format!("Customer Segments ({})", clustering.algorithm);
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;

    chart
        .configure_mesh()
        .x_desc("Transaction Count")
        .y_desc("Total Spent")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    for (label, _) in clustering.cluster_sizes() {
        let color = cluster_color(label);
        chart
            .draw_series(
                features
                    .iter()
                    .zip(&clustering.labels)
                    .filter(|(_, l)| **l == label)
                    .map(|(f, _)| {
                        Circle::new((f.transaction_count as f64, f.total_spent), 4, color.filled())
                    }),
            )?
            .label(label.to_string())
            .legend(move |(x, y)| Circle::new((x + 5, y), 4, color.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;
    info!(path = %output_path.display(), "Segment chart saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyticsConfig;
    use crate::forecast::forecast_sales;
    use crate::model::fit_kmeans;
    use crate::features::feature_matrix;
    use crate::scaler::StandardScaler;
    use chrono::{Duration, NaiveDate};
    use tempfile::tempdir;

    fn history() -> DailySalesSeries {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        DailySalesSeries::resample(
            (0..28).map(|d| (start + Duration::days(d), 100.0 + (d % 7) as f64 * 10.0)),
        )
    }

    fn customers() -> Vec<CustomerFeatureVector> {
        (0..8)
            .map(|i| CustomerFeatureVector {
                customer_id: format!("C{}", i),
                transaction_count: 1 + i * 2,
                total_spent: 50.0 * (i * i + 1) as f64,
                avg_transaction_value: 40.0 + i as f64,
                days_since_last_purchase: (30 - i * 3) as i64,
                unique_categories: 1 + i % 3,
            })
            .collect()
    }

    #[test]
    fn test_render_forecast() {
        let series = history();
        let forecast = forecast_sales(&series, &AnalyticsConfig::default()).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("forecast.svg");

        render_forecast(&series, &forecast, &path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_render_feature_importance() {
        let importance = vec![
            FeatureImportance { feature: "monetary", coefficient: -3.0, importance: 3.0 },
            FeatureImportance { feature: "frequency", coefficient: 1.5, importance: 1.5 },
        ];
        let dir = tempdir().unwrap();
        let path = dir.path().join("importance.svg");

        render_feature_importance(&importance, &path).unwrap();
        assert!(path.exists());
        assert!(render_feature_importance(&[], &dir.path().join("empty.svg")).is_err());
    }

    #[test]
    fn test_render_segments() {
        let features = customers();
        let scaled = StandardScaler::fit_transform(&feature_matrix(&features)).1;
        let config = AnalyticsConfig { n_clusters: 3, ..AnalyticsConfig::default() };
        let clustering = fit_kmeans(&scaled, &config).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("segments.svg");

        render_segments(&features, &clustering, &path).unwrap();
        assert!(path.exists());
    }
}
