//! SegmentForge: customer segmentation, sales forecasting and LTV estimation
//!
//! This is the main entrypoint that orchestrates one analytics run, exports
//! the forecast and feature-importance tables and optionally renders charts.

use anyhow::{Context, Result};
use clap::Parser;
use segmentforge::data::{export_feature_importance, export_forecast};
use segmentforge::features::{daily_sales, DailySalesSeries};
use segmentforge::{run_pipeline, viz, Args, CsvStore, RunReport, TransactionStore};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let config = args.config()?;
    let as_of = args.as_of()?;
    let start_time = Instant::now();

    // The store lives only for the duration of the run
    let (report, daily) = {
        let mut store = CsvStore::open(&args.transactions, Some(args.segments_out.clone()))?;
        let report = run_pipeline(&mut store, &config, as_of)?;
        let daily = daily_sales(&store.transactions()?);
        (report, daily)
    };

    println!("{}", report);

    export_artifacts(&args, &report)?;
    if let Some(plots_dir) = &args.plots_dir {
        render_plots(plots_dir, &report, &daily)?;
    }

    info!(
        elapsed_s = start_time.elapsed().as_secs_f64(),
        segments = %args.segments_out.display(),
        "Pipeline complete"
    );
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing(verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "segmentforge=debug"
    } else {
        "segmentforge=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    Ok(())
}

fn export_artifacts(args: &Args, report: &RunReport) -> Result<()> {
    fs::create_dir_all(&args.artifacts_dir)
        .with_context(|| format!("creating {}", args.artifacts_dir.display()))?;

    let forecast_path = args.artifacts_dir.join("sales_forecast.csv");
    export_forecast(&report.forecast, &forecast_path)?;
    info!(path = %forecast_path.display(), "Forecast table saved");

    match report.ltv.report() {
        Some(ltv) => {
            let path = args.artifacts_dir.join("feature_importance.csv");
            export_feature_importance(&ltv.importance, &path)?;
            info!(path = %path.display(), "Feature importance table saved");
        }
        None => warn!("No LTV model; feature importance not exported"),
    }
    Ok(())
}

fn render_plots(
    plots_dir: &Path,
    report: &RunReport,
    daily: &DailySalesSeries,
) -> Result<()> {
    fs::create_dir_all(plots_dir)
        .with_context(|| format!("creating {}", plots_dir.display()))?;

    viz::render_forecast(daily, &report.forecast, &plots_dir.join("sales_forecast.svg"))?;
    viz::render_segments(
        &report.features,
        &report.segmentation.kmeans,
        &plots_dir.join("kmeans_segments.svg"),
    )?;
    viz::render_segments(
        &report.features,
        &report.segmentation.dbscan,
        &plots_dir.join("dbscan_segments.svg"),
    )?;
    if let Some(ltv) = report.ltv.report() {
        viz::render_feature_importance(&ltv.importance, &plots_dir.join("feature_importance.svg"))?;
    }
    Ok(())
}
