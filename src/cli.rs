//! Command-line interface definitions and argument parsing

use crate::config::AnalyticsConfig;
use crate::data::parse_timestamp;
use chrono::NaiveDateTime;
use clap::Parser;
use std::path::PathBuf;

/// Customer segmentation, sales forecasting and lifetime-value estimation
/// over a transaction snapshot
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the transaction CSV
    #[arg(short, long, env = "SEGMENTFORGE_TRANSACTIONS", default_value = "transactions.csv")]
    pub transactions: PathBuf,

    /// Where segment assignments are written
    #[arg(long, env = "SEGMENTFORGE_SEGMENTS_OUT", default_value = "customer_segments.csv")]
    pub segments_out: PathBuf,

    /// Directory for the forecast and feature-importance tables
    #[arg(long, env = "SEGMENTFORGE_ARTIFACTS_DIR", default_value = "artifacts")]
    pub artifacts_dir: PathBuf,

    /// Directory for SVG charts; no charts are rendered when absent
    #[arg(long, env = "SEGMENTFORGE_PLOTS_DIR")]
    pub plots_dir: Option<PathBuf>,

    /// Reference instant for recency (RFC 3339 or YYYY-MM-DD).
    /// Defaults to the latest transaction in the snapshot
    #[arg(long, env = "SEGMENTFORGE_AS_OF")]
    pub as_of: Option<String>,

    /// Number of clusters for K-Means
    #[arg(short = 'k', long, env = "SEGMENTFORGE_CLUSTERS", default_value = "5")]
    pub clusters: usize,

    /// DBSCAN neighbourhood radius (scaled units)
    #[arg(long, env = "SEGMENTFORGE_EPS", default_value = "0.5")]
    pub eps: f64,

    /// DBSCAN minimum neighbourhood size
    #[arg(long, env = "SEGMENTFORGE_MIN_SAMPLES", default_value = "5")]
    pub min_samples: usize,

    /// Forecast horizon in days
    #[arg(long, env = "SEGMENTFORGE_HORIZON", default_value = "30")]
    pub horizon: usize,

    /// Seasonal period of daily sales in days
    #[arg(long, env = "SEGMENTFORGE_SEASONAL_PERIOD", default_value = "7")]
    pub seasonal_period: usize,

    /// Upper bound applied to the LTV target
    #[arg(long, env = "SEGMENTFORGE_LTV_CAP", default_value = "1000000")]
    pub ltv_cap: f64,

    /// Random seed for clustering and the LTV split
    #[arg(long, env = "SEGMENTFORGE_SEED", default_value = "42")]
    pub seed: u64,

    /// K-Means iteration cap
    #[arg(long, env = "SEGMENTFORGE_MAX_ITERS", default_value = "300")]
    pub max_iters: u64,

    /// Centroid shift below which K-Means stops
    #[arg(long, env = "SEGMENTFORGE_TOLERANCE", default_value = "1e-4")]
    pub tolerance: f64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Validated analytics options
    pub fn config(&self) -> crate::Result<AnalyticsConfig> {
        let config = AnalyticsConfig {
            n_clusters: self.clusters,
            eps: self.eps,
            min_samples: self.min_samples,
            horizon: self.horizon,
            seasonal_period: self.seasonal_period,
            ltv_cap: self.ltv_cap,
            seed: self.seed,
            max_iters: self.max_iters,
            tolerance: self.tolerance,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse `--as-of`, if given
    pub fn as_of(&self) -> crate::Result<Option<NaiveDateTime>> {
        match &self.as_of {
            Some(value) => match parse_timestamp(value) {
                Some(instant) => Ok(Some(instant)),
                None => anyhow::bail!("Invalid --as-of value: {}", value),
            },
            None => Ok(None),
        }
    }
}
