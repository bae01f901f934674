//! SegmentForge: customer analytics over e-commerce transaction history
//!
//! Groups customers into behavioural segments with K-Means and DBSCAN,
//! forecasts daily sales with Holt-Winters smoothing and estimates customer
//! lifetime value with a linear model.

pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod forecast;
pub mod ltv;
pub mod model;
pub mod pipeline;
pub mod scaler;
pub mod viz;

// Re-export public items for easier access
pub use cli::Args;
pub use config::AnalyticsConfig;
pub use data::{CsvStore, InMemoryStore, SegmentRow, TransactionRecord, TransactionStore};
pub use error::AnalyticsError;
pub use forecast::{forecast_sales, Forecast, TrendDirection};
pub use ltv::{estimate_ltv, LtvOutcome};
pub use model::{segment_customers, Algorithm, ClusterLabel, Segmentation};
pub use pipeline::{run_pipeline, RunReport};
pub use scaler::StandardScaler;

/// Common result type used throughout the application
pub type Result<T> = anyhow::Result<T>;
