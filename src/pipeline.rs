//! One analytics run over a transaction snapshot
//!
//! Both store reads happen before any computation and every computation
//! finishes before the first segment write, so input errors abort the run
//! with nothing written.

use crate::config::AnalyticsConfig;
use crate::data::TransactionStore;
use crate::error::AnalyticsError;
use crate::features::{build_customer_features, daily_sales, ltv_records, CustomerFeatureVector};
use crate::forecast::{forecast_sales, Forecast};
use crate::ltv::{estimate_ltv, LtvOutcome};
use crate::model::{segment_customers, ClusterProfile, Clustering, Segmentation};
use chrono::NaiveDateTime;
use std::fmt;
use std::time::Instant;
use tracing::{info, warn};

/// Outcome of the segment write-back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistenceSummary {
    pub written: usize,
    /// One message per rejected row, plus a final one if the flush failed
    pub failures: Vec<String>,
}

/// Everything a run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub as_of: NaiveDateTime,
    pub n_transactions: usize,
    pub features: Vec<CustomerFeatureVector>,
    pub segmentation: Segmentation,
    pub forecast: Forecast,
    pub ltv: LtvOutcome,
    pub persistence: PersistenceSummary,
}

impl RunReport {
    pub fn n_customers(&self) -> usize {
        self.features.len()
    }
}

/// Run every component against `store`
///
/// `as_of` is the reference instant for recency; when absent the latest
/// transaction timestamp in the snapshot is used.
pub fn run_pipeline<S: TransactionStore>(
    store: &mut S,
    config: &AnalyticsConfig,
    as_of: Option<NaiveDateTime>,
) -> crate::Result<RunReport> {
    config.validate()?;
    let start = Instant::now();

    let aggregates = store.customer_aggregates()?;
    let transactions = store.transactions()?;
    if aggregates.is_empty() || transactions.is_empty() {
        return Err(AnalyticsError::EmptyTransactionSet.into());
    }

    let as_of = match as_of {
        Some(as_of) => as_of,
        None => transactions
            .iter()
            .map(|r| r.timestamp)
            .max()
            .ok_or(AnalyticsError::EmptyTransactionSet)?,
    };
    info!(
        customers = aggregates.len(),
        transactions = transactions.len(),
        %as_of,
        "Starting analytics run"
    );

    let features = build_customer_features(&aggregates, as_of);
    let segmentation = segment_customers(&features, config)?;
    let forecast = forecast_sales(&daily_sales(&transactions), config)?;
    let ltv = estimate_ltv(&ltv_records(&transactions, config.ltv_cap), config);

    let mut persistence = PersistenceSummary::default();
    for row in segmentation.segment_rows(&features) {
        match store.write_segment(&row) {
            Ok(()) => persistence.written += 1,
            Err(err) => {
                warn!(error = %err, "Segment write failed");
                persistence.failures.push(err.to_string());
            }
        }
    }
    if let Err(err) = store.flush() {
        warn!(error = %err, "Flushing segment rows failed");
        persistence
            .failures
            .push(format!("flushing segment rows failed: {:#}", err));
    }

    info!(
        written = persistence.written,
        failed = persistence.failures.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Analytics run complete"
    );

    Ok(RunReport {
        as_of,
        n_transactions: transactions.len(),
        features,
        segmentation,
        forecast,
        ltv,
        persistence,
    })
}

fn write_clustering(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    clustering: &Clustering,
    profiles: &[ClusterProfile],
) -> fmt::Result {
    writeln!(f, "=== {} ===", title)?;
    writeln!(f, "Clusters: {}", clustering.n_clusters)?;
    if clustering.noise_count() > 0 {
        writeln!(f, "Noise points: {}", clustering.noise_count())?;
    }
    if clustering.scores.degenerate {
        writeln!(f, "Scores: not meaningful (fewer than two clusters), reported as 0")?;
    } else {
        writeln!(f, "Silhouette Score: {:.3}", clustering.scores.silhouette)?;
        writeln!(f, "Calinski-Harabasz Score: {:.3}", clustering.scores.calinski_harabasz)?;
    }
    if let Some(inertia) = clustering.inertia {
        writeln!(f, "Within-cluster sum of squares: {:.2}", inertia)?;
    }
    for profile in profiles {
        writeln!(f, "{}", profile)?;
    }
    Ok(())
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Analysed {} transactions from {} customers (as of {})\n",
            self.n_transactions,
            self.n_customers(),
            self.as_of
        )?;

        write_clustering(
            f,
            "K-Means Clustering",
            &self.segmentation.kmeans,
            &self.segmentation.kmeans_profiles,
        )?;
        writeln!(f)?;
        write_clustering(
            f,
            "DBSCAN Clustering",
            &self.segmentation.dbscan,
            &self.segmentation.dbscan_profiles,
        )?;

        writeln!(f, "\n=== Sales Forecast ===")?;
        writeln!(f, "{}", self.forecast)?;

        writeln!(f, "\n=== Customer Lifetime Value ===")?;
        writeln!(f, "{}", self.ltv)?;

        writeln!(f, "\n=== Segment Persistence ===")?;
        write!(f, "Rows written: {}", self.persistence.written)?;
        for failure in &self.persistence.failures {
            write!(f, "\n  FAILED: {}", failure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryStore, TransactionRecord};
    use crate::model::Algorithm;
    use chrono::{Duration, NaiveDate};

    fn sample_records() -> Vec<TransactionRecord> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let mut records = Vec::new();
        for customer in 0..12 {
            for purchase in 0..(customer % 4 + 1) {
                records.push(TransactionRecord {
                    customer_id: format!("C{:02}", customer),
                    transaction_id: format!("T{:02}-{}", customer, purchase),
                    timestamp: start + Duration::days((customer * 3 + purchase * 5) as i64),
                    amount: 10.0 + (customer * 7 + purchase * 3) as f64,
                    category: ["Books", "Toys", "Garden"][purchase % 3].to_string(),
                    country: "UK".to_string(),
                });
            }
        }
        records
    }

    fn config() -> AnalyticsConfig {
        AnalyticsConfig {
            n_clusters: 3,
            min_samples: 2,
            ..AnalyticsConfig::default()
        }
    }

    #[test]
    fn test_run_writes_both_algorithms() {
        let mut store = InMemoryStore::new(sample_records());
        let report = run_pipeline(&mut store, &config(), None).unwrap();

        assert_eq!(report.n_customers(), 12);
        assert_eq!(report.persistence.written, 24);
        assert!(report.persistence.failures.is_empty());
        assert!(store.is_flushed());

        let kmeans = store
            .segments()
            .iter()
            .filter(|row| row.algorithm == Algorithm::KMeans)
            .count();
        assert_eq!(kmeans, 12);
        assert_eq!(report.forecast.points().len(), 30);
    }

    #[test]
    fn test_as_of_defaults_to_latest_transaction() {
        let records = sample_records();
        let latest = records.iter().map(|r| r.timestamp).max().unwrap();
        let mut store = InMemoryStore::new(records);

        let report = run_pipeline(&mut store, &config(), None).unwrap();
        assert_eq!(report.as_of, latest);
        assert!(report.features.iter().any(|f| f.days_since_last_purchase == 0));
    }

    #[test]
    fn test_write_failures_are_reported_per_row() {
        let mut store = InMemoryStore::new(sample_records()).reject_writes_for("C03");
        let report = run_pipeline(&mut store, &config(), None).unwrap();

        assert_eq!(report.persistence.written, 22);
        assert_eq!(report.persistence.failures.len(), 2);
        assert!(report.persistence.failures.iter().all(|m| m.contains("C03")));
        assert!(report.to_string().contains("FAILED"));
    }

    #[test]
    fn test_empty_store_aborts_before_writing() {
        let mut store = InMemoryStore::new(Vec::new());
        let err = run_pipeline(&mut store, &config(), None).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<AnalyticsError>(),
            Some(AnalyticsError::EmptyTransactionSet)
        ));
        assert!(store.segments().is_empty());
        assert!(!store.is_flushed());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut store = InMemoryStore::new(sample_records());
        let bad = AnalyticsConfig {
            n_clusters: 0,
            ..AnalyticsConfig::default()
        };
        assert!(run_pipeline(&mut store, &bad, None).is_err());
        assert!(store.segments().is_empty());
    }
}
