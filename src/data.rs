//! Transaction store access using Polars
//!
//! The pipeline reads two views of the transaction table (per-customer
//! aggregates and raw transactions) and writes one segment row per customer
//! per clustering algorithm.

use crate::error::AnalyticsError;
use crate::features::aggregate_customers;
use crate::forecast::Forecast;
use crate::ltv::FeatureImportance;
use crate::model::Algorithm;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One row of the transaction table
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub customer_id: String,
    pub transaction_id: String,
    pub timestamp: NaiveDateTime,
    /// Non-negative monetary amount
    pub amount: f64,
    pub category: String,
    pub country: String,
}

/// Per-customer aggregate returned by the segmentation read query
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerAggregate {
    pub customer_id: String,
    pub transaction_count: usize,
    pub total_spent: f64,
    pub avg_transaction_value: f64,
    pub last_purchase: NaiveDateTime,
    pub unique_categories: usize,
}

/// Segment assignment written back to the store
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRow {
    pub customer_id: String,
    pub algorithm: Algorithm,
    pub segment_name: String,
    pub cluster_id: i64,
}

/// Relational view of the transaction history
///
/// Writes are keyed by `(customer_id, algorithm)`, so the K-Means and DBSCAN
/// rows for one customer never overwrite each other.
pub trait TransactionStore {
    /// Per-customer aggregates (transaction count, spend, recency, categories)
    fn customer_aggregates(&self) -> crate::Result<Vec<CustomerAggregate>>;

    /// Every transaction in the snapshot
    fn transactions(&self) -> crate::Result<Vec<TransactionRecord>>;

    /// Record a single segment assignment
    fn write_segment(&mut self, row: &SegmentRow) -> Result<(), AnalyticsError>;

    /// Commit buffered writes
    fn flush(&mut self) -> crate::Result<()>;
}

const COL_TRANSACTION_ID: &str = "transaction_id";
const COL_CUSTOMER_ID: &str = "customer_id";
const COL_DATE: &str = "transaction_date";
const COL_CATEGORY: &str = "product_category";
const COL_AMOUNT: &str = "total_amount";
const COL_COUNTRY: &str = "country";
const COL_TIMESTAMP: &str = "transaction_ts";

/// CSV-backed transaction store
///
/// The whole snapshot is read once on open. Segment writes are buffered and
/// written to `segments_path` on [`TransactionStore::flush`].
#[derive(Debug)]
pub struct CsvStore {
    records: Vec<TransactionRecord>,
    frame: DataFrame,
    customers: HashSet<String>,
    segments: BTreeMap<(String, Algorithm), SegmentRow>,
    segments_path: Option<PathBuf>,
}

impl CsvStore {
    /// Load a transaction CSV
    ///
    /// # Arguments
    /// * `file_path` - CSV with `transaction_id, customer_id, transaction_date,
    ///   product_category, total_amount, country` columns
    /// * `segments_path` - Destination for segment rows, or `None` to discard them
    pub fn open(file_path: &Path, segments_path: Option<PathBuf>) -> crate::Result<Self> {
        // Every column is read as text and typed below, so bad rows can be
        // reported by position instead of silently becoming nulls
        let raw = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .try_into_reader_with_file_path(Some(file_path.to_path_buf()))?
            .finish()
            .with_context(|| format!("reading transactions from {}", file_path.display()))?;

        let records = parse_records(&raw)?;
        if records.is_empty() {
            return Err(AnalyticsError::EmptyTransactionSet.into());
        }
        info!(
            rows = records.len(),
            path = %file_path.display(),
            "Loaded transaction snapshot"
        );

        let frame = records_to_frame(&records)?;
        let customers = records.iter().map(|r| r.customer_id.clone()).collect();

        Ok(Self {
            records,
            frame,
            customers,
            segments: BTreeMap::new(),
            segments_path,
        })
    }

    /// Segment rows accepted so far, ordered by customer then algorithm
    pub fn pending_segments(&self) -> impl Iterator<Item = &SegmentRow> {
        self.segments.values()
    }
}

impl TransactionStore for CsvStore {
    fn customer_aggregates(&self) -> crate::Result<Vec<CustomerAggregate>> {
        let grouped = self
            .frame
            .clone()
            .lazy()
            .group_by([col(COL_CUSTOMER_ID)])
            .agg([
                col(COL_TRANSACTION_ID).n_unique().alias("transaction_count"),
                col(COL_AMOUNT).sum().alias("total_spent"),
                col(COL_AMOUNT).mean().alias("avg_transaction_value"),
                col(COL_TIMESTAMP).max().alias("last_purchase_ts"),
                col(COL_CATEGORY).n_unique().alias("unique_categories"),
            ])
            .collect()?;

        let ids = text_column(&grouped, COL_CUSTOMER_ID)?;
        let counts = grouped.column("transaction_count")?.cast(&DataType::Int64)?;
        let totals = grouped.column("total_spent")?.cast(&DataType::Float64)?;
        let averages = grouped.column("avg_transaction_value")?.cast(&DataType::Float64)?;
        let last = grouped.column("last_purchase_ts")?.cast(&DataType::Int64)?;
        let categories = grouped.column("unique_categories")?.cast(&DataType::Int64)?;

        let mut aggregates = Vec::with_capacity(grouped.height());
        let columns = counts
            .i64()?
            .into_iter()
            .zip(totals.f64()?.into_iter())
            .zip(averages.f64()?.into_iter())
            .zip(last.i64()?.into_iter())
            .zip(categories.i64()?.into_iter());

        for (row, (customer_id, ((((count, total), avg), last_ts), cats))) in
            ids.into_iter().zip(columns).enumerate()
        {
            let malformed = |reason: &str| AnalyticsError::MalformedRecord {
                row,
                reason: reason.to_string(),
            };
            let customer_id = customer_id.ok_or_else(|| malformed("null customer id"))?;
            let last_ts = last_ts.ok_or_else(|| malformed("missing last purchase"))?;
            let last_purchase = DateTime::from_timestamp(last_ts, 0)
                .ok_or_else(|| malformed("last purchase out of range"))?
                .naive_utc();

            aggregates.push(CustomerAggregate {
                customer_id,
                transaction_count: count.unwrap_or(0).max(0) as usize,
                total_spent: total.unwrap_or(0.0),
                avg_transaction_value: avg.unwrap_or(0.0),
                last_purchase,
                unique_categories: cats.unwrap_or(0).max(0) as usize,
            });
        }

        // group_by output order is unspecified
        aggregates.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));
        debug!(customers = aggregates.len(), "Computed customer aggregates");
        Ok(aggregates)
    }

    fn transactions(&self) -> crate::Result<Vec<TransactionRecord>> {
        Ok(self.records.clone())
    }

    fn write_segment(&mut self, row: &SegmentRow) -> Result<(), AnalyticsError> {
        // Segment rows reference a customer of the transaction table
        if !self.customers.contains(&row.customer_id) {
            return Err(AnalyticsError::Persistence {
                customer_id: row.customer_id.clone(),
                algorithm: row.algorithm.to_string(),
                reason: "customer not present in transaction table".to_string(),
            });
        }
        self.segments
            .insert((row.customer_id.clone(), row.algorithm), row.clone());
        Ok(())
    }

    fn flush(&mut self) -> crate::Result<()> {
        let Some(path) = &self.segments_path else {
            warn!("No segment destination configured; {} rows discarded", self.segments.len());
            return Ok(());
        };

        let rows: Vec<&SegmentRow> = self.segments.values().collect();
        let frame = DataFrame::new(vec![
            Series::new(
                "customer_id",
                rows.iter().map(|r| r.customer_id.clone()).collect::<Vec<_>>(),
            ),
            Series::new(
                "algorithm",
                rows.iter().map(|r| r.algorithm.to_string()).collect::<Vec<_>>(),
            ),
            Series::new(
                "segment_name",
                rows.iter().map(|r| r.segment_name.clone()).collect::<Vec<_>>(),
            ),
            Series::new(
                "cluster_id",
                rows.iter().map(|r| r.cluster_id).collect::<Vec<_>>(),
            ),
        ])?;

        write_csv(frame, path)?;
        info!(rows = rows.len(), path = %path.display(), "Segments written");
        Ok(())
    }
}

/// Store over an in-memory transaction list
///
/// Writes for customers registered with [`InMemoryStore::reject_writes_for`]
/// fail, which lets callers exercise per-row persistence failures.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Vec<TransactionRecord>,
    rejected: HashSet<String>,
    segments: BTreeMap<(String, Algorithm), SegmentRow>,
    flushed: bool,
}

impl InMemoryStore {
    pub fn new(records: Vec<TransactionRecord>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn reject_writes_for(mut self, customer_id: &str) -> Self {
        self.rejected.insert(customer_id.to_string());
        self
    }

    pub fn segments(&self) -> Vec<&SegmentRow> {
        self.segments.values().collect()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }
}

impl TransactionStore for InMemoryStore {
    fn customer_aggregates(&self) -> crate::Result<Vec<CustomerAggregate>> {
        Ok(aggregate_customers(&self.records))
    }

    fn transactions(&self) -> crate::Result<Vec<TransactionRecord>> {
        Ok(self.records.clone())
    }

    fn write_segment(&mut self, row: &SegmentRow) -> Result<(), AnalyticsError> {
        if self.rejected.contains(&row.customer_id) {
            return Err(AnalyticsError::Persistence {
                customer_id: row.customer_id.clone(),
                algorithm: row.algorithm.to_string(),
                reason: "write rejected by store".to_string(),
            });
        }
        self.segments
            .insert((row.customer_id.clone(), row.algorithm), row.clone());
        Ok(())
    }

    fn flush(&mut self) -> crate::Result<()> {
        self.flushed = true;
        Ok(())
    }
}

/// Parse a timestamp in any of the layouts the transaction exports use
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    for layout in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, layout) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Write the forecast as a date-indexed table
pub fn export_forecast(forecast: &Forecast, path: &Path) -> crate::Result<()> {
    let frame = DataFrame::new(vec![
        Series::new(
            "date",
            forecast
                .points()
                .iter()
                .map(|(date, _)| date.format("%Y-%m-%d").to_string())
                .collect::<Vec<_>>(),
        ),
        Series::new(
            "predicted_amount",
            forecast.points().iter().map(|(_, v)| *v).collect::<Vec<_>>(),
        ),
    ])?;
    write_csv(frame, path)
}

/// Write the LTV feature-importance ranking
pub fn export_feature_importance(importance: &[FeatureImportance], path: &Path) -> crate::Result<()> {
    let frame = DataFrame::new(vec![
        Series::new(
            "feature",
            importance.iter().map(|f| f.feature.to_string()).collect::<Vec<_>>(),
        ),
        Series::new(
            "coefficient",
            importance.iter().map(|f| f.coefficient).collect::<Vec<_>>(),
        ),
        Series::new(
            "importance",
            importance.iter().map(|f| f.importance).collect::<Vec<_>>(),
        ),
    ])?;
    write_csv(frame, path)
}

fn write_csv(mut frame: DataFrame, path: &Path) -> crate::Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("creating {}", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut frame)?;
    Ok(())
}

fn text_column(frame: &DataFrame, name: &str) -> crate::Result<Vec<Option<String>>> {
    let series = frame
        .column(name)
        .map_err(|_| AnalyticsError::MissingColumn(name.to_string()))?;
    let values = series
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect();
    Ok(values)
}

fn parse_records(raw: &DataFrame) -> crate::Result<Vec<TransactionRecord>> {
    let transaction_ids = text_column(raw, COL_TRANSACTION_ID)?;
    let customer_ids = text_column(raw, COL_CUSTOMER_ID)?;
    let dates = text_column(raw, COL_DATE)?;
    let categories = text_column(raw, COL_CATEGORY)?;
    let amounts = text_column(raw, COL_AMOUNT)?;
    let countries = text_column(raw, COL_COUNTRY)?;

    let mut records = Vec::with_capacity(raw.height());
    for row in 0..raw.height() {
        let malformed = |reason: String| AnalyticsError::MalformedRecord { row: row + 1, reason };

        let customer_id = customer_ids[row]
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| malformed("missing customer id".to_string()))?;
        let transaction_id = transaction_ids[row]
            .clone()
            .ok_or_else(|| malformed("missing transaction id".to_string()))?;
        let raw_date = dates[row]
            .as_deref()
            .ok_or_else(|| malformed("missing transaction date".to_string()))?;
        let timestamp = parse_timestamp(raw_date)
            .ok_or_else(|| malformed(format!("unparseable date `{}`", raw_date)))?;
        let raw_amount = amounts[row]
            .as_deref()
            .ok_or_else(|| malformed("missing amount".to_string()))?;
        let amount: f64 = raw_amount
            .trim()
            .parse()
            .map_err(|_| malformed(format!("unparseable amount `{}`", raw_amount)))?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(malformed(format!("amount {} is not a non-negative number", amount)).into());
        }

        records.push(TransactionRecord {
            customer_id: customer_id.trim().to_string(),
            transaction_id,
            timestamp,
            amount,
            category: categories[row].clone().unwrap_or_else(|| "Unknown".to_string()),
            country: countries[row].clone().unwrap_or_else(|| "Unknown".to_string()),
        });
    }

    Ok(records)
}

fn records_to_frame(records: &[TransactionRecord]) -> crate::Result<DataFrame> {
    let frame = DataFrame::new(vec![
        Series::new(
            COL_CUSTOMER_ID,
            records.iter().map(|r| r.customer_id.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            COL_TRANSACTION_ID,
            records.iter().map(|r| r.transaction_id.clone()).collect::<Vec<_>>(),
        ),
        Series::new(
            COL_TIMESTAMP,
            records
                .iter()
                .map(|r| r.timestamp.and_utc().timestamp())
                .collect::<Vec<_>>(),
        ),
        Series::new(
            COL_AMOUNT,
            records.iter().map(|r| r.amount).collect::<Vec<_>>(),
        ),
        Series::new(
            COL_CATEGORY,
            records.iter().map(|r| r.category.clone()).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "transaction_id,customer_id,transaction_date,product_category,total_amount,country").unwrap();
        writeln!(file, "T1,C1,2024-01-01 10:00:00,Books,25.50,Germany").unwrap();
        writeln!(file, "T2,C1,2024-01-03 12:30:00,Toys,14.50,Germany").unwrap();
        writeln!(file, "T3,C1,2024-01-03 18:00:00,Books,60.00,Germany").unwrap();
        writeln!(file, "T4,C2,2024-01-02 09:15:00,Electronics,300.00,France").unwrap();
        file
    }

    #[test]
    fn test_open_and_read_transactions() {
        let file = create_test_csv();
        let store = CsvStore::open(file.path(), None).unwrap();

        let records = store.transactions().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].customer_id, "C1");
        assert_eq!(records[3].amount, 300.0);
        assert_eq!(records[3].country, "France");
    }

    #[test]
    fn test_customer_aggregates() {
        let file = create_test_csv();
        let store = CsvStore::open(file.path(), None).unwrap();

        let aggregates = store.customer_aggregates().unwrap();
        assert_eq!(aggregates.len(), 2);

        let c1 = &aggregates[0];
        assert_eq!(c1.customer_id, "C1");
        assert_eq!(c1.transaction_count, 3);
        assert!((c1.total_spent - 100.0).abs() < 1e-9);
        assert!((c1.avg_transaction_value - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(c1.unique_categories, 2);
        assert_eq!(c1.last_purchase, parse_timestamp("2024-01-03 18:00:00").unwrap());

        // Same grouping as the in-memory reduction
        let in_memory = aggregate_customers(&store.transactions().unwrap());
        for (polars_row, memory_row) in aggregates.iter().zip(in_memory.iter()) {
            assert_eq!(polars_row.customer_id, memory_row.customer_id);
            assert_eq!(polars_row.transaction_count, memory_row.transaction_count);
            assert_eq!(polars_row.unique_categories, memory_row.unique_categories);
            assert_eq!(polars_row.last_purchase, memory_row.last_purchase);
        }
    }

    #[test]
    fn test_rejects_negative_amount() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "transaction_id,customer_id,transaction_date,product_category,total_amount,country").unwrap();
        writeln!(file, "T1,C1,2024-01-01,Books,-5.0,Germany").unwrap();

        let err = CsvStore::open(file.path(), None).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_missing_column() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "transaction_id,customer_id,total_amount").unwrap();
        writeln!(file, "T1,C1,5.0").unwrap();

        let err = CsvStore::open(file.path(), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalyticsError>(),
            Some(AnalyticsError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_segment_writes_keyed_by_algorithm() {
        let file = create_test_csv();
        let out = NamedTempFile::new().unwrap();
        let mut store = CsvStore::open(file.path(), Some(out.path().to_path_buf())).unwrap();

        let kmeans = SegmentRow {
            customer_id: "C1".to_string(),
            algorithm: Algorithm::KMeans,
            segment_name: "KMeans_Segment_0".to_string(),
            cluster_id: 0,
        };
        let dbscan = SegmentRow {
            algorithm: Algorithm::Dbscan,
            segment_name: "Noise".to_string(),
            cluster_id: -1,
            ..kmeans.clone()
        };
        store.write_segment(&kmeans).unwrap();
        store.write_segment(&dbscan).unwrap();
        assert_eq!(store.pending_segments().count(), 2);

        let unknown = SegmentRow {
            customer_id: "C9".to_string(),
            ..kmeans.clone()
        };
        assert!(store.write_segment(&unknown).is_err());

        store.flush().unwrap();
        let written = std::fs::read_to_string(out.path()).unwrap();
        assert!(written.starts_with("customer_id,algorithm,segment_name,cluster_id"));
        assert!(written.contains("C1,KMeans,KMeans_Segment_0,0"));
        assert!(written.contains("C1,DBSCAN,Noise,-1"));
    }

    #[test]
    fn test_parse_timestamp_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-03-05 08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-05T08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-05T08:30:00Z"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-03-05"),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_timestamp("not a date"), None);
    }
}
