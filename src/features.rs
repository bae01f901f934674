//! Per-customer and per-day feature derivation
//!
//! All functions here are pure reductions over an in-memory transaction set.
//! Recency is always measured against an explicit `as_of` instant.

use crate::data::{CustomerAggregate, TransactionRecord};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet};

/// Column order of [`CustomerFeatureVector::as_row`]
pub const SEGMENT_FEATURES: [&str; 5] = [
    "transaction_count",
    "total_spent",
    "avg_transaction_value",
    "days_since_last_purchase",
    "unique_categories",
];

/// Column order of [`CustomerLtvRecord::features`]
pub const LTV_FEATURES: [&str; 5] = [
    "frequency",
    "monetary",
    "avg_order_value",
    "customer_age",
    "purchase_frequency",
];

/// Behavioural features of one customer, used for segmentation
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerFeatureVector {
    pub customer_id: String,
    pub transaction_count: usize,
    pub total_spent: f64,
    pub avg_transaction_value: f64,
    pub days_since_last_purchase: i64,
    pub unique_categories: usize,
}

impl CustomerFeatureVector {
    /// Build from an aggregate row, measuring recency against `as_of`
    pub fn from_aggregate(aggregate: &CustomerAggregate, as_of: NaiveDateTime) -> Self {
        let days = (as_of - aggregate.last_purchase).num_days().max(0);
        Self {
            customer_id: aggregate.customer_id.clone(),
            transaction_count: aggregate.transaction_count,
            total_spent: aggregate.total_spent,
            avg_transaction_value: aggregate.avg_transaction_value,
            days_since_last_purchase: days,
            unique_categories: aggregate.unique_categories,
        }
    }

    /// Numeric values in [`SEGMENT_FEATURES`] order
    pub fn as_row(&self) -> [f64; 5] {
        [
            self.transaction_count as f64,
            self.total_spent,
            self.avg_transaction_value,
            self.days_since_last_purchase as f64,
            self.unique_categories as f64,
        ]
    }
}

/// Group transactions by customer
///
/// Only customers with at least one transaction appear. Output is ordered by
/// customer id.
pub fn aggregate_customers(records: &[TransactionRecord]) -> Vec<CustomerAggregate> {
    struct Acc<'a> {
        transactions: BTreeSet<&'a str>,
        total: f64,
        rows: usize,
        last: NaiveDateTime,
        categories: BTreeSet<&'a str>,
    }

    let mut groups: BTreeMap<&str, Acc> = BTreeMap::new();
    for record in records {
        let acc = groups.entry(record.customer_id.as_str()).or_insert_with(|| Acc {
            transactions: BTreeSet::new(),
            total: 0.0,
            rows: 0,
            last: record.timestamp,
            categories: BTreeSet::new(),
        });
        acc.transactions.insert(record.transaction_id.as_str());
        acc.total += record.amount;
        acc.rows += 1;
        acc.last = acc.last.max(record.timestamp);
        acc.categories.insert(record.category.as_str());
    }

    groups
        .into_iter()
        .map(|(customer_id, acc)| CustomerAggregate {
            customer_id: customer_id.to_string(),
            transaction_count: acc.transactions.len(),
            total_spent: acc.total,
            avg_transaction_value: acc.total / acc.rows as f64,
            last_purchase: acc.last,
            unique_categories: acc.categories.len(),
        })
        .collect()
}

/// One feature vector per aggregate row
pub fn build_customer_features(
    aggregates: &[CustomerAggregate],
    as_of: NaiveDateTime,
) -> Vec<CustomerFeatureVector> {
    aggregates
        .iter()
        .map(|aggregate| CustomerFeatureVector::from_aggregate(aggregate, as_of))
        .collect()
}

/// Aggregate and featurise a raw transaction set in one step
pub fn customer_features(
    records: &[TransactionRecord],
    as_of: NaiveDateTime,
) -> Vec<CustomerFeatureVector> {
    build_customer_features(&aggregate_customers(records), as_of)
}

/// Stack feature vectors into an `(n_customers, 5)` matrix
pub fn feature_matrix(features: &[CustomerFeatureVector]) -> Array2<f64> {
    let mut matrix = Array2::zeros((features.len(), SEGMENT_FEATURES.len()));
    for (mut row, feature) in matrix.outer_iter_mut().zip(features) {
        for (cell, value) in row.iter_mut().zip(feature.as_row()) {
            *cell = value;
        }
    }
    matrix
}

/// Contiguous daily sales totals
///
/// Days without transactions are present with an amount of zero.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DailySalesSeries {
    points: Vec<(NaiveDate, f64)>,
}

impl DailySalesSeries {
    /// Sum observations per day and fill every gap between the first and
    /// last observed day with zero
    pub fn resample<I>(observations: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, f64)>,
    {
        let mut totals: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for (date, amount) in observations {
            *totals.entry(date).or_insert(0.0) += amount;
        }

        let (Some(&first), Some(&last)) = (totals.keys().next(), totals.keys().next_back())
        else {
            return Self::default();
        };

        let days = (last - first).num_days() as usize + 1;
        let points = (0..days)
            .map(|offset| {
                let date = first + Duration::days(offset as i64);
                (date, totals.get(&date).copied().unwrap_or(0.0))
            })
            .collect();
        Self { points }
    }

    pub fn points(&self) -> &[(NaiveDate, f64)] {
        &self.points
    }

    pub fn amounts(&self) -> Vec<f64> {
        self.points.iter().map(|(_, amount)| *amount).collect()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.first().map(|(date, _)| *date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|(date, _)| *date)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        self.points.iter().map(|(_, amount)| amount).sum::<f64>() / self.points.len() as f64
    }
}

/// Daily sales over the full observed date range
pub fn daily_sales(records: &[TransactionRecord]) -> DailySalesSeries {
    DailySalesSeries::resample(records.iter().map(|r| (r.timestamp.date(), r.amount)))
}

/// Recency/frequency/monetary record with the derived LTV target
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerLtvRecord {
    pub customer_id: String,
    pub frequency: usize,
    pub monetary: f64,
    pub avg_order_value: f64,
    /// Days between first and last purchase, at least 1
    pub customer_age: i64,
    pub purchase_frequency: f64,
    /// Annualised value, capped
    pub ltv: f64,
}

impl CustomerLtvRecord {
    /// Numeric values in [`LTV_FEATURES`] order
    pub fn features(&self) -> [f64; 5] {
        [
            self.frequency as f64,
            self.monetary,
            self.avg_order_value,
            self.customer_age as f64,
            self.purchase_frequency,
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.features().iter().all(|v| v.is_finite()) && self.ltv.is_finite()
    }
}

/// Derive one LTV record per customer, capping the target at `ltv_cap`
pub fn ltv_records(records: &[TransactionRecord], ltv_cap: f64) -> Vec<CustomerLtvRecord> {
    let mut spans: BTreeMap<&str, (usize, f64, NaiveDateTime, NaiveDateTime)> = BTreeMap::new();
    for record in records {
        let entry = spans
            .entry(record.customer_id.as_str())
            .or_insert((0, 0.0, record.timestamp, record.timestamp));
        entry.0 += 1;
        entry.1 += record.amount;
        entry.2 = entry.2.min(record.timestamp);
        entry.3 = entry.3.max(record.timestamp);
    }

    spans
        .into_iter()
        .map(|(customer_id, (frequency, monetary, first, last))| {
            let avg_order_value = monetary / frequency as f64;
            let customer_age = (last - first).num_days().max(1);
            let purchase_frequency = frequency as f64 / customer_age as f64;
            let ltv = (avg_order_value * purchase_frequency * 365.0).min(ltv_cap);

            CustomerLtvRecord {
                customer_id: customer_id.to_string(),
                frequency,
                monetary,
                avg_order_value,
                customer_age,
                purchase_frequency,
                ltv,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(date: &str) -> NaiveDateTime {
        crate::data::parse_timestamp(date).unwrap()
    }

    fn record(customer: &str, id: &str, date: &str, amount: f64, category: &str) -> TransactionRecord {
        TransactionRecord {
            customer_id: customer.to_string(),
            transaction_id: id.to_string(),
            timestamp: ts(date),
            amount,
            category: category.to_string(),
            country: "Spain".to_string(),
        }
    }

    fn sample() -> Vec<TransactionRecord> {
        vec![
            record("A", "1", "2024-02-01 10:00:00", 20.0, "Books"),
            record("B", "2", "2024-02-02 11:00:00", 100.0, "Garden"),
            record("A", "3", "2024-02-04 09:00:00", 40.0, "Toys"),
            record("A", "4", "2024-02-04 15:00:00", 60.0, "Books"),
        ]
    }

    #[test]
    fn test_only_customers_with_transactions_appear() {
        let features = customer_features(&sample(), ts("2024-02-10"));
        let ids: Vec<&str> = features.iter().map(|f| f.customer_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert!(customer_features(&[], ts("2024-02-10")).is_empty());
    }

    #[test]
    fn test_customer_feature_values() {
        let features = customer_features(&sample(), ts("2024-02-10"));
        let a = &features[0];
        assert_eq!(a.transaction_count, 3);
        assert!((a.total_spent - 120.0).abs() < 1e-9);
        assert!((a.avg_transaction_value - 40.0).abs() < 1e-9);
        assert_eq!(a.days_since_last_purchase, 5);
        assert_eq!(a.unique_categories, 2);

        let b = &features[1];
        assert_eq!(b.days_since_last_purchase, 7);
    }

    #[test]
    fn test_recency_uses_single_reference_instant() {
        // An as_of before the last purchase never yields negative recency
        let features = customer_features(&sample(), ts("2024-02-01"));
        assert!(features.iter().all(|f| f.days_since_last_purchase >= 0));
    }

    #[test]
    fn test_feature_matrix_shape() {
        let features = customer_features(&sample(), ts("2024-02-10"));
        let matrix = feature_matrix(&features);
        assert_eq!(matrix.shape(), &[2, 5]);
        assert_eq!(matrix[[0, 0]], 3.0);
        assert_eq!(matrix[[1, 1]], 100.0);
    }

    #[test]
    fn test_resample_fills_gaps_with_zero() {
        let day = |d: u32| NaiveDate::from_ymd_opt(2024, 5, d).unwrap();
        let series = DailySalesSeries::resample(vec![(day(1), 10.0), (day(2), 5.0), (day(4), 7.0), (day(2), 1.0)]);

        assert_eq!(
            series.points(),
            &[(day(1), 10.0), (day(2), 6.0), (day(3), 0.0), (day(4), 7.0)]
        );
        assert_eq!(series.first_date(), Some(day(1)));
        assert_eq!(series.last_date(), Some(day(4)));
    }

    #[test]
    fn test_daily_sales_from_transactions() {
        let series = daily_sales(&sample());
        assert_eq!(series.amounts(), vec![20.0, 100.0, 0.0, 100.0]);
        assert!(DailySalesSeries::resample(Vec::new()).is_empty());
    }

    #[test]
    fn test_ltv_age_floor_for_single_day_customer() {
        let records = vec![
            record("S", "1", "2024-03-01 10:00:00", 50.0, "Books"),
            record("S", "2", "2024-03-01 10:00:00", 30.0, "Books"),
        ];
        let ltv = ltv_records(&records, 1_000_000.0);
        assert_eq!(ltv.len(), 1);
        assert_eq!(ltv[0].customer_age, 1);
        assert!(ltv[0].purchase_frequency.is_finite());
        assert!((ltv[0].purchase_frequency - 2.0).abs() < 1e-9);
        assert!((ltv[0].ltv - 40.0 * 2.0 * 365.0).abs() < 1e-6);
    }

    #[test]
    fn test_ltv_cap() {
        let records = vec![record("X", "1", "2024-03-01", 10_000.0, "Jewelry")];
        let ltv = ltv_records(&records, 1_000_000.0);
        assert_eq!(ltv[0].ltv, 1_000_000.0);
    }
}
