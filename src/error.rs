//! Error taxonomy for pipeline runs
//!
//! Input and persistence failures are errors. Numerical degeneracy inside a
//! single algorithm is not: those components return marked results instead.

use thiserror::Error;

/// Errors that abort a run or a single segment write
#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("transaction set is empty")]
    EmptyTransactionSet,

    #[error("malformed record at row {row}: {reason}")]
    MalformedRecord { row: usize, reason: String },

    #[error("missing column `{0}` in transaction data")]
    MissingColumn(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to persist {algorithm} segment for customer {customer_id}: {reason}")]
    Persistence {
        customer_id: String,
        algorithm: String,
        reason: String,
    },
}
