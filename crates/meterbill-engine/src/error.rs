//! Engine error taxonomy.
//!
//! The job queue keys retry behavior off this taxonomy: validation and
//! not-found failures are fatal (the job is marked failed and never retried),
//! rate limits and transient database failures are re-thrown for
//! retry-with-backoff. The engine itself never retries; see
//! `EngineError::is_retryable`.

use meterbill_core::{BillingError, InvoiceStatus};
use meterbill_store::StoreError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while processing a billing job.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed job payload or violated input invariant. Fatal, not retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced record does not exist. Fatal, not retried.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("subscription", "invoice", ...).
        entity: &'static str,
        /// The id that was not found.
        id: String,
    },

    /// A payment event arrived for an invoice in a terminal status. Fatal:
    /// a later successful payment on a voided invoice is an error condition,
    /// not a silent reconciliation.
    #[error("invoice {invoice_id} is closed ({status})")]
    InvoiceClosed {
        /// The invoice.
        invoice_id: String,
        /// Its current status.
        status: InvoiceStatus,
    },

    /// A uniqueness constraint the caller did not anticipate (duplicate
    /// invoice number, second active subscription). Fatal.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A downstream dependency throttled the call. Logged distinctly and
    /// re-thrown so the queue retries with backoff.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited {
        /// Retry-after hint, when the backend supplied one.
        retry_after_secs: Option<u64>,
    },

    /// Store failure that is not one of the expected constraint outcomes.
    #[error("store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    /// Whether the job queue should retry the job after this error.
    ///
    /// Transient database failures and rate limits retry; everything else is
    /// fatal and re-invoking with identical inputs would fail identically.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Store(StoreError::Database(_))
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::RateLimited { retry_after_secs } => {
                tracing::warn!(
                    retry_after_secs = ?retry_after_secs,
                    "store rate limited; job will be retried by the queue"
                );
                Self::RateLimited { retry_after_secs }
            }
            StoreError::InvoiceClosed { invoice_id, status } => {
                Self::InvoiceClosed { invoice_id, status }
            }
            StoreError::DuplicateInvoiceNumber { .. }
            | StoreError::ActiveSubscriptionExists { .. } => Self::Conflict(err.to_string()),
            StoreError::ScopeViolation { .. } | StoreError::InvalidAmount { .. } => {
                Self::Validation(err.to_string())
            }
            StoreError::Database(_) | StoreError::Serialization(_) => Self::Store(err),
        }
    }
}

impl From<BillingError> for EngineError {
    fn from(err: BillingError) -> Self {
        Self::Validation(err.to_string())
    }
}
