//! Error types for meterbill storage.

use meterbill_core::InvoiceStatus;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("subscription", "invoice", ...).
        entity: &'static str,
        /// The id that was not found.
        id: String,
    },

    /// The record exists but belongs to a different organization than the
    /// caller's claims.
    #[error("{entity} {id} is outside the caller's organization scope")]
    ScopeViolation {
        /// Entity kind.
        entity: &'static str,
        /// The id that was out of scope.
        id: String,
    },

    /// An invoice with this number already exists.
    #[error("duplicate invoice number: {number}")]
    DuplicateInvoiceNumber {
        /// The colliding number.
        number: String,
    },

    /// The organization already has an active-like subscription.
    #[error("organization {organization_id} already has active subscription {existing}")]
    ActiveSubscriptionExists {
        /// The organization.
        organization_id: String,
        /// The subscription already holding the active slot.
        existing: String,
    },

    /// The invoice is in a status that rejects this mutation.
    #[error("invoice {invoice_id} is closed ({status})")]
    InvoiceClosed {
        /// The invoice.
        invoice_id: String,
        /// Its current status.
        status: InvoiceStatus,
    },

    /// A payment amount that would violate balance monotonicity.
    #[error("invalid payment amount: {amount_cents}")]
    InvalidAmount {
        /// The offending amount in cents.
        amount_cents: i64,
    },

    /// The backing store throttled the caller. Remote `Store` implementations
    /// surface 429-equivalents here so the job queue can back off.
    #[error("store rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited {
        /// Retry-after hint, when the backend supplied one.
        retry_after_secs: Option<u64>,
    },
}
