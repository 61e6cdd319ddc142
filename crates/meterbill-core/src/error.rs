//! Error types for meterbill core validation.

use chrono::{DateTime, Utc};

use crate::ids::IdError;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors raised by core-type construction and validation.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// A billing period whose end does not follow its start.
    #[error("invalid period: end {end} is not after start {start}")]
    InvalidPeriod {
        /// Period start.
        start: DateTime<Utc>,
        /// Period end.
        end: DateTime<Utc>,
    },

    /// A tax rate outside the 0..=10000 basis-point range.
    #[error("invalid tax rate: {bps} bps (must be 0..=10000)")]
    InvalidTaxRate {
        /// The offending rate in basis points.
        bps: u32,
    },

    /// A usage quantity below zero.
    #[error("negative usage quantity for feature {feature_key}: {quantity}")]
    NegativeQuantity {
        /// The feature the quantity was reported for.
        feature_key: String,
        /// The offending quantity.
        quantity: rust_decimal::Decimal,
    },

    /// A money computation that does not fit in `i64` cents.
    #[error("amount overflow in {context}")]
    AmountOverflow {
        /// What was being computed.
        context: String,
    },

    /// An amount that must be non-negative but was not.
    #[error("invalid amount for {context}: {amount_cents}")]
    InvalidAmount {
        /// What the amount was for.
        context: String,
        /// The offending amount in cents.
        amount_cents: i64,
    },

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}
