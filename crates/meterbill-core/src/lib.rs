//! Core types and utilities for meterbill.
//!
//! This crate provides the foundational types used throughout the meterbill
//! engine:
//!
//! - **Identifiers**: `OrganizationId`, `SubscriptionId`, `InvoiceId`, `CreditMemoId`
//! - **Subscriptions**: `Subscription`, `SubscriptionStatus`, `BillingInterval`
//! - **Usage**: `UsageEvent`, `UsageAggregate`, `Resolution`, fingerprint derivation
//! - **Invoices**: `Invoice`, `InvoiceLine`, `CreditMemo`
//! - **Money**: tax and usage-pricing rounding helpers
//!
//! # Money representation
//!
//! All money is `i64` integer cents; usage quantities are
//! `rust_decimal::Decimal`. Binary floating point never touches a value that
//! participates in an invoice total.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod claims;
pub mod error;
pub mod ids;
pub mod invoice;
pub mod money;
pub mod subscription;
pub mod usage;

pub use claims::BillingClaims;
pub use error::{BillingError, Result};
pub use ids::{
    CreditMemoId, IdError, InvoiceId, OrganizationId, PackageId, ProductId, SubscriptionId,
    TenantId,
};
pub use invoice::{
    generate_invoice_number, CreditMemo, CreditReason, Invoice, InvoiceLine, InvoiceStatus,
    LineType,
};
pub use money::{price_quantity, tax_from_bps, BPS_SCALE};
pub use subscription::{BillingInterval, Subscription, SubscriptionStatus};
pub use usage::{
    derive_fingerprint, AggregateKey, NewUsageEvent, Resolution, UsageAggregate, UsageEvent,
    UsageSource,
};
