//! `RocksDB` storage layer for meterbill.
//!
//! This crate provides persistent storage for subscriptions, usage events,
//! usage aggregates, invoices, and credit memos using `RocksDB` with column
//! families for efficient indexing.
//!
//! # Concurrency model
//!
//! The store is the concurrency control of last resort. Every mutation goes
//! through one of three shapes:
//!
//! - **insert-if-absent** under the store's write lock (usage-event
//!   fingerprints, invoice numbers, the one-active-subscription rule):
//!   duplicate keys are skipped or rejected, never read-then-overwritten by
//!   racing writers;
//! - **atomic merge** for aggregate increments (a `RocksDB` associative
//!   merge operator adds the delta, creating the row when absent);
//! - **transactional read-modify-write** under the write lock for invoice
//!   balance/status updates, committed as a single `WriteBatch`.
//!
//! # Example
//!
//! ```no_run
//! use meterbill_store::{RocksStore, Store};
//! use meterbill_core::{BillingClaims, OrganizationId};
//!
//! let store = RocksStore::open("/tmp/meterbill-db").unwrap();
//! let claims = BillingClaims::for_organization(OrganizationId::generate());
//! let active = store.find_active_subscription(&claims).unwrap();
//! assert!(active.is_none());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use meterbill_core::{
    AggregateKey, BillingClaims, CreditMemo, Invoice, InvoiceId, InvoiceLine, InvoiceStatus,
    Subscription, SubscriptionId, UsageAggregate, UsageEvent, UsageSource,
};

/// The storage trait defining all database operations.
///
/// This trait is the substitution seam between the engine and persistence:
/// the production implementation is `RocksStore`, but an HTTP-backed billing
/// API or an in-memory test double can stand in. Every call is scoped by the
/// caller's `BillingClaims`; implementations must refuse records belonging
/// to a different organization.
pub trait Store: Send + Sync {
    // =========================================================================
    // Subscription Operations
    // =========================================================================

    /// Insert or update a subscription record.
    ///
    /// Enforces the one-active-subscription rule: writing an active-like
    /// subscription fails if the organization already has a different
    /// active-like subscription.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ActiveSubscriptionExists` on a second active-like
    /// subscription, or an error if the database operation fails.
    fn put_subscription(&self, claims: &BillingClaims, subscription: &Subscription) -> Result<()>;

    /// Get a subscription by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ScopeViolation` if the record belongs to another
    /// organization, or an error if the database operation fails.
    fn get_subscription(
        &self,
        claims: &BillingClaims,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>>;

    /// Find the organization's active subscription (TRIALING, ACTIVE, or
    /// PAST_DUE), if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_active_subscription(&self, claims: &BillingClaims) -> Result<Option<Subscription>>;

    // =========================================================================
    // Usage Event Operations
    // =========================================================================

    /// Bulk-insert usage events, silently skipping rows whose fingerprint
    /// already exists. Returns the number of newly inserted rows; callers
    /// must not assume every submitted event was new.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails. Duplicate
    /// fingerprints are expected steady-state behavior, not an error.
    fn insert_usage_events(&self, claims: &BillingClaims, events: &[UsageEvent]) -> Result<usize>;

    /// Get a usage event by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_usage_event(
        &self,
        claims: &BillingClaims,
        fingerprint: &str,
    ) -> Result<Option<UsageEvent>>;

    /// List attributed usage events for a subscription with `recorded_at` in
    /// `[period_start, period_end)`, optionally filtered to specific feature
    /// keys, ordered by recorded-at.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_usage_events(
        &self,
        claims: &BillingClaims,
        subscription_id: &SubscriptionId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        feature_keys: Option<&[String]>,
    ) -> Result<Vec<UsageEvent>>;

    // =========================================================================
    // Usage Aggregate Operations
    // =========================================================================

    /// Overwrite the aggregate for its composite key (upsert-replace). Used
    /// by the scheduled aggregator, whose recomputation is the source of
    /// truth for the window.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn replace_aggregate(&self, claims: &BillingClaims, aggregate: &UsageAggregate) -> Result<()>;

    /// Atomically add `delta` to the aggregate for `key`, creating it with
    /// value `delta` if absent. One merge operation: no existence check, no
    /// read-modify-write window.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn increment_aggregate(
        &self,
        claims: &BillingClaims,
        key: &AggregateKey,
        unit: &str,
        delta: Decimal,
        source: &UsageSource,
    ) -> Result<()>;

    /// Get the aggregate for a composite key. Absence means "no usage", which
    /// is distinct from a zero-valued aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_aggregate(
        &self,
        claims: &BillingClaims,
        key: &AggregateKey,
    ) -> Result<Option<UsageAggregate>>;

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    /// Insert an invoice together with its lines in one atomic batch. Line
    /// order is preserved for read-back. The invoice number must be unique.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateInvoiceNumber` if the number is taken,
    /// or an error if the database operation fails.
    fn insert_invoice(
        &self,
        claims: &BillingClaims,
        invoice: &Invoice,
        lines: &[InvoiceLine],
    ) -> Result<()>;

    /// Get an invoice by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ScopeViolation` if the record belongs to another
    /// organization, or an error if the database operation fails.
    fn get_invoice(&self, claims: &BillingClaims, id: &InvoiceId) -> Result<Option<Invoice>>;

    /// Look up an invoice by its unique number.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_invoice_by_number(
        &self,
        claims: &BillingClaims,
        number: &str,
    ) -> Result<Option<Invoice>>;

    /// List an invoice's lines in their persisted order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_invoice_lines(&self, claims: &BillingClaims, id: &InvoiceId)
        -> Result<Vec<InvoiceLine>>;

    /// Record a payment against an invoice: reduce the balance by
    /// `amount_cents` (floored at zero), stamp `paid_at`, and set the status
    /// to PAID when the balance reaches zero. One transactional update.
    ///
    /// Returns the updated invoice.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the invoice doesn't exist.
    /// - `StoreError::InvoiceClosed` if the invoice is PAID, VOID, or
    ///   UNCOLLECTIBLE; payments against terminal invoices are rejected.
    /// - `StoreError::InvalidAmount` if `amount_cents` is negative.
    fn record_payment(
        &self,
        claims: &BillingClaims,
        id: &InvoiceId,
        amount_cents: i64,
        paid_at: DateTime<Utc>,
    ) -> Result<Invoice>;

    /// Set an invoice's status directly, without touching balance
    /// arithmetic. Used for external-provider reconciliation.
    ///
    /// Returns the updated invoice.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the invoice doesn't exist.
    /// - `StoreError::InvoiceClosed` if the current status is terminal.
    fn set_invoice_status(
        &self,
        claims: &BillingClaims,
        id: &InvoiceId,
        status: InvoiceStatus,
    ) -> Result<Invoice>;

    /// Issue a credit memo against an invoice and transition the invoice to
    /// UNCOLLECTIBLE, atomically.
    ///
    /// Returns the updated invoice.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the invoice doesn't exist.
    /// - `StoreError::InvoiceClosed` if the invoice is VOID or already
    ///   UNCOLLECTIBLE. PAID invoices accept credits; chargebacks arrive
    ///   after the money moved.
    fn issue_credit(&self, claims: &BillingClaims, memo: &CreditMemo) -> Result<Invoice>;

    /// List credit memos issued against an invoice, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_credit_memos(&self, claims: &BillingClaims, id: &InvoiceId) -> Result<Vec<CreditMemo>>;
}
