//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Subscription records, keyed by `subscription_id`.
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    /// Index: subscriptions by organization, keyed by
    /// `organization_id || subscription_id`. Value is empty (index only).
    pub const SUBSCRIPTIONS_BY_ORG: &str = "subscriptions_by_org";

    /// Usage events, keyed by fingerprint. The fingerprint key is the
    /// duplicate-skip constraint for idempotent ingestion.
    pub const USAGE_EVENTS: &str = "usage_events";

    /// Index: attributed usage events by time window, keyed by
    /// `organization_id || subscription_id || recorded_at (BE micros) || fingerprint`.
    /// Value is empty (index only).
    pub const USAGE_EVENTS_BY_WINDOW: &str = "usage_events_by_window";

    /// Usage aggregates, keyed by the composite aggregate key. This family
    /// carries the additive merge operator for atomic increments.
    pub const USAGE_AGGREGATES: &str = "usage_aggregates";

    /// Invoice records, keyed by `invoice_id`.
    pub const INVOICES: &str = "invoices";

    /// Index: invoice id by invoice number. The number key is the unique
    /// constraint that dedupes invoice creation under retry.
    pub const INVOICES_BY_NUMBER: &str = "invoices_by_number";

    /// Invoice lines, keyed by `invoice_id || sequence (BE u32)` so read-back
    /// preserves the documented line order.
    pub const INVOICE_LINES: &str = "invoice_lines";

    /// Credit memos, keyed by `credit_memo_id` (ULID).
    pub const CREDIT_MEMOS: &str = "credit_memos";

    /// Index: credit memos by invoice, keyed by
    /// `invoice_id || credit_memo_id`. Value is empty (index only).
    pub const CREDIT_MEMOS_BY_INVOICE: &str = "credit_memos_by_invoice";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::SUBSCRIPTIONS,
        cf::SUBSCRIPTIONS_BY_ORG,
        cf::USAGE_EVENTS,
        cf::USAGE_EVENTS_BY_WINDOW,
        cf::USAGE_AGGREGATES,
        cf::INVOICES,
        cf::INVOICES_BY_NUMBER,
        cf::INVOICE_LINES,
        cf::CREDIT_MEMOS,
        cf::CREDIT_MEMOS_BY_INVOICE,
    ]
}
