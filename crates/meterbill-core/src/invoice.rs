//! Invoices, invoice lines, and credit memos.
//!
//! An invoice carries the arithmetic invariants that make the rest of the
//! engine trustworthy: `total = subtotal + tax`, `subtotal` equals the sum of
//! non-tax line amounts, and `balance` starts at `total` and only ever
//! decreases, floored at zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{CreditMemoId, InvoiceId, OrganizationId, SubscriptionId};

/// A billing document for one subscription/period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    /// Unique invoice id.
    pub id: InvoiceId,

    /// Owning organization.
    pub organization_id: OrganizationId,

    /// Subscription billed, or `None` for one-off invoices.
    pub subscription_id: Option<SubscriptionId>,

    /// Unique human-readable number (`INV-<date>-<random>` unless supplied).
    pub number: String,

    /// Current lifecycle status.
    pub status: InvoiceStatus,

    /// ISO 4217 currency code, lowercase.
    pub currency: String,

    /// Sum of all non-tax line amounts, in cents.
    pub subtotal_cents: i64,

    /// Sum of tax lines, in cents.
    pub tax_cents: i64,

    /// `subtotal_cents + tax_cents`.
    pub total_cents: i64,

    /// Remaining amount owed. Starts at `total_cents`, only decreases,
    /// floored at zero.
    pub balance_cents: i64,

    /// When the invoice was issued.
    pub issued_at: DateTime<Utc>,

    /// When payment is due, if a due date was set.
    pub due_at: Option<DateTime<Utc>>,

    /// When the last payment was recorded.
    pub paid_at: Option<DateTime<Utc>>,

    /// When the invoice was voided, if it was.
    pub voided_at: Option<DateTime<Utc>>,

    /// Payment-gateway correlation id, if known.
    pub external_id: Option<String>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Check the arithmetic invariants of a freshly built invoice.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total_cents == self.subtotal_cents + self.tax_cents
            && self.balance_cents >= 0
            && self.balance_cents <= self.total_cents.max(0)
    }
}

/// Lifecycle status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Not yet issued.
    Draft,

    /// Issued and awaiting payment.
    Open,

    /// Fully paid (balance reached zero).
    Paid,

    /// Canceled before collection. Terminal.
    Void,

    /// Written off after a dispute or failed collection. Terminal.
    Uncollectible,
}

impl InvoiceStatus {
    /// Whether the settlement processor treats this status as terminal.
    /// Terminal invoices reject further payment events.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Void | Self::Uncollectible)
    }

    /// Whether this status accepts a dispute or refund. Paid invoices do;
    /// a chargeback arrives after the money moved.
    #[must_use]
    pub const fn accepts_dispute(&self) -> bool {
        matches!(self, Self::Draft | Self::Open | Self::Paid)
    }

    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Paid => "paid",
            Self::Void => "void",
            Self::Uncollectible => "uncollectible",
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate an invoice number of the form `INV-<date>-<random>`.
///
/// The random suffix comes from a fresh UUID, so collisions are practically
/// impossible; the store's unique-number constraint is the backstop.
#[must_use]
pub fn generate_invoice_number(issued_at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "INV-{}-{}",
        issued_at.format("%Y%m%d"),
        suffix[..8].to_uppercase()
    )
}

/// Itemized component of an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    /// Parent invoice.
    pub invoice_id: InvoiceId,

    /// What kind of charge the line represents.
    pub line_type: LineType,

    /// Human-readable description.
    pub description: String,

    /// Feature the line prices, for usage lines.
    pub feature_key: Option<String>,

    /// Quantity priced.
    pub quantity: Decimal,

    /// Per-unit amount in cents.
    pub unit_amount_cents: i64,

    /// Line total in cents.
    pub amount_cents: i64,

    /// Start of the usage window the line covers. Usage lines only.
    pub usage_period_start: Option<DateTime<Utc>>,

    /// End of the usage window the line covers. Usage lines only.
    pub usage_period_end: Option<DateTime<Utc>>,
}

/// Kind of invoice line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    /// The subscription's recurring charge.
    Recurring,

    /// Metered usage priced over a window.
    Usage,

    /// Tax computed on the subtotal.
    Tax,

    /// Ad-hoc positive adjustment, pre-costed by the caller.
    Adjustment,

    /// Ad-hoc negative adjustment, pre-costed by the caller.
    Credit,
}

impl LineType {
    /// Whether the line counts toward `tax_cents` rather than the subtotal.
    #[must_use]
    pub const fn is_tax(&self) -> bool {
        matches!(self, Self::Tax)
    }

    /// Get the line type name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Recurring => "recurring",
            Self::Usage => "usage",
            Self::Tax => "tax",
            Self::Adjustment => "adjustment",
            Self::Credit => "credit",
        }
    }
}

/// A negative adjustment issued against an invoice.
///
/// Immutable once created; the settlement processor issues one for every
/// dispute or refund event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditMemo {
    /// Unique memo id (ULID, time-ordered).
    pub id: CreditMemoId,

    /// Owning organization.
    pub organization_id: OrganizationId,

    /// Invoice the memo is issued against.
    pub invoice_id: InvoiceId,

    /// Credited amount in cents.
    pub amount_cents: i64,

    /// ISO 4217 currency code, lowercase.
    pub currency: String,

    /// Why the credit was issued.
    pub reason: CreditReason,

    /// Additional context (gateway ids, dispute case numbers, etc.).
    pub metadata: serde_json::Value,

    /// When the memo was created.
    pub created_at: DateTime<Utc>,
}

impl CreditMemo {
    /// Create a new memo against an invoice.
    #[must_use]
    pub fn new(
        organization_id: OrganizationId,
        invoice_id: InvoiceId,
        amount_cents: i64,
        currency: String,
        reason: CreditReason,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: CreditMemoId::generate(),
            organization_id,
            invoice_id,
            amount_cents,
            currency,
            reason,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Why a credit memo was issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    /// The service failed the customer (disputes default here).
    ServiceFailure,

    /// Goodwill credit.
    Goodwill,

    /// The customer was charged twice (refunds default here).
    DuplicateCharge,

    /// Custom reason.
    Custom(String),
}

impl CreditReason {
    /// Get the reason name as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ServiceFailure => "service_failure",
            Self::Goodwill => "goodwill",
            Self::DuplicateCharge => "duplicate_charge",
            Self::Custom(name) => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn invoice_number_format() {
        let issued = Utc.with_ymd_and_hms(2026, 8, 6, 9, 30, 0).unwrap();
        let number = generate_invoice_number(issued);
        assert!(number.starts_with("INV-20260806-"));
        assert_eq!(number.len(), "INV-20260806-".len() + 8);
    }

    #[test]
    fn invoice_numbers_are_unique_in_practice() {
        let issued = Utc::now();
        let a = generate_invoice_number(issued);
        let b = generate_invoice_number(issued);
        assert_ne!(a, b);
    }

    #[test]
    fn terminal_statuses() {
        assert!(InvoiceStatus::Paid.is_terminal());
        assert!(InvoiceStatus::Void.is_terminal());
        assert!(InvoiceStatus::Uncollectible.is_terminal());
        assert!(!InvoiceStatus::Open.is_terminal());
        assert!(!InvoiceStatus::Draft.is_terminal());
    }

    #[test]
    fn paid_accepts_dispute_but_void_does_not() {
        assert!(InvoiceStatus::Paid.accepts_dispute());
        assert!(InvoiceStatus::Open.accepts_dispute());
        assert!(!InvoiceStatus::Void.accepts_dispute());
        assert!(!InvoiceStatus::Uncollectible.accepts_dispute());
    }

    #[test]
    fn tax_lines_are_the_only_tax_lines() {
        assert!(LineType::Tax.is_tax());
        for lt in [
            LineType::Recurring,
            LineType::Usage,
            LineType::Adjustment,
            LineType::Credit,
        ] {
            assert!(!lt.is_tax());
        }
    }
}
