//! Typed job payloads consumed from the queue.
//!
//! Each job type is a strongly-typed struct deserialized strictly (unknown
//! fields are rejected) and validated before any business logic runs. A
//! malformed payload is a fatal validation error; the queue marks the job
//! failed instead of retrying it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use meterbill_core::{
    CreditReason, InvoiceId, InvoiceStatus, LineType, OrganizationId, Resolution, SubscriptionId,
    UsageSource,
};

use crate::error::{EngineError, Result};

/// Envelope dispatched by the worker pool: one variant per job type.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobPayload {
    /// Aggregate usage events for a subscription and window.
    Usage(UsageJob),

    /// Build an invoice for a subscription and period.
    Invoice(InvoiceJob),

    /// Apply a payment-gateway event to an invoice.
    PaymentSync(PaymentSyncJob),
}

impl JobPayload {
    /// Deserialize and validate a raw payload from the queue.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` on malformed JSON, unknown job
    /// types, or failed field validation.
    pub fn from_json(raw: &str) -> Result<Self> {
        let payload: Self = serde_json::from_str(raw)
            .map_err(|e| EngineError::Validation(format!("malformed job payload: {e}")))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Validate the payload's fields.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` if any field invariant fails.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Usage(job) => job.validate(),
            Self::Invoice(job) => job.validate(),
            Self::PaymentSync(job) => job.validate(),
        }
    }

    /// The organization the job is scoped to.
    #[must_use]
    pub fn organization_id(&self) -> OrganizationId {
        match self {
            Self::Usage(job) => job.organization_id,
            Self::Invoice(job) => job.organization_id,
            Self::PaymentSync(job) => job.organization_id,
        }
    }
}

fn check_period(period_start: DateTime<Utc>, period_end: DateTime<Utc>) -> Result<()> {
    if period_end <= period_start {
        return Err(EngineError::Validation(format!(
            "period_end {period_end} must be after period_start {period_start}"
        )));
    }
    Ok(())
}

fn check_non_negative(context: &str, amount_cents: i64) -> Result<()> {
    if amount_cents < 0 {
        return Err(EngineError::Validation(format!(
            "{context} must be non-negative, got {amount_cents}"
        )));
    }
    Ok(())
}

/// Usage aggregation job.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UsageJob {
    /// Organization scope.
    pub organization_id: OrganizationId,

    /// Subscription whose events are aggregated.
    pub subscription_id: SubscriptionId,

    /// Inclusive window start.
    pub period_start: DateTime<Utc>,

    /// Exclusive window end.
    pub period_end: DateTime<Utc>,

    /// Bucket granularity; the engine default applies when absent.
    #[serde(default)]
    pub resolution: Option<Resolution>,

    /// Source stamped on written aggregates.
    #[serde(default)]
    pub source: Option<UsageSource>,

    /// Restrict aggregation to these feature keys.
    #[serde(default)]
    pub feature_keys: Option<Vec<String>>,

    /// Whether this run re-covers an already-aggregated window. Informational;
    /// aggregation is upsert-replace either way.
    #[serde(default)]
    pub backfill: bool,
}

impl UsageJob {
    /// Validate the job's fields.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` if the period is inverted or empty.
    pub fn validate(&self) -> Result<()> {
        check_period(self.period_start, self.period_end)
    }
}

/// One metered charge to price on an invoice.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UsageCharge {
    /// Feature to price (e.g. "ai.tokens").
    pub feature_key: String,

    /// Price per unit, in cents.
    pub unit_amount_cents: i64,

    /// Unit of measure.
    pub unit: String,

    /// Floor for the line amount, applied after pricing.
    #[serde(default)]
    pub minimum_amount_cents: Option<i64>,

    /// Resolution of the aggregate to read; the engine default applies when
    /// absent.
    #[serde(default)]
    pub resolution: Option<Resolution>,

    /// Line description; defaults to "<feature_key> usage".
    #[serde(default)]
    pub description: Option<String>,
}

/// A pre-costed adjustment or credit entry appended verbatim.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraLine {
    /// Must be `adjustment` or `credit`.
    pub line_type: LineType,

    /// Line description.
    pub description: String,

    /// Line amount in cents. Credits are negative.
    pub amount_cents: i64,

    /// Feature association, if any.
    #[serde(default)]
    pub feature_key: Option<String>,
}

/// Immediate settlement to apply right after invoice creation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SettleSpec {
    /// Payment amount; defaults to the invoice total.
    #[serde(default)]
    pub amount_cents: Option<i64>,

    /// Payment instant; defaults to now.
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
}

/// Invoice build job.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InvoiceJob {
    /// Organization scope.
    pub organization_id: OrganizationId,

    /// Subscription to bill; when absent, the organization's active
    /// subscription is resolved.
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,

    /// Caller-supplied invoice number. Supplying a stable number is what
    /// makes invoice creation safe to retry.
    #[serde(default)]
    pub invoice_number: Option<String>,

    /// Currency override; defaults to the subscription currency.
    #[serde(default)]
    pub currency: Option<String>,

    /// Start of the billed period.
    pub period_start: DateTime<Utc>,

    /// End of the billed period.
    pub period_end: DateTime<Utc>,

    /// Recurring charge override; defaults to the subscription amount.
    #[serde(default)]
    pub recurring_amount_cents: Option<i64>,

    /// Initial status; defaults to OPEN.
    #[serde(default)]
    pub status: Option<InvoiceStatus>,

    /// Issue instant; defaults to now.
    #[serde(default)]
    pub issue_date: Option<DateTime<Utc>>,

    /// Due instant, if any.
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,

    /// Tax rate in basis points (0..=10000). Ignored when `tax_cents` is
    /// supplied.
    #[serde(default)]
    pub tax_rate_bps: Option<u32>,

    /// Explicit tax amount, overriding the rate.
    #[serde(default)]
    pub tax_cents: Option<i64>,

    /// Metered charges to price over the period.
    #[serde(default)]
    pub usage_charges: Vec<UsageCharge>,

    /// Pre-costed adjustment/credit entries.
    #[serde(default)]
    pub extra_lines: Vec<ExtraLine>,

    /// Immediate settlement to apply after creation.
    #[serde(default)]
    pub settle: Option<SettleSpec>,

    /// Pre-supplied per-feature quantity totals, bypassing aggregate reads.
    /// Used in test and replay scenarios.
    #[serde(default)]
    pub usage_totals: Option<HashMap<String, Decimal>>,
}

impl InvoiceJob {
    /// Validate the job's fields.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` on an inverted period, an
    /// out-of-range tax rate, a negative recurring/usage/settle amount, or an
    /// extra line that is not an adjustment or credit.
    pub fn validate(&self) -> Result<()> {
        check_period(self.period_start, self.period_end)?;

        if let Some(bps) = self.tax_rate_bps {
            if bps > 10_000 {
                return Err(EngineError::Validation(format!(
                    "tax_rate_bps must be 0..=10000, got {bps}"
                )));
            }
        }
        if let Some(amount) = self.recurring_amount_cents {
            check_non_negative("recurring_amount_cents", amount)?;
        }
        if let Some(amount) = self.tax_cents {
            check_non_negative("tax_cents", amount)?;
        }

        for charge in &self.usage_charges {
            check_non_negative("usage charge unit_amount_cents", charge.unit_amount_cents)?;
            if let Some(min) = charge.minimum_amount_cents {
                check_non_negative("usage charge minimum_amount_cents", min)?;
            }
        }

        for line in &self.extra_lines {
            if !matches!(line.line_type, LineType::Adjustment | LineType::Credit) {
                return Err(EngineError::Validation(format!(
                    "extra lines must be adjustment or credit, got {}",
                    line.line_type.as_str()
                )));
            }
        }

        if let Some(settle) = &self.settle {
            if let Some(amount) = settle.amount_cents {
                check_non_negative("settle amount_cents", amount)?;
            }
        }

        Ok(())
    }
}

/// Payment-gateway event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEvent {
    /// A payment settled; reduce the balance.
    PaymentSucceeded,

    /// A payment attempt failed; bookkeeping only.
    PaymentFailed,

    /// The charge was disputed; credit and write off.
    PaymentDisputed,

    /// The charge was refunded; credit and write off.
    PaymentRefunded,

    /// Reconcile status drift with the external provider.
    SyncStatus,
}

/// Credit memo overrides for dispute/refund events.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreditSpec {
    /// Memo reason; defaults per event kind (disputes: `service_failure`,
    /// refunds: `duplicate_charge`).
    #[serde(default)]
    pub reason: Option<CreditReason>,

    /// Memo metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Payment synchronization job.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentSyncJob {
    /// Organization scope.
    pub organization_id: OrganizationId,

    /// Invoice the event applies to.
    pub invoice_id: InvoiceId,

    /// What happened at the gateway.
    pub event: PaymentEvent,

    /// Event amount; defaults to the invoice total where an amount applies.
    #[serde(default)]
    pub amount_cents: Option<i64>,

    /// When the payment settled; defaults to now.
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,

    /// Target status for `sync_status` events.
    #[serde(default)]
    pub status: Option<InvoiceStatus>,

    /// Gateway correlation id, recorded in logs and memo metadata.
    #[serde(default)]
    pub external_payment_id: Option<String>,

    /// Credit memo overrides for dispute/refund events.
    #[serde(default)]
    pub credit: Option<CreditSpec>,
}

impl PaymentSyncJob {
    /// Validate the job's fields.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` on a negative amount or a
    /// `sync_status` event with no target status.
    pub fn validate(&self) -> Result<()> {
        if let Some(amount) = self.amount_cents {
            check_non_negative("amount_cents", amount)?;
        }
        if self.event == PaymentEvent::SyncStatus && self.status.is_none() {
            return Err(EngineError::Validation(
                "sync_status events require a target status".into(),
            ));
        }
        Ok(())
    }
}
