//! Invoice construction.
//!
//! The builder assembles an invoice from the subscription's recurring charge,
//! aggregated usage, tax, and pre-costed extra lines, then persists it with
//! its lines in one batch. Line order is a documented contract: RECURRING,
//! then USAGE in input order, then TAX, then extra lines; downstream display
//! and audit logic rely on it.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use meterbill_core::{
    generate_invoice_number, price_quantity, tax_from_bps, AggregateKey, BillingClaims, Invoice,
    InvoiceId, InvoiceLine, InvoiceStatus, LineType, Resolution, Subscription,
};
use meterbill_store::Store;

use crate::error::{EngineError, Result};
use crate::jobs::{InvoiceJob, UsageCharge};

/// Processor that builds and persists invoices.
pub struct InvoiceBuilder {
    store: Arc<dyn Store>,
    default_resolution: Resolution,
}

/// Outcome of one invoice build.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceResult {
    /// The created invoice.
    pub invoice_id: InvoiceId,

    /// Its unique number.
    pub number: String,

    /// Status after creation (and settlement, when requested).
    pub status: InvoiceStatus,

    /// Sum of non-tax lines, in cents.
    pub subtotal_cents: i64,

    /// Tax, in cents.
    pub tax_cents: i64,

    /// `subtotal + tax`, in cents.
    pub total_cents: i64,

    /// Remaining balance after any immediate settlement.
    pub balance_cents: i64,

    /// How many lines were persisted.
    pub line_count: usize,
}

impl InvoiceBuilder {
    /// Create a builder over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, default_resolution: Resolution) -> Self {
        Self {
            store,
            default_resolution,
        }
    }

    /// Build an invoice per the job and persist it with its lines.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` on failed payload validation (fatal before
    ///   any store write).
    /// - `EngineError::NotFound` when the subscription (explicit or resolved
    ///   active) doesn't exist.
    /// - `EngineError::Conflict` on an invoice number collision.
    pub async fn build(&self, claims: &BillingClaims, job: &InvoiceJob) -> Result<InvoiceResult> {
        job.validate()?;

        let subscription = self.resolve_subscription(claims, job)?;
        let currency = job
            .currency
            .clone()
            .unwrap_or_else(|| subscription.currency.clone());
        let issued_at = job.issue_date.unwrap_or_else(Utc::now);
        let invoice_id = InvoiceId::generate();

        let mut lines: Vec<InvoiceLine> = Vec::new();

        // Line 1: the recurring charge, when one applies.
        let recurring_cents = job
            .recurring_amount_cents
            .unwrap_or(subscription.amount_cents);
        if recurring_cents > 0 {
            lines.push(InvoiceLine {
                invoice_id,
                line_type: LineType::Recurring,
                description: format!("{} subscription", subscription.billing_interval.as_str()),
                feature_key: None,
                quantity: Decimal::ONE,
                unit_amount_cents: recurring_cents,
                amount_cents: recurring_cents,
                usage_period_start: None,
                usage_period_end: None,
            });
        }

        // Usage lines, in the order the charges were specified. A charge with
        // zero aggregated quantity still produces a line: lines document
        // what was priced, not only what was nonzero.
        for charge in &job.usage_charges {
            let quantity = self.summed_quantity(claims, &subscription.id, charge, job)?;
            let mut amount_cents = price_quantity(quantity, charge.unit_amount_cents)?;
            if let Some(minimum) = charge.minimum_amount_cents {
                amount_cents = amount_cents.max(minimum);
            }

            lines.push(InvoiceLine {
                invoice_id,
                line_type: LineType::Usage,
                description: charge
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("{} usage", charge.feature_key)),
                feature_key: Some(charge.feature_key.clone()),
                quantity,
                unit_amount_cents: charge.unit_amount_cents,
                amount_cents,
                usage_period_start: Some(job.period_start),
                usage_period_end: Some(job.period_end),
            });
        }

        let extra_lines: Vec<InvoiceLine> = job
            .extra_lines
            .iter()
            .map(|line| InvoiceLine {
                invoice_id,
                line_type: line.line_type,
                description: line.description.clone(),
                feature_key: line.feature_key.clone(),
                quantity: Decimal::ONE,
                unit_amount_cents: line.amount_cents,
                amount_cents: line.amount_cents,
                usage_period_start: None,
                usage_period_end: None,
            })
            .collect();

        // Subtotal covers every non-tax line, extra lines included.
        let subtotal_cents: i64 = lines
            .iter()
            .chain(extra_lines.iter())
            .map(|line| line.amount_cents)
            .sum();

        let tax_cents = match (job.tax_cents, job.tax_rate_bps) {
            (Some(tax), _) => tax,
            (None, Some(bps)) => tax_from_bps(subtotal_cents, bps)?,
            (None, None) => 0,
        };
        if tax_cents > 0 {
            lines.push(InvoiceLine {
                invoice_id,
                line_type: LineType::Tax,
                description: "Tax".into(),
                feature_key: None,
                quantity: Decimal::ONE,
                unit_amount_cents: tax_cents,
                amount_cents: tax_cents,
                usage_period_start: None,
                usage_period_end: None,
            });
        }

        // Persisted order: RECURRING, USAGE, TAX, then extra lines.
        lines.extend(extra_lines);

        let total_cents = subtotal_cents + tax_cents;
        let balance_cents = total_cents.max(0);
        let number = job
            .invoice_number
            .clone()
            .unwrap_or_else(|| generate_invoice_number(issued_at));

        let mut status = job.status.unwrap_or(InvoiceStatus::Open);
        let mut paid_at = None;
        // A zero-total invoice has nothing to collect; creating it OPEN would
        // violate "PAID iff balance is zero".
        if balance_cents == 0 && status == InvoiceStatus::Open {
            status = InvoiceStatus::Paid;
            paid_at = Some(issued_at);
        }

        let now = Utc::now();
        let invoice = Invoice {
            id: invoice_id,
            organization_id: claims.organization_id,
            subscription_id: Some(subscription.id),
            number,
            status,
            currency,
            subtotal_cents,
            tax_cents,
            total_cents,
            balance_cents,
            issued_at,
            due_at: job.due_date,
            paid_at,
            voided_at: None,
            external_id: None,
            created_at: now,
            updated_at: now,
        };
        debug_assert!(invoice.is_consistent());

        self.store.insert_invoice(claims, &invoice, &lines)?;

        tracing::info!(
            organization_id = %claims.organization_id,
            invoice_id = %invoice.id,
            number = %invoice.number,
            subtotal_cents = invoice.subtotal_cents,
            tax_cents = invoice.tax_cents,
            total_cents = invoice.total_cents,
            lines = lines.len(),
            "invoice created"
        );

        // Immediate settlement, when requested.
        let invoice = if let Some(settle) = &job.settle {
            if invoice.status.is_terminal() {
                tracing::debug!(
                    invoice_id = %invoice.id,
                    status = %invoice.status,
                    "skipping settlement of already-settled invoice"
                );
                invoice
            } else {
                let amount_cents = settle.amount_cents.unwrap_or(total_cents);
                let paid_at = settle.paid_at.unwrap_or_else(Utc::now);
                self.store
                    .record_payment(claims, &invoice.id, amount_cents, paid_at)?
            }
        } else {
            invoice
        };

        Ok(InvoiceResult {
            invoice_id: invoice.id,
            number: invoice.number,
            status: invoice.status,
            subtotal_cents: invoice.subtotal_cents,
            tax_cents: invoice.tax_cents,
            total_cents: invoice.total_cents,
            balance_cents: invoice.balance_cents,
            line_count: lines.len(),
        })
    }

    fn resolve_subscription(
        &self,
        claims: &BillingClaims,
        job: &InvoiceJob,
    ) -> Result<Subscription> {
        match &job.subscription_id {
            Some(id) => self
                .store
                .get_subscription(claims, id)?
                .ok_or_else(|| EngineError::NotFound {
                    entity: "subscription",
                    id: id.to_string(),
                }),
            None => self
                .store
                .find_active_subscription(claims)?
                .ok_or_else(|| EngineError::NotFound {
                    entity: "active subscription for organization",
                    id: claims.organization_id.to_string(),
                }),
        }
    }

    /// Summed quantity for a feature over the billed period.
    ///
    /// Resolution order: the job's pre-supplied totals map (test/replay),
    /// then the stored aggregate, then a direct sum over raw events for
    /// windows the scheduled aggregator hasn't covered.
    fn summed_quantity(
        &self,
        claims: &BillingClaims,
        subscription_id: &meterbill_core::SubscriptionId,
        charge: &UsageCharge,
        job: &InvoiceJob,
    ) -> Result<Decimal> {
        if let Some(totals) = &job.usage_totals {
            return Ok(totals
                .get(&charge.feature_key)
                .copied()
                .unwrap_or(Decimal::ZERO));
        }

        let key = AggregateKey {
            organization_id: claims.organization_id,
            subscription_id: *subscription_id,
            feature_key: charge.feature_key.clone(),
            resolution: charge.resolution.unwrap_or(self.default_resolution),
            period_start: job.period_start,
            period_end: job.period_end,
        };
        if let Some(aggregate) = self.store.get_aggregate(claims, &key)? {
            return Ok(aggregate.quantity);
        }

        let feature = std::slice::from_ref(&charge.feature_key);
        let events = self.store.list_usage_events(
            claims,
            subscription_id,
            job.period_start,
            job.period_end,
            Some(feature),
        )?;

        Ok(events.iter().map(|event| event.quantity).sum())
    }
}
