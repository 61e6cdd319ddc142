//! Payment settlement.
//!
//! Applies payment-gateway events to invoices. The state machine over
//! `InvoiceStatus`: OPEN → PAID when the balance reaches zero, OPEN/PAID →
//! UNCOLLECTIBLE on a dispute or refund, any non-terminal → VOID via status
//! sync. PAID, VOID, and UNCOLLECTIBLE are terminal for payments; events
//! against a terminal invoice are logged and rejected, never silently
//! applied.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use meterbill_core::{
    BillingClaims, CreditMemo, CreditMemoId, CreditReason, Invoice, InvoiceId, InvoiceStatus,
};
use meterbill_store::Store;

use crate::error::{EngineError, Result};
use crate::jobs::{PaymentEvent, PaymentSyncJob};

/// Processor that reconciles payment-gateway events against invoices.
pub struct SettlementProcessor {
    store: Arc<dyn Store>,
}

/// What a settlement call actually did. Callers and metrics key off this to
/// distinguish "money moved" from "bookkeeping changed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementAction {
    /// A payment reduced the invoice balance.
    PaymentRecorded,

    /// Only the status (or nothing at all) changed.
    StatusUpdated,

    /// A credit memo was issued and the invoice written off.
    CreditIssued,
}

/// Outcome of one settlement call.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementOutcome {
    /// The invoice the event applied to.
    pub invoice_id: InvoiceId,

    /// What the call did.
    pub action: SettlementAction,

    /// Invoice status after the call.
    pub status: InvoiceStatus,

    /// Invoice balance after the call.
    pub balance_cents: i64,

    /// The memo issued, for credit outcomes.
    pub credit_memo_id: Option<CreditMemoId>,
}

impl SettlementProcessor {
    /// Create a processor over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Apply one payment-gateway event to an invoice.
    ///
    /// # Errors
    ///
    /// - `EngineError::NotFound` for an unknown invoice (fatal).
    /// - `EngineError::InvoiceClosed` for events against a terminal invoice
    ///   (payments on PAID/VOID/UNCOLLECTIBLE, disputes on
    ///   VOID/UNCOLLECTIBLE, status sync on any terminal status).
    pub async fn apply(
        &self,
        claims: &BillingClaims,
        job: &PaymentSyncJob,
    ) -> Result<SettlementOutcome> {
        job.validate()?;

        let invoice = self.fetch_invoice(claims, &job.invoice_id)?;

        match job.event {
            PaymentEvent::PaymentSucceeded => {
                let amount_cents = job.amount_cents.unwrap_or(invoice.total_cents);
                let paid_at = job.paid_at.unwrap_or_else(Utc::now);
                let updated =
                    self.store
                        .record_payment(claims, &job.invoice_id, amount_cents, paid_at)?;

                tracing::info!(
                    organization_id = %claims.organization_id,
                    invoice_id = %job.invoice_id,
                    amount_cents,
                    balance_cents = updated.balance_cents,
                    status = %updated.status,
                    external_payment_id = ?job.external_payment_id,
                    "payment recorded"
                );

                Ok(SettlementOutcome {
                    invoice_id: job.invoice_id,
                    action: SettlementAction::PaymentRecorded,
                    status: updated.status,
                    balance_cents: updated.balance_cents,
                    credit_memo_id: None,
                })
            }

            PaymentEvent::PaymentFailed => {
                // No invoice mutation; the audit trail is the caller's. The
                // structured log is the bookkeeping.
                tracing::warn!(
                    organization_id = %claims.organization_id,
                    invoice_id = %job.invoice_id,
                    external_payment_id = ?job.external_payment_id,
                    "payment failed"
                );

                Ok(SettlementOutcome {
                    invoice_id: job.invoice_id,
                    action: SettlementAction::StatusUpdated,
                    status: invoice.status,
                    balance_cents: invoice.balance_cents,
                    credit_memo_id: None,
                })
            }

            PaymentEvent::PaymentDisputed | PaymentEvent::PaymentRefunded => {
                self.issue_credit(claims, job, &invoice)
            }

            PaymentEvent::SyncStatus => {
                // Validation guarantees a target status for sync events.
                let status = job.status.ok_or_else(|| {
                    EngineError::Validation("sync_status events require a target status".into())
                })?;
                let updated = self
                    .store
                    .set_invoice_status(claims, &job.invoice_id, status)?;

                tracing::info!(
                    organization_id = %claims.organization_id,
                    invoice_id = %job.invoice_id,
                    status = %updated.status,
                    "invoice status synchronized"
                );

                Ok(SettlementOutcome {
                    invoice_id: job.invoice_id,
                    action: SettlementAction::StatusUpdated,
                    status: updated.status,
                    balance_cents: updated.balance_cents,
                    credit_memo_id: None,
                })
            }
        }
    }

    fn issue_credit(
        &self,
        claims: &BillingClaims,
        job: &PaymentSyncJob,
        invoice: &Invoice,
    ) -> Result<SettlementOutcome> {
        let amount_cents = job.amount_cents.unwrap_or(invoice.total_cents);

        let default_reason = match job.event {
            PaymentEvent::PaymentRefunded => CreditReason::DuplicateCharge,
            _ => CreditReason::ServiceFailure,
        };
        let (reason, metadata) = match &job.credit {
            Some(spec) => (
                spec.reason.clone().unwrap_or(default_reason),
                spec.metadata.clone().unwrap_or(serde_json::Value::Null),
            ),
            None => (default_reason, serde_json::Value::Null),
        };

        let memo = CreditMemo::new(
            claims.organization_id,
            job.invoice_id,
            amount_cents,
            invoice.currency.clone(),
            reason,
            metadata,
        );
        let updated = self.store.issue_credit(claims, &memo)?;

        tracing::info!(
            organization_id = %claims.organization_id,
            invoice_id = %job.invoice_id,
            credit_memo_id = %memo.id,
            amount_cents,
            reason = memo.reason.as_str(),
            external_payment_id = ?job.external_payment_id,
            "credit memo issued, invoice written off"
        );

        Ok(SettlementOutcome {
            invoice_id: job.invoice_id,
            action: SettlementAction::CreditIssued,
            status: updated.status,
            balance_cents: updated.balance_cents,
            credit_memo_id: Some(memo.id),
        })
    }

    fn fetch_invoice(&self, claims: &BillingClaims, id: &InvoiceId) -> Result<Invoice> {
        self.store
            .get_invoice(claims, id)?
            .ok_or_else(|| EngineError::NotFound {
                entity: "invoice",
                id: id.to_string(),
            })
    }
}
