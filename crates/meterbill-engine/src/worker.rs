//! Engine assembly and job dispatch.
//!
//! The engine is invoked by an external job runner with at-least-once
//! delivery and retry-on-error semantics. Jobs for different organizations
//! run concurrently without coordination; the store's constraints are the
//! concurrency control of last resort. The engine performs no internal
//! retries; a failed job is re-thrown for the queue to back off and retry
//! (or mark failed, per `EngineError::is_retryable`).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use meterbill_core::BillingClaims;
use meterbill_store::{RocksStore, Store};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::invoice::{InvoiceBuilder, InvoiceResult};
use crate::jobs::JobPayload;
use crate::settlement::{SettlementOutcome, SettlementProcessor};
use crate::usage::{UsageProcessor, UsageRunSummary};

/// Handler interface the worker pool dispatches jobs through.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one job payload under the caller's claims.
    async fn handle(&self, claims: &BillingClaims, payload: JobPayload) -> Result<JobOutcome>;
}

/// Result of a processed job, one variant per job type.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Usage aggregation summary.
    Usage(UsageRunSummary),

    /// Invoice build result.
    Invoice(InvoiceResult),

    /// Settlement outcome.
    PaymentSync(SettlementOutcome),
}

/// The assembled engine: all three processors over one store.
///
/// Collaborators are injected explicitly; nothing reads ambient
/// configuration mid-call. `Engine::open` is the production factory that
/// assembles the default store once at process start; `Engine::new` accepts
/// any `Store` implementation (HTTP-backed repository, test double).
pub struct Engine {
    usage: UsageProcessor,
    invoices: InvoiceBuilder,
    settlement: SettlementProcessor,
}

impl Engine {
    /// Assemble an engine over an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
        Self {
            usage: UsageProcessor::new(Arc::clone(&store), config.default_resolution),
            invoices: InvoiceBuilder::new(Arc::clone(&store), config.default_resolution),
            settlement: SettlementProcessor::new(store),
        }
    }

    /// Open the production `RocksDB` store at `config.data_dir` and assemble
    /// an engine over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let store = RocksStore::open(&config.data_dir)?;
        tracing::info!(data_dir = %config.data_dir, "meterbill store opened");
        Ok(Self::new(Arc::new(store), config))
    }

    /// The usage processor.
    #[must_use]
    pub fn usage(&self) -> &UsageProcessor {
        &self.usage
    }

    /// The invoice builder.
    #[must_use]
    pub fn invoices(&self) -> &InvoiceBuilder {
        &self.invoices
    }

    /// The settlement processor.
    #[must_use]
    pub fn settlement(&self) -> &SettlementProcessor {
        &self.settlement
    }

    /// Dispatch one validated job payload to its processor.
    ///
    /// # Errors
    ///
    /// Propagates the processor's error unchanged; nothing is swallowed to
    /// produce a partial result.
    pub async fn process(&self, claims: &BillingClaims, payload: JobPayload) -> Result<JobOutcome> {
        match payload {
            JobPayload::Usage(job) => Ok(JobOutcome::Usage(
                self.usage.aggregate(claims, &job).await?,
            )),
            JobPayload::Invoice(job) => Ok(JobOutcome::Invoice(
                self.invoices.build(claims, &job).await?,
            )),
            JobPayload::PaymentSync(job) => Ok(JobOutcome::PaymentSync(
                self.settlement.apply(claims, &job).await?,
            )),
        }
    }
}

#[async_trait]
impl JobHandler for Engine {
    async fn handle(&self, claims: &BillingClaims, payload: JobPayload) -> Result<JobOutcome> {
        self.process(claims, payload).await
    }
}
