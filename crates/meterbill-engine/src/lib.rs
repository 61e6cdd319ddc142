//! Meterbill processing engine.
//!
//! This crate turns raw usage telemetry and subscription state into
//! financial records with correctness guarantees appropriate to money:
//!
//! - **Usage**: idempotent event ingestion and per-feature window
//!   aggregation (`UsageProcessor`)
//! - **Invoices**: recurring + metered + tax + adjustment line assembly
//!   with internally consistent totals (`InvoiceBuilder`)
//! - **Settlement**: payment, dispute, refund, and status-sync events
//!   applied against invoice balances (`SettlementProcessor`)
//!
//! The engine is a library invoked by a job runner: payloads arrive as
//! strongly-typed jobs (`JobPayload`), are validated at the queue boundary,
//! and dispatch through `Engine::process`. Persistence sits behind the
//! `meterbill_store::Store` trait; the production factory (`Engine::open`)
//! assembles the `RocksDB` store once at process start.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod invoice;
pub mod jobs;
pub mod settlement;
pub mod usage;
pub mod worker;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use invoice::{InvoiceBuilder, InvoiceResult};
pub use jobs::{
    CreditSpec, ExtraLine, InvoiceJob, JobPayload, PaymentEvent, PaymentSyncJob, SettleSpec,
    UsageCharge, UsageJob,
};
pub use settlement::{SettlementAction, SettlementOutcome, SettlementProcessor};
pub use usage::{FeatureRollup, IngestReport, UsageProcessor, UsageRunSummary};
pub use worker::{Engine, JobHandler, JobOutcome};
