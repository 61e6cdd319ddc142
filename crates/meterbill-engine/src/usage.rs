//! Usage ingestion and aggregation.
//!
//! Ingestion and aggregation are both idempotent by construction: events
//! dedupe on their fingerprint, and aggregation recomputes the window and
//! overwrites (upsert-replace), so re-delivery of either job is harmless.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use meterbill_core::{
    AggregateKey, BillingClaims, NewUsageEvent, Resolution, SubscriptionId, UsageAggregate,
    UsageSource,
};
use meterbill_store::Store;

use crate::error::{EngineError, Result};
use crate::jobs::UsageJob;

/// Processor for usage ingestion and window aggregation.
pub struct UsageProcessor {
    store: Arc<dyn Store>,
    default_resolution: Resolution,
}

/// Outcome of a batch ingestion call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// Events submitted in the batch.
    pub submitted: usize,

    /// Events newly inserted.
    pub inserted: usize,

    /// Events skipped because their fingerprint already existed.
    pub duplicates: usize,
}

/// Per-feature rollup produced by one aggregation run.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRollup {
    /// Feature the rollup covers.
    pub feature_key: String,

    /// Exact decimal sum of matching event quantities.
    pub quantity: Decimal,

    /// Unit of measure carried from the events.
    pub unit: String,

    /// How many events contributed.
    pub event_count: usize,
}

/// Outcome of one aggregation run.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRunSummary {
    /// Subscription aggregated.
    pub subscription_id: SubscriptionId,

    /// Bucket granularity used.
    pub resolution: Resolution,

    /// One rollup per feature key that had events in the window. Empty when
    /// the window had no usage; in that case nothing was written.
    pub rollups: Vec<FeatureRollup>,

    /// Aggregates written (equals `rollups.len()`).
    pub aggregates_written: usize,
}

impl UsageProcessor {
    /// Create a processor over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, default_resolution: Resolution) -> Self {
        Self {
            store,
            default_resolution,
        }
    }

    /// Record a batch of usage events, deriving fingerprints where absent and
    /// silently skipping duplicates.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` for negative quantities; store
    /// failures propagate uncaught. Duplicate fingerprints are not an error.
    pub async fn record_events(
        &self,
        claims: &BillingClaims,
        drafts: Vec<NewUsageEvent>,
    ) -> Result<IngestReport> {
        let submitted = drafts.len();

        let mut events = Vec::with_capacity(submitted);
        for draft in drafts {
            events.push(draft.into_event()?);
        }

        let inserted = self.store.insert_usage_events(claims, &events)?;
        let report = IngestReport {
            submitted,
            inserted,
            duplicates: submitted - inserted,
        };

        tracing::info!(
            organization_id = %claims.organization_id,
            submitted = report.submitted,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "usage events recorded"
        );

        Ok(report)
    }

    /// Run one aggregation job: read events in `[period_start, period_end)`,
    /// group by feature key, and upsert-replace one aggregate per feature.
    ///
    /// Windows with no events write nothing; absence of an aggregate means
    /// "no usage", which callers distinguish from "usage of zero" through
    /// their own job-run records.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` for an inverted period (fatal, not
    /// retried) and `EngineError::NotFound` for an unknown subscription.
    pub async fn aggregate(
        &self,
        claims: &BillingClaims,
        job: &UsageJob,
    ) -> Result<UsageRunSummary> {
        job.validate()?;

        self.store
            .get_subscription(claims, &job.subscription_id)?
            .ok_or_else(|| EngineError::NotFound {
                entity: "subscription",
                id: job.subscription_id.to_string(),
            })?;

        let events = self.store.list_usage_events(
            claims,
            &job.subscription_id,
            job.period_start,
            job.period_end,
            job.feature_keys.as_deref(),
        )?;

        // BTreeMap keeps rollup order deterministic across runs.
        let mut by_feature: BTreeMap<String, FeatureRollup> = BTreeMap::new();
        for event in &events {
            by_feature
                .entry(event.feature_key.clone())
                .and_modify(|rollup| {
                    rollup.quantity += event.quantity;
                    rollup.event_count += 1;
                })
                .or_insert_with(|| FeatureRollup {
                    feature_key: event.feature_key.clone(),
                    quantity: event.quantity,
                    unit: event.unit.clone(),
                    event_count: 1,
                });
        }

        let resolution = job.resolution.unwrap_or(self.default_resolution);
        let source = job.source.clone().unwrap_or(UsageSource::Worker);
        let now = Utc::now();

        for rollup in by_feature.values() {
            let aggregate = UsageAggregate {
                key: AggregateKey {
                    organization_id: claims.organization_id,
                    subscription_id: job.subscription_id,
                    feature_key: rollup.feature_key.clone(),
                    resolution,
                    period_start: job.period_start,
                    period_end: job.period_end,
                },
                quantity: rollup.quantity,
                unit: rollup.unit.clone(),
                source: source.clone(),
                updated_at: now,
            };
            self.store.replace_aggregate(claims, &aggregate)?;
        }

        let rollups: Vec<FeatureRollup> = by_feature.into_values().collect();
        let summary = UsageRunSummary {
            subscription_id: job.subscription_id,
            resolution,
            aggregates_written: rollups.len(),
            rollups,
        };

        tracing::info!(
            organization_id = %claims.organization_id,
            subscription_id = %job.subscription_id,
            resolution = resolution.as_str(),
            backfill = job.backfill,
            events = events.len(),
            aggregates_written = summary.aggregates_written,
            "usage aggregation completed"
        );

        Ok(summary)
    }

    /// Atomically add `delta` to a near-real-time counter, creating the
    /// aggregate when absent. Used outside the batch aggregation path.
    ///
    /// # Errors
    ///
    /// Store failures propagate uncaught.
    pub async fn increment(
        &self,
        claims: &BillingClaims,
        key: &AggregateKey,
        unit: &str,
        delta: Decimal,
        source: &UsageSource,
    ) -> Result<()> {
        self.store
            .increment_aggregate(claims, key, unit, delta, source)?;

        tracing::debug!(
            organization_id = %claims.organization_id,
            subscription_id = %key.subscription_id,
            feature_key = %key.feature_key,
            delta = %delta,
            "aggregate incremented"
        );

        Ok(())
    }
}
