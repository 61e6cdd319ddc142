//! Usage events and aggregates.
//!
//! Events are append-only observations of consumption; aggregates are
//! per-feature rollups over a time window. Event identity is the
//! fingerprint: re-submitting an identical event is a no-op, which is what
//! makes ingestion safe under at-least-once job delivery.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BillingError, Result};
use crate::ids::{OrganizationId, ProductId, SubscriptionId, TenantId};

/// One observed unit of consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Owning organization.
    pub organization_id: OrganizationId,

    /// Subscription the usage is attributed to, once attributed.
    pub subscription_id: Option<SubscriptionId>,

    /// Tenant below the organization, if usage is tenant-scoped.
    pub tenant_id: Option<TenantId>,

    /// Product the usage belongs to, if any.
    pub product_id: Option<ProductId>,

    /// What was consumed (e.g. "ai.tokens").
    pub feature_key: String,

    /// How much was consumed. Non-negative, arbitrary precision.
    pub quantity: Decimal,

    /// Unit of measure (e.g. "tokens").
    pub unit: String,

    /// When the usage occurred.
    pub recorded_at: DateTime<Utc>,

    /// Which path reported the usage.
    pub source: UsageSource,

    /// Idempotency key. Unique across all events; derived from the defining
    /// fields when the emitter does not supply one.
    pub fingerprint: String,

    /// Additional context (`request_id`, model, etc.).
    pub metadata: serde_json::Value,
}

/// A usage event as submitted by an emitter, before the fingerprint is
/// guaranteed to exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUsageEvent {
    /// Owning organization.
    pub organization_id: OrganizationId,

    /// Subscription the usage is attributed to.
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,

    /// Tenant below the organization.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,

    /// Product the usage belongs to.
    #[serde(default)]
    pub product_id: Option<ProductId>,

    /// What was consumed.
    pub feature_key: String,

    /// How much was consumed.
    pub quantity: Decimal,

    /// Unit of measure.
    pub unit: String,

    /// When the usage occurred.
    pub recorded_at: DateTime<Utc>,

    /// Which path reported the usage.
    pub source: UsageSource,

    /// Emitter-supplied idempotency key, if any.
    #[serde(default)]
    pub fingerprint: Option<String>,

    /// Additional context.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl NewUsageEvent {
    /// Finalize into a `UsageEvent`, deriving the fingerprint when absent.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NegativeQuantity` if the quantity is below zero.
    pub fn into_event(self) -> Result<UsageEvent> {
        if self.quantity < Decimal::ZERO {
            return Err(BillingError::NegativeQuantity {
                feature_key: self.feature_key,
                quantity: self.quantity,
            });
        }

        let fingerprint = self.fingerprint.unwrap_or_else(|| {
            derive_fingerprint(
                &self.organization_id,
                self.subscription_id.as_ref(),
                &self.feature_key,
                &self.unit,
                self.recorded_at,
                self.quantity,
            )
        });

        Ok(UsageEvent {
            organization_id: self.organization_id,
            subscription_id: self.subscription_id,
            tenant_id: self.tenant_id,
            product_id: self.product_id,
            feature_key: self.feature_key,
            quantity: self.quantity,
            unit: self.unit,
            recorded_at: self.recorded_at,
            source: self.source,
            fingerprint,
            metadata: self.metadata,
        })
    }
}

/// Derive the idempotency fingerprint for a usage event.
///
/// SHA-256 over the defining fields: organization, subscription, feature key,
/// unit, recorded-at (microsecond precision), and the normalized quantity.
/// Identical submissions always hash to the same key, so duplicate delivery
/// collapses into the existing row.
#[must_use]
pub fn derive_fingerprint(
    organization_id: &OrganizationId,
    subscription_id: Option<&SubscriptionId>,
    feature_key: &str,
    unit: &str,
    recorded_at: DateTime<Utc>,
    quantity: Decimal,
) -> String {
    let subscription = subscription_id.map_or_else(|| "-".to_string(), ToString::to_string);
    let canonical = format!(
        "{organization_id}|{subscription}|{feature_key}|{unit}|{}|{}",
        recorded_at.timestamp_micros(),
        quantity.normalize(),
    );

    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// Which ingestion path reported a usage event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    /// Reported through the public API.
    Api,

    /// Emitted by a background worker.
    Worker,

    /// Loaded by a bulk import.
    Import,

    /// Custom source.
    Custom(String),
}

impl UsageSource {
    /// Get the source name as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Api => "api",
            Self::Worker => "worker",
            Self::Import => "import",
            Self::Custom(name) => name,
        }
    }
}

/// Time-bucket granularity for usage aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// One bucket per hour.
    Hourly,

    /// One bucket per day.
    Daily,

    /// One bucket per month.
    Monthly,
}

impl Resolution {
    /// Get the resolution name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    /// Stable single-byte tag used in store key encodings.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Hourly => 1,
            Self::Daily => 2,
            Self::Monthly => 3,
        }
    }
}

/// The composite unique key of a usage aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateKey {
    /// Owning organization.
    pub organization_id: OrganizationId,

    /// Subscription the rollup belongs to.
    pub subscription_id: SubscriptionId,

    /// Feature the rollup covers.
    pub feature_key: String,

    /// Bucket granularity.
    pub resolution: Resolution,

    /// Inclusive window start.
    pub period_start: DateTime<Utc>,

    /// Exclusive window end.
    pub period_end: DateTime<Utc>,
}

/// Rollup of usage events for one subscription/feature/time-bucket.
///
/// For a fully aggregated window, `quantity` equals the exact decimal sum of
/// every matching event's quantity. Absence of an aggregate means "no usage";
/// the aggregator never writes zero-valued rows for empty windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAggregate {
    /// Composite unique key.
    pub key: AggregateKey,

    /// Summed quantity over the window.
    pub quantity: Decimal,

    /// Unit of measure carried from the underlying events.
    pub unit: String,

    /// Which path produced this rollup.
    pub source: UsageSource,

    /// When the rollup was last written.
    pub updated_at: DateTime<Utc>,
}
