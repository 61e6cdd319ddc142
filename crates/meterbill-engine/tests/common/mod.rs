//! Shared test harness for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;

use meterbill_core::{
    BillingClaims, BillingInterval, NewUsageEvent, OrganizationId, PackageId, Resolution,
    Subscription, SubscriptionId, SubscriptionStatus, UsageSource,
};
use meterbill_engine::{Engine, EngineConfig, InvoiceJob, UsageCharge, UsageJob};
use meterbill_store::RocksStore;

pub struct TestHarness {
    pub engine: Engine,
    pub store: Arc<RocksStore>,
    pub claims: BillingClaims,
    pub subscription: Subscription,
    _dir: TempDir,
}

impl TestHarness {
    /// Harness with one active monthly subscription at $100.00.
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("meterbill=debug")
            .with_test_writer()
            .try_init();

        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let claims = BillingClaims::for_organization(OrganizationId::generate())
            .with_actor("engine-tests");

        let config = EngineConfig {
            data_dir: dir.path().display().to_string(),
            default_resolution: Resolution::Monthly,
            default_currency: "usd".into(),
        };
        let engine = Engine::new(store.clone(), &config);

        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::generate(),
            organization_id: claims.organization_id,
            package_id: PackageId::generate(),
            status: SubscriptionStatus::Active,
            currency: "usd".into(),
            amount_cents: 10000,
            billing_interval: BillingInterval::Monthly,
            current_period_start: period_start(),
            current_period_end: period_end(),
            trial_ends_at: None,
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        };
        meterbill_store::Store::put_subscription(store.as_ref(), &claims, &subscription).unwrap();

        Self {
            engine,
            store,
            claims,
            subscription,
            _dir: dir,
        }
    }

    /// An event inside the billed period, `day`/`hour` into March 2026.
    pub fn token_event(&self, quantity: &str, day: u32, hour: u32) -> NewUsageEvent {
        NewUsageEvent {
            organization_id: self.claims.organization_id,
            subscription_id: Some(self.subscription.id),
            tenant_id: None,
            product_id: None,
            feature_key: "ai.tokens".into(),
            quantity: dec(quantity),
            unit: "tokens".into(),
            recorded_at: Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap(),
            source: UsageSource::Api,
            fingerprint: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// A usage job covering the whole billed period.
    pub fn usage_job(&self) -> UsageJob {
        UsageJob {
            organization_id: self.claims.organization_id,
            subscription_id: self.subscription.id,
            period_start: period_start(),
            period_end: period_end(),
            resolution: None,
            source: None,
            feature_keys: None,
            backfill: false,
        }
    }

    /// A bare invoice job for the subscription and billed period.
    pub fn invoice_job(&self) -> InvoiceJob {
        InvoiceJob {
            organization_id: self.claims.organization_id,
            subscription_id: Some(self.subscription.id),
            invoice_number: None,
            currency: None,
            period_start: period_start(),
            period_end: period_end(),
            recurring_amount_cents: None,
            status: None,
            issue_date: None,
            due_date: None,
            tax_rate_bps: None,
            tax_cents: None,
            usage_charges: vec![],
            extra_lines: vec![],
            settle: None,
            usage_totals: None,
        }
    }
}

/// The canonical token charge: 2 cents per token.
pub fn token_charge() -> UsageCharge {
    UsageCharge {
        feature_key: "ai.tokens".into(),
        unit_amount_cents: 2,
        unit: "tokens".into(),
        minimum_amount_cents: None,
        resolution: None,
        description: None,
    }
}

pub fn period_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

pub fn period_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
}

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}
