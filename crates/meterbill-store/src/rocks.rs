//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MergeOperands, MultiThreaded, Options, WriteBatch,
};
use rust_decimal::Decimal;

use meterbill_core::{
    AggregateKey, BillingClaims, CreditMemo, Invoice, InvoiceId, InvoiceLine, InvoiceStatus,
    OrganizationId, Subscription, SubscriptionId, UsageAggregate, UsageEvent, UsageSource,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,

    /// Serializes insert-if-absent paths (event fingerprints, invoice
    /// numbers, the active-subscription rule) and invoice read-modify-write
    /// updates. Aggregate increments go through the merge operator and never
    /// take this lock.
    write_lock: Mutex<()>,
}

/// Associative merge for the aggregates column family.
///
/// Each operand is a CBOR-encoded `UsageAggregate` carrying a delta
/// quantity. Merging sums quantities and keeps the newest unit/source/
/// timestamp, so a merge against an absent key degenerates to a plain
/// insert of the delta. Operands that fail to decode are skipped rather
/// than poisoning the row.
fn aggregate_merge(
    _key: &[u8],
    existing: Option<&[u8]>,
    operands: &MergeOperands,
) -> Option<Vec<u8>> {
    let mut current: Option<UsageAggregate> =
        existing.and_then(|data| RocksStore::deserialize(data).ok());

    for operand in operands {
        let Ok(delta) = RocksStore::deserialize::<UsageAggregate>(operand) else {
            continue;
        };
        current = Some(match current {
            None => delta,
            Some(mut aggregate) => {
                aggregate.quantity += delta.quantity;
                aggregate.unit = delta.unit;
                aggregate.source = delta.source;
                if delta.updated_at > aggregate.updated_at {
                    aggregate.updated_at = delta.updated_at;
                }
                aggregate
            }
        });
    }

    current.and_then(|aggregate| RocksStore::serialize(&aggregate).ok())
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                if name == cf::USAGE_AGGREGATES {
                    cf_opts.set_merge_operator_associative("usage_aggregate_add", aggregate_merge);
                }
                ColumnFamilyDescriptor::new(name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(
            column_families = all_column_families().len(),
            "rocksdb store opened"
        );

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Take the write lock. A poisoned lock only means a prior writer
    /// panicked before committing its batch; nothing partial reached the db.
    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_scope(
        claims: &BillingClaims,
        organization_id: &OrganizationId,
        entity: &'static str,
        id: &dyn std::fmt::Display,
    ) -> Result<()> {
        if organization_id == &claims.organization_id {
            Ok(())
        } else {
            Err(StoreError::ScopeViolation {
                entity,
                id: id.to_string(),
            })
        }
    }

    /// Fetch an invoice, failing with `NotFound` when absent and
    /// `ScopeViolation` when it belongs to another organization.
    fn fetch_invoice(&self, claims: &BillingClaims, id: &InvoiceId) -> Result<Invoice> {
        let cf = self.cf(cf::INVOICES)?;
        let invoice: Invoice = self
            .db
            .get_cf(&cf, keys::invoice_key(id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()?
            .ok_or(StoreError::NotFound {
                entity: "invoice",
                id: id.to_string(),
            })?;

        Self::check_scope(claims, &invoice.organization_id, "invoice", id)?;
        Ok(invoice)
    }

    fn write_invoice(&self, invoice: &Invoice) -> Result<()> {
        let cf = self.cf(cf::INVOICES)?;
        let value = Self::serialize(invoice)?;
        self.db
            .put_cf(&cf, keys::invoice_key(&invoice.id), value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Subscription Operations
    // =========================================================================

    fn put_subscription(&self, claims: &BillingClaims, subscription: &Subscription) -> Result<()> {
        Self::check_scope(
            claims,
            &subscription.organization_id,
            "subscription",
            &subscription.id,
        )?;

        let cf_subs = self.cf(cf::SUBSCRIPTIONS)?;
        let cf_by_org = self.cf(cf::SUBSCRIPTIONS_BY_ORG)?;

        let _guard = self.lock_writes();

        // One active-like subscription per organization. The scan runs under
        // the write lock, so two racing writers cannot both pass it.
        if subscription.is_active_like() {
            let prefix = keys::org_subscriptions_prefix(&subscription.organization_id);
            let iter = self
                .db
                .iterator_cf(&cf_by_org, IteratorMode::From(&prefix, Direction::Forward));

            for item in iter {
                let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
                if !key.starts_with(&prefix) {
                    break;
                }

                let other_id = keys::extract_subscription_id(&key);
                if other_id == subscription.id {
                    continue;
                }
                if let Some(other) = self.get_subscription(claims, &other_id)? {
                    if other.is_active_like() {
                        return Err(StoreError::ActiveSubscriptionExists {
                            organization_id: subscription.organization_id.to_string(),
                            existing: other_id.to_string(),
                        });
                    }
                }
            }
        }

        let value = Self::serialize(subscription)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_subs, keys::subscription_key(&subscription.id), &value);
        batch.put_cf(
            &cf_by_org,
            keys::org_subscription_key(&subscription.organization_id, &subscription.id),
            [],
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_subscription(
        &self,
        claims: &BillingClaims,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>> {
        let cf = self.cf(cf::SUBSCRIPTIONS)?;

        let Some(subscription) = self
            .db
            .get_cf(&cf, keys::subscription_key(id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize::<Subscription>(&data))
            .transpose()?
        else {
            return Ok(None);
        };

        Self::check_scope(claims, &subscription.organization_id, "subscription", id)?;
        Ok(Some(subscription))
    }

    fn find_active_subscription(&self, claims: &BillingClaims) -> Result<Option<Subscription>> {
        let cf_by_org = self.cf(cf::SUBSCRIPTIONS_BY_ORG)?;
        let prefix = keys::org_subscriptions_prefix(&claims.organization_id);

        let iter = self
            .db
            .iterator_cf(&cf_by_org, IteratorMode::From(&prefix, Direction::Forward));

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }

            let id = keys::extract_subscription_id(&key);
            if let Some(subscription) = self.get_subscription(claims, &id)? {
                if subscription.is_active_like() {
                    return Ok(Some(subscription));
                }
            }
        }

        Ok(None)
    }

    // =========================================================================
    // Usage Event Operations
    // =========================================================================

    fn insert_usage_events(&self, claims: &BillingClaims, events: &[UsageEvent]) -> Result<usize> {
        for event in events {
            Self::check_scope(
                claims,
                &event.organization_id,
                "usage_event",
                &event.fingerprint,
            )?;
        }

        let cf_events = self.cf(cf::USAGE_EVENTS)?;
        let cf_window = self.cf(cf::USAGE_EVENTS_BY_WINDOW)?;

        let _guard = self.lock_writes();

        let mut batch = WriteBatch::default();
        let mut batched: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut inserted = 0;

        for event in events {
            // Skip-on-duplicate: already stored, or already earlier in this
            // same batch.
            if batched.contains(event.fingerprint.as_str()) {
                continue;
            }
            let exists = self
                .db
                .get_cf(&cf_events, keys::usage_event_key(&event.fingerprint))
                .map_err(|e| StoreError::Database(e.to_string()))?
                .is_some();
            if exists {
                continue;
            }

            let value = Self::serialize(event)?;
            batch.put_cf(&cf_events, keys::usage_event_key(&event.fingerprint), &value);

            // Unattributed events carry no subscription and cannot be window
            // scanned; they become visible once re-submitted with attribution.
            if let Some(subscription_id) = &event.subscription_id {
                batch.put_cf(
                    &cf_window,
                    keys::usage_window_key(
                        &event.organization_id,
                        subscription_id,
                        event.recorded_at,
                        &event.fingerprint,
                    ),
                    [],
                );
            }

            batched.insert(event.fingerprint.as_str());
            inserted += 1;
        }

        if inserted > 0 {
            self.db
                .write(batch)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        Ok(inserted)
    }

    fn get_usage_event(
        &self,
        claims: &BillingClaims,
        fingerprint: &str,
    ) -> Result<Option<UsageEvent>> {
        let cf = self.cf(cf::USAGE_EVENTS)?;

        let Some(event) = self
            .db
            .get_cf(&cf, keys::usage_event_key(fingerprint))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize::<UsageEvent>(&data))
            .transpose()?
        else {
            return Ok(None);
        };

        Self::check_scope(claims, &event.organization_id, "usage_event", &fingerprint)?;
        Ok(Some(event))
    }

    fn list_usage_events(
        &self,
        claims: &BillingClaims,
        subscription_id: &SubscriptionId,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        feature_keys: Option<&[String]>,
    ) -> Result<Vec<UsageEvent>> {
        let cf_window = self.cf(cf::USAGE_EVENTS_BY_WINDOW)?;

        let start = keys::usage_window_bound(&claims.organization_id, subscription_id, period_start);
        let end = keys::usage_window_bound(&claims.organization_id, subscription_id, period_end);

        let iter = self
            .db
            .iterator_cf(&cf_window, IteratorMode::From(&start, Direction::Forward));

        let mut events = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            // The end bound excludes recorded_at == period_end.
            if key.as_ref() >= end.as_slice() {
                break;
            }

            let fingerprint = keys::extract_window_fingerprint(&key);
            let Some(event) = self.get_usage_event(claims, &fingerprint)? else {
                continue;
            };

            if let Some(wanted) = feature_keys {
                if !wanted.contains(&event.feature_key) {
                    continue;
                }
            }

            events.push(event);
        }

        Ok(events)
    }

    // =========================================================================
    // Usage Aggregate Operations
    // =========================================================================

    fn replace_aggregate(&self, claims: &BillingClaims, aggregate: &UsageAggregate) -> Result<()> {
        Self::check_scope(
            claims,
            &aggregate.key.organization_id,
            "usage_aggregate",
            &aggregate.key.feature_key,
        )?;

        let cf = self.cf(cf::USAGE_AGGREGATES)?;
        let value = Self::serialize(aggregate)?;

        // A put supersedes any pending merge operands for the key, which is
        // exactly the upsert-replace contract.
        self.db
            .put_cf(&cf, keys::aggregate_key(&aggregate.key), value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn increment_aggregate(
        &self,
        claims: &BillingClaims,
        key: &AggregateKey,
        unit: &str,
        delta: Decimal,
        source: &UsageSource,
    ) -> Result<()> {
        Self::check_scope(
            claims,
            &key.organization_id,
            "usage_aggregate",
            &key.feature_key,
        )?;

        let cf = self.cf(cf::USAGE_AGGREGATES)?;
        let operand = UsageAggregate {
            key: key.clone(),
            quantity: delta,
            unit: unit.to_string(),
            source: source.clone(),
            updated_at: Utc::now(),
        };
        let value = Self::serialize(&operand)?;

        self.db
            .merge_cf(&cf, keys::aggregate_key(key), value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_aggregate(
        &self,
        claims: &BillingClaims,
        key: &AggregateKey,
    ) -> Result<Option<UsageAggregate>> {
        Self::check_scope(
            claims,
            &key.organization_id,
            "usage_aggregate",
            &key.feature_key,
        )?;

        let cf = self.cf(cf::USAGE_AGGREGATES)?;
        self.db
            .get_cf(&cf, keys::aggregate_key(key))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    fn insert_invoice(
        &self,
        claims: &BillingClaims,
        invoice: &Invoice,
        lines: &[InvoiceLine],
    ) -> Result<()> {
        Self::check_scope(claims, &invoice.organization_id, "invoice", &invoice.id)?;

        let cf_invoices = self.cf(cf::INVOICES)?;
        let cf_by_number = self.cf(cf::INVOICES_BY_NUMBER)?;
        let cf_lines = self.cf(cf::INVOICE_LINES)?;

        let _guard = self.lock_writes();

        // The number index is the unique constraint that dedupes invoice
        // creation under at-least-once job delivery.
        let number_taken = self
            .db
            .get_cf(&cf_by_number, keys::invoice_number_key(&invoice.number))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        if number_taken {
            return Err(StoreError::DuplicateInvoiceNumber {
                number: invoice.number.clone(),
            });
        }

        let value = Self::serialize(invoice)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_invoices, keys::invoice_key(&invoice.id), &value);
        batch.put_cf(
            &cf_by_number,
            keys::invoice_number_key(&invoice.number),
            invoice.id.as_bytes(),
        );

        for (sequence, line) in lines.iter().enumerate() {
            let line_value = Self::serialize(line)?;
            #[allow(clippy::cast_possible_truncation)]
            batch.put_cf(
                &cf_lines,
                keys::invoice_line_key(&invoice.id, sequence as u32),
                &line_value,
            );
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_invoice(&self, claims: &BillingClaims, id: &InvoiceId) -> Result<Option<Invoice>> {
        match self.fetch_invoice(claims, id) {
            Ok(invoice) => Ok(Some(invoice)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn find_invoice_by_number(
        &self,
        claims: &BillingClaims,
        number: &str,
    ) -> Result<Option<Invoice>> {
        let cf_by_number = self.cf(cf::INVOICES_BY_NUMBER)?;

        let Some(id_bytes) = self
            .db
            .get_cf(&cf_by_number, keys::invoice_number_key(number))
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };

        let uuid = uuid::Uuid::from_slice(&id_bytes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.get_invoice(claims, &InvoiceId::from_uuid(uuid))
    }

    fn list_invoice_lines(
        &self,
        claims: &BillingClaims,
        id: &InvoiceId,
    ) -> Result<Vec<InvoiceLine>> {
        // Scope is enforced through the invoice record itself.
        self.fetch_invoice(claims, id)?;

        let cf_lines = self.cf(cf::INVOICE_LINES)?;
        let prefix = keys::invoice_lines_prefix(id);

        let iter = self
            .db
            .iterator_cf(&cf_lines, IteratorMode::From(&prefix, Direction::Forward));

        let mut lines = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            lines.push(Self::deserialize(&value)?);
        }

        Ok(lines)
    }

    fn record_payment(
        &self,
        claims: &BillingClaims,
        id: &InvoiceId,
        amount_cents: i64,
        paid_at: DateTime<Utc>,
    ) -> Result<Invoice> {
        if amount_cents < 0 {
            return Err(StoreError::InvalidAmount { amount_cents });
        }

        let _guard = self.lock_writes();

        let mut invoice = self.fetch_invoice(claims, id)?;
        if invoice.status.is_terminal() {
            return Err(StoreError::InvoiceClosed {
                invoice_id: id.to_string(),
                status: invoice.status,
            });
        }

        // Balance only decreases, floored at zero.
        invoice.balance_cents = (invoice.balance_cents - amount_cents).max(0);
        invoice.paid_at = Some(paid_at);
        if invoice.balance_cents == 0 {
            invoice.status = InvoiceStatus::Paid;
        }
        invoice.updated_at = Utc::now();

        self.write_invoice(&invoice)?;
        Ok(invoice)
    }

    fn set_invoice_status(
        &self,
        claims: &BillingClaims,
        id: &InvoiceId,
        status: InvoiceStatus,
    ) -> Result<Invoice> {
        let _guard = self.lock_writes();

        let mut invoice = self.fetch_invoice(claims, id)?;
        if invoice.status.is_terminal() {
            return Err(StoreError::InvoiceClosed {
                invoice_id: id.to_string(),
                status: invoice.status,
            });
        }

        invoice.status = status;
        if status == InvoiceStatus::Void {
            invoice.voided_at = Some(Utc::now());
        }
        invoice.updated_at = Utc::now();

        self.write_invoice(&invoice)?;
        Ok(invoice)
    }

    fn issue_credit(&self, claims: &BillingClaims, memo: &CreditMemo) -> Result<Invoice> {
        Self::check_scope(claims, &memo.organization_id, "credit_memo", &memo.id)?;
        if memo.amount_cents < 0 {
            return Err(StoreError::InvalidAmount {
                amount_cents: memo.amount_cents,
            });
        }

        let cf_memos = self.cf(cf::CREDIT_MEMOS)?;
        let cf_by_invoice = self.cf(cf::CREDIT_MEMOS_BY_INVOICE)?;
        let cf_invoices = self.cf(cf::INVOICES)?;

        let _guard = self.lock_writes();

        let mut invoice = self.fetch_invoice(claims, &memo.invoice_id)?;
        if !invoice.status.accepts_dispute() {
            return Err(StoreError::InvoiceClosed {
                invoice_id: memo.invoice_id.to_string(),
                status: invoice.status,
            });
        }

        invoice.status = InvoiceStatus::Uncollectible;
        invoice.updated_at = Utc::now();

        let memo_value = Self::serialize(memo)?;
        let invoice_value = Self::serialize(&invoice)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_memos, keys::credit_memo_key(&memo.id), &memo_value);
        batch.put_cf(
            &cf_by_invoice,
            keys::invoice_memo_key(&memo.invoice_id, &memo.id),
            [],
        );
        batch.put_cf(&cf_invoices, keys::invoice_key(&invoice.id), &invoice_value);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(invoice)
    }

    fn list_credit_memos(&self, claims: &BillingClaims, id: &InvoiceId) -> Result<Vec<CreditMemo>> {
        self.fetch_invoice(claims, id)?;

        let cf_memos = self.cf(cf::CREDIT_MEMOS)?;
        let cf_by_invoice = self.cf(cf::CREDIT_MEMOS_BY_INVOICE)?;
        let prefix = keys::invoice_memos_prefix(id);

        let iter = self
            .db
            .iterator_cf(&cf_by_invoice, IteratorMode::From(&prefix, Direction::Forward));

        let mut memos = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }

            let memo_id = keys::extract_memo_id(&key);
            let memo = self
                .db
                .get_cf(&cf_memos, keys::credit_memo_key(&memo_id))
                .map_err(|e| StoreError::Database(e.to_string()))?
                .map(|data| Self::deserialize(&data))
                .transpose()?;
            if let Some(memo) = memo {
                memos.push(memo);
            }
        }

        Ok(memos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use meterbill_core::{
        derive_fingerprint, BillingInterval, CreditReason, NewUsageEvent, PackageId, Resolution,
        SubscriptionStatus,
    };
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn test_subscription(claims: &BillingClaims, status: SubscriptionStatus) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::generate(),
            organization_id: claims.organization_id,
            package_id: PackageId::generate(),
            status,
            currency: "usd".into(),
            amount_cents: 10000,
            billing_interval: BillingInterval::Monthly,
            current_period_start: at(1, 0),
            current_period_end: at(31, 0),
            trial_ends_at: None,
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_event(
        claims: &BillingClaims,
        subscription_id: SubscriptionId,
        quantity: &str,
        recorded_at: DateTime<Utc>,
    ) -> UsageEvent {
        NewUsageEvent {
            organization_id: claims.organization_id,
            subscription_id: Some(subscription_id),
            tenant_id: None,
            product_id: None,
            feature_key: "ai.tokens".into(),
            quantity: dec(quantity),
            unit: "tokens".into(),
            recorded_at,
            source: UsageSource::Api,
            fingerprint: None,
            metadata: serde_json::Value::Null,
        }
        .into_event()
        .unwrap()
    }

    fn test_invoice(claims: &BillingClaims, total_cents: i64) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: InvoiceId::generate(),
            organization_id: claims.organization_id,
            subscription_id: None,
            number: meterbill_core::generate_invoice_number(now),
            status: InvoiceStatus::Open,
            currency: "usd".into(),
            subtotal_cents: total_cents,
            tax_cents: 0,
            total_cents,
            balance_cents: total_cents,
            issued_at: now,
            due_at: None,
            paid_at: None,
            voided_at: None,
            external_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn usage_event_dedup_by_fingerprint() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());
        let sub = SubscriptionId::generate();

        let event = test_event(&claims, sub, "1500", at(1, 12));

        // First submission inserts; identical re-submission is a no-op.
        assert_eq!(store.insert_usage_events(&claims, &[event.clone()]).unwrap(), 1);
        assert_eq!(store.insert_usage_events(&claims, &[event.clone()]).unwrap(), 0);

        // Duplicates within one batch also collapse.
        let fresh = test_event(&claims, sub, "42", at(2, 12));
        assert_eq!(
            store
                .insert_usage_events(&claims, &[fresh.clone(), fresh.clone(), event])
                .unwrap(),
            1
        );

        let stored = store.get_usage_event(&claims, &fresh.fingerprint).unwrap();
        assert_eq!(stored.unwrap().quantity, dec("42"));
    }

    #[test]
    fn window_listing_is_half_open_and_ordered() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());
        let sub = SubscriptionId::generate();

        let events = vec![
            test_event(&claims, sub, "3", at(5, 0)),
            test_event(&claims, sub, "1", at(1, 0)),
            // recorded exactly at period_end: excluded
            test_event(&claims, sub, "9", at(10, 0)),
            test_event(&claims, sub, "2", at(3, 0)),
        ];
        store.insert_usage_events(&claims, &events).unwrap();

        let listed = store
            .list_usage_events(&claims, &sub, at(1, 0), at(10, 0), None)
            .unwrap();

        let quantities: Vec<_> = listed.iter().map(|e| e.quantity).collect();
        assert_eq!(quantities, vec![dec("1"), dec("2"), dec("3")]);
    }

    #[test]
    fn window_listing_filters_feature_keys() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());
        let sub = SubscriptionId::generate();

        let mut storage_event = test_event(&claims, sub, "7", at(2, 0));
        storage_event.feature_key = "storage.gb".into();
        storage_event.unit = "gb".into();
        storage_event.fingerprint = derive_fingerprint(
            &claims.organization_id,
            Some(&sub),
            "storage.gb",
            "gb",
            at(2, 0),
            dec("7"),
        );
        let token_event = test_event(&claims, sub, "100", at(2, 6));

        store
            .insert_usage_events(&claims, &[storage_event, token_event])
            .unwrap();

        let filter = vec!["ai.tokens".to_string()];
        let listed = store
            .list_usage_events(&claims, &sub, at(1, 0), at(3, 0), Some(&filter))
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].feature_key, "ai.tokens");
    }

    #[test]
    fn increment_creates_then_accumulates() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let key = AggregateKey {
            organization_id: claims.organization_id,
            subscription_id: SubscriptionId::generate(),
            feature_key: "ai.tokens".into(),
            resolution: Resolution::Daily,
            period_start: at(1, 0),
            period_end: at(2, 0),
        };

        // No existence check needed: the first merge creates the row.
        store
            .increment_aggregate(&claims, &key, "tokens", dec("0.1"), &UsageSource::Worker)
            .unwrap();
        for _ in 0..9 {
            store
                .increment_aggregate(&claims, &key, "tokens", dec("0.1"), &UsageSource::Worker)
                .unwrap();
        }
        for _ in 0..10 {
            store
                .increment_aggregate(&claims, &key, "tokens", dec("0.2"), &UsageSource::Worker)
                .unwrap();
        }

        let aggregate = store.get_aggregate(&claims, &key).unwrap().unwrap();
        // Decimal-exact: no 2.9999999999999996 here.
        assert_eq!(aggregate.quantity, dec("3.0"));
    }

    #[test]
    fn replace_overwrites_incremented_value() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let key = AggregateKey {
            organization_id: claims.organization_id,
            subscription_id: SubscriptionId::generate(),
            feature_key: "ai.tokens".into(),
            resolution: Resolution::Monthly,
            period_start: at(1, 0),
            period_end: at(31, 0),
        };

        store
            .increment_aggregate(&claims, &key, "tokens", dec("500"), &UsageSource::Api)
            .unwrap();

        // The scheduled aggregator recomputes and replaces; its value wins.
        let recomputed = UsageAggregate {
            key: key.clone(),
            quantity: dec("1500"),
            unit: "tokens".into(),
            source: UsageSource::Worker,
            updated_at: Utc::now(),
        };
        store.replace_aggregate(&claims, &recomputed).unwrap();

        let aggregate = store.get_aggregate(&claims, &key).unwrap().unwrap();
        assert_eq!(aggregate.quantity, dec("1500"));

        // Increments on top of a replaced value add to it.
        store
            .increment_aggregate(&claims, &key, "tokens", dec("25"), &UsageSource::Api)
            .unwrap();
        let aggregate = store.get_aggregate(&claims, &key).unwrap().unwrap();
        assert_eq!(aggregate.quantity, dec("1525"));
    }

    #[test]
    fn absent_aggregate_is_none_not_zero() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let key = AggregateKey {
            organization_id: claims.organization_id,
            subscription_id: SubscriptionId::generate(),
            feature_key: "ai.tokens".into(),
            resolution: Resolution::Daily,
            period_start: at(1, 0),
            period_end: at(2, 0),
        };

        assert!(store.get_aggregate(&claims, &key).unwrap().is_none());
    }

    #[test]
    fn second_active_subscription_rejected() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let first = test_subscription(&claims, SubscriptionStatus::Active);
        store.put_subscription(&claims, &first).unwrap();

        let second = test_subscription(&claims, SubscriptionStatus::Trialing);
        assert!(matches!(
            store.put_subscription(&claims, &second),
            Err(StoreError::ActiveSubscriptionExists { .. })
        ));

        // A canceled subscription coexists fine.
        let canceled = test_subscription(&claims, SubscriptionStatus::Canceled);
        store.put_subscription(&claims, &canceled).unwrap();

        // Re-writing the same active subscription (renewal) is allowed.
        store.put_subscription(&claims, &first).unwrap();

        let active = store.find_active_subscription(&claims).unwrap().unwrap();
        assert_eq!(active.id, first.id);
    }

    #[test]
    fn invoice_number_collision_rejected() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&claims, 5000);
        store.insert_invoice(&claims, &invoice, &[]).unwrap();

        let mut copy = test_invoice(&claims, 7000);
        copy.number.clone_from(&invoice.number);
        assert!(matches!(
            store.insert_invoice(&claims, &copy, &[]),
            Err(StoreError::DuplicateInvoiceNumber { .. })
        ));

        let found = store
            .find_invoice_by_number(&claims, &invoice.number)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, invoice.id);
    }

    #[test]
    fn partial_then_full_payment() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&claims, 10000);
        store.insert_invoice(&claims, &invoice, &[]).unwrap();

        let after_partial = store
            .record_payment(&claims, &invoice.id, 4000, Utc::now())
            .unwrap();
        assert_eq!(after_partial.balance_cents, 6000);
        assert_eq!(after_partial.status, InvoiceStatus::Open);
        assert!(after_partial.paid_at.is_some());

        let after_full = store
            .record_payment(&claims, &invoice.id, 6000, Utc::now())
            .unwrap();
        assert_eq!(after_full.balance_cents, 0);
        assert_eq!(after_full.status, InvoiceStatus::Paid);
    }

    #[test]
    fn overpayment_floors_at_zero() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&claims, 1000);
        store.insert_invoice(&claims, &invoice, &[]).unwrap();

        let updated = store
            .record_payment(&claims, &invoice.id, 99999, Utc::now())
            .unwrap();
        assert_eq!(updated.balance_cents, 0);
        assert_eq!(updated.status, InvoiceStatus::Paid);
    }

    #[test]
    fn payment_against_paid_invoice_rejected() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&claims, 1000);
        store.insert_invoice(&claims, &invoice, &[]).unwrap();
        store
            .record_payment(&claims, &invoice.id, 1000, Utc::now())
            .unwrap();

        assert!(matches!(
            store.record_payment(&claims, &invoice.id, 1000, Utc::now()),
            Err(StoreError::InvoiceClosed {
                status: InvoiceStatus::Paid,
                ..
            })
        ));
    }

    #[test]
    fn negative_payment_rejected() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&claims, 1000);
        store.insert_invoice(&claims, &invoice, &[]).unwrap();

        assert!(matches!(
            store.record_payment(&claims, &invoice.id, -1, Utc::now()),
            Err(StoreError::InvalidAmount { amount_cents: -1 })
        ));
    }

    #[test]
    fn issue_credit_marks_uncollectible() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&claims, 10000);
        store.insert_invoice(&claims, &invoice, &[]).unwrap();

        let memo = CreditMemo::new(
            claims.organization_id,
            invoice.id,
            4200,
            "usd".into(),
            CreditReason::ServiceFailure,
            serde_json::Value::Null,
        );
        let updated = store.issue_credit(&claims, &memo).unwrap();
        assert_eq!(updated.status, InvoiceStatus::Uncollectible);

        let memos = store.list_credit_memos(&claims, &invoice.id).unwrap();
        assert_eq!(memos.len(), 1);
        assert_eq!(memos[0].amount_cents, 4200);
        assert_eq!(memos[0].reason, CreditReason::ServiceFailure);

        // A second dispute against the now-uncollectible invoice is rejected.
        let again = CreditMemo::new(
            claims.organization_id,
            invoice.id,
            100,
            "usd".into(),
            CreditReason::ServiceFailure,
            serde_json::Value::Null,
        );
        assert!(matches!(
            store.issue_credit(&claims, &again),
            Err(StoreError::InvoiceClosed { .. })
        ));
    }

    #[test]
    fn credit_allowed_against_paid_invoice() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&claims, 5000);
        store.insert_invoice(&claims, &invoice, &[]).unwrap();
        store
            .record_payment(&claims, &invoice.id, 5000, Utc::now())
            .unwrap();

        let memo = CreditMemo::new(
            claims.organization_id,
            invoice.id,
            5000,
            "usd".into(),
            CreditReason::DuplicateCharge,
            serde_json::Value::Null,
        );
        let updated = store.issue_credit(&claims, &memo).unwrap();
        assert_eq!(updated.status, InvoiceStatus::Uncollectible);
    }

    #[test]
    fn set_status_rejected_on_terminal_invoice() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&claims, 1000);
        store.insert_invoice(&claims, &invoice, &[]).unwrap();

        let voided = store
            .set_invoice_status(&claims, &invoice.id, InvoiceStatus::Void)
            .unwrap();
        assert_eq!(voided.status, InvoiceStatus::Void);
        assert!(voided.voided_at.is_some());

        assert!(matches!(
            store.set_invoice_status(&claims, &invoice.id, InvoiceStatus::Open),
            Err(StoreError::InvoiceClosed { .. })
        ));
    }

    #[test]
    fn scope_violation_on_foreign_invoice() {
        let (store, _dir) = create_test_store();
        let owner = BillingClaims::for_organization(OrganizationId::generate());
        let intruder = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&owner, 1000);
        store.insert_invoice(&owner, &invoice, &[]).unwrap();

        assert!(matches!(
            store.get_invoice(&intruder, &invoice.id),
            Err(StoreError::ScopeViolation { .. })
        ));
        assert!(matches!(
            store.record_payment(&intruder, &invoice.id, 100, Utc::now()),
            Err(StoreError::ScopeViolation { .. })
        ));
    }

    #[test]
    fn invoice_lines_read_back_in_order() {
        let (store, _dir) = create_test_store();
        let claims = BillingClaims::for_organization(OrganizationId::generate());

        let invoice = test_invoice(&claims, 13000);
        let lines: Vec<InvoiceLine> = ["monthly subscription", "ai.tokens usage", "Tax"]
            .iter()
            .enumerate()
            .map(|(i, desc)| InvoiceLine {
                invoice_id: invoice.id,
                line_type: meterbill_core::LineType::Adjustment,
                description: (*desc).to_string(),
                feature_key: None,
                quantity: Decimal::ONE,
                unit_amount_cents: i64::try_from(i).unwrap(),
                amount_cents: i64::try_from(i).unwrap(),
                usage_period_start: None,
                usage_period_end: None,
            })
            .collect();

        store.insert_invoice(&claims, &invoice, &lines).unwrap();

        let listed = store.list_invoice_lines(&claims, &invoice.id).unwrap();
        let descriptions: Vec<_> = listed.iter().map(|l| l.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec!["monthly subscription", "ai.tokens usage", "Tax"]
        );
    }
}
