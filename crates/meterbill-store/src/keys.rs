//! Key encoding utilities for `RocksDB`.
//!
//! Composite keys put fixed-width fields first (uuid bytes, big-endian
//! timestamps) so prefix iteration walks records in the order the callers
//! want them: events by recorded-at inside a subscription, lines by sequence
//! inside an invoice, memos by ULID time order.

use chrono::{DateTime, Utc};

use meterbill_core::{
    AggregateKey, CreditMemoId, InvoiceId, OrganizationId, SubscriptionId,
};

/// Encode an instant as 8 big-endian bytes of non-negative microseconds.
///
/// Pre-epoch instants clamp to zero; usage recorded before 1970 is not a
/// case this store orders.
#[must_use]
pub fn timestamp_micros_be(at: DateTime<Utc>) -> [u8; 8] {
    #[allow(clippy::cast_sign_loss)]
    let micros = at.timestamp_micros().max(0) as u64;
    micros.to_be_bytes()
}

/// Create a subscription key from a subscription ID.
#[must_use]
pub fn subscription_key(id: &SubscriptionId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create an organization-subscription index key.
///
/// Format: `organization_id (16 bytes) || subscription_id (16 bytes)`.
#[must_use]
pub fn org_subscription_key(org: &OrganizationId, id: &SubscriptionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(org.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

/// Create a prefix for iterating all subscriptions of an organization.
#[must_use]
pub fn org_subscriptions_prefix(org: &OrganizationId) -> Vec<u8> {
    org.as_bytes().to_vec()
}

/// Extract the subscription ID from an organization-subscription index key.
///
/// # Panics
///
/// Panics if the key is not at least 32 bytes.
#[must_use]
pub fn extract_subscription_id(key: &[u8]) -> SubscriptionId {
    let uuid = uuid::Uuid::from_slice(&key[16..32]).expect("valid UUID bytes");
    SubscriptionId::from_uuid(uuid)
}

/// Create a usage event key from a fingerprint.
#[must_use]
pub fn usage_event_key(fingerprint: &str) -> Vec<u8> {
    fingerprint.as_bytes().to_vec()
}

/// Create a window index key for an attributed usage event.
///
/// Format: `organization_id (16) || subscription_id (16) || recorded_at (8, BE micros) || fingerprint`.
#[must_use]
pub fn usage_window_key(
    org: &OrganizationId,
    subscription_id: &SubscriptionId,
    recorded_at: DateTime<Utc>,
    fingerprint: &str,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(40 + fingerprint.len());
    key.extend_from_slice(org.as_bytes());
    key.extend_from_slice(subscription_id.as_bytes());
    key.extend_from_slice(&timestamp_micros_be(recorded_at));
    key.extend_from_slice(fingerprint.as_bytes());
    key
}

/// Lower bound for a `[start, end)` window scan.
#[must_use]
pub fn usage_window_bound(
    org: &OrganizationId,
    subscription_id: &SubscriptionId,
    at: DateTime<Utc>,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(org.as_bytes());
    key.extend_from_slice(subscription_id.as_bytes());
    key.extend_from_slice(&timestamp_micros_be(at));
    key
}

/// Extract the fingerprint from a window index key.
///
/// # Panics
///
/// Panics if the key is shorter than the fixed prefix (40 bytes).
#[must_use]
pub fn extract_window_fingerprint(key: &[u8]) -> String {
    String::from_utf8_lossy(&key[40..]).into_owned()
}

/// Create a usage aggregate key from the composite aggregate key.
///
/// Format: `organization_id (16) || subscription_id (16) || resolution (1) ||
/// period_start (8) || period_end (8) || feature_key`. The variable-length
/// feature key goes last so the fixed fields stay comparable.
#[must_use]
pub fn aggregate_key(key: &AggregateKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(49 + key.feature_key.len());
    out.extend_from_slice(key.organization_id.as_bytes());
    out.extend_from_slice(key.subscription_id.as_bytes());
    out.push(key.resolution.tag());
    out.extend_from_slice(&timestamp_micros_be(key.period_start));
    out.extend_from_slice(&timestamp_micros_be(key.period_end));
    out.extend_from_slice(key.feature_key.as_bytes());
    out
}

/// Create an invoice key from an invoice ID.
#[must_use]
pub fn invoice_key(id: &InvoiceId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create an invoice-number index key.
#[must_use]
pub fn invoice_number_key(number: &str) -> Vec<u8> {
    number.as_bytes().to_vec()
}

/// Create an invoice line key.
///
/// Format: `invoice_id (16 bytes) || sequence (4 bytes, BE)`. Big-endian
/// sequence numbers keep prefix iteration in insertion order.
#[must_use]
pub fn invoice_line_key(id: &InvoiceId, sequence: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// Create a prefix for iterating all lines of an invoice.
#[must_use]
pub fn invoice_lines_prefix(id: &InvoiceId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Create a credit memo key from a memo ID.
#[must_use]
pub fn credit_memo_key(id: &CreditMemoId) -> Vec<u8> {
    id.to_bytes().to_vec()
}

/// Create an invoice-memo index key.
///
/// Format: `invoice_id (16 bytes) || credit_memo_id (16 bytes)`. ULID memo
/// ids keep per-invoice listings in issue order.
#[must_use]
pub fn invoice_memo_key(invoice_id: &InvoiceId, memo_id: &CreditMemoId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(invoice_id.as_bytes());
    key.extend_from_slice(&memo_id.to_bytes());
    key
}

/// Create a prefix for iterating all memos of an invoice.
#[must_use]
pub fn invoice_memos_prefix(id: &InvoiceId) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Extract the credit memo ID from an invoice-memo index key.
///
/// # Panics
///
/// Panics if the key is not at least 32 bytes.
#[must_use]
pub fn extract_memo_id(key: &[u8]) -> CreditMemoId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..32]);
    CreditMemoId::from_bytes(bytes).expect("valid ULID bytes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use meterbill_core::Resolution;

    #[test]
    fn window_keys_sort_by_recorded_at() {
        let org = OrganizationId::generate();
        let sub = SubscriptionId::generate();
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        let a = usage_window_key(&org, &sub, early, "ffff");
        let b = usage_window_key(&org, &sub, late, "0000");
        assert!(a < b);
    }

    #[test]
    fn window_bound_excludes_end_instant() {
        let org = OrganizationId::generate();
        let sub = SubscriptionId::generate();
        let end = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        let at_end = usage_window_key(&org, &sub, end, "0000");
        let bound = usage_window_bound(&org, &sub, end);
        assert!(at_end >= bound);
    }

    #[test]
    fn window_fingerprint_roundtrip() {
        let org = OrganizationId::generate();
        let sub = SubscriptionId::generate();
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 6, 30, 0).unwrap();

        let key = usage_window_key(&org, &sub, at, "abc123");
        assert_eq!(extract_window_fingerprint(&key), "abc123");
    }

    #[test]
    fn aggregate_keys_differ_per_resolution() {
        let key = AggregateKey {
            organization_id: OrganizationId::generate(),
            subscription_id: SubscriptionId::generate(),
            feature_key: "ai.tokens".into(),
            resolution: Resolution::Daily,
            period_start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            period_end: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
        };
        let mut monthly = key.clone();
        monthly.resolution = Resolution::Monthly;

        assert_ne!(aggregate_key(&key), aggregate_key(&monthly));
    }

    #[test]
    fn invoice_line_keys_preserve_sequence_order() {
        let id = InvoiceId::generate();
        let keys: Vec<_> = (0..5).map(|seq| invoice_line_key(&id, seq)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn memo_id_roundtrip() {
        let invoice_id = InvoiceId::generate();
        let memo_id = CreditMemoId::generate();
        let key = invoice_memo_key(&invoice_id, &memo_id);
        assert_eq!(extract_memo_id(&key), memo_id);
    }

    #[test]
    fn subscription_id_roundtrip() {
        let org = OrganizationId::generate();
        let sub = SubscriptionId::generate();
        let key = org_subscription_key(&org, &sub);
        assert_eq!(extract_subscription_id(&key), sub);
    }
}
