//! Subscription records.
//!
//! Subscriptions are the dependency surface the invoice builder reads; they
//! are created and mutated elsewhere (plan purchase, renewal, cancellation)
//! and never physically deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::ids::{OrganizationId, PackageId, SubscriptionId};

/// An organization's billing relationship with a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique subscription id.
    pub id: SubscriptionId,

    /// Owning organization.
    pub organization_id: OrganizationId,

    /// The package (plan) subscribed to.
    pub package_id: PackageId,

    /// Current lifecycle status.
    pub status: SubscriptionStatus,

    /// ISO 4217 currency code, lowercase (e.g. "usd").
    pub currency: String,

    /// Recurring charge per billing interval, in cents.
    pub amount_cents: i64,

    /// How often the recurring charge applies.
    pub billing_interval: BillingInterval,

    /// Start of the current billing period.
    pub current_period_start: DateTime<Utc>,

    /// End of the current billing period. Always after the start.
    pub current_period_end: DateTime<Utc>,

    /// When the trial ends, if the subscription started with one.
    pub trial_ends_at: Option<DateTime<Utc>>,

    /// Whether the subscription cancels at the end of the current period.
    pub cancel_at_period_end: bool,

    /// When the subscription was canceled, if it was.
    pub canceled_at: Option<DateTime<Utc>>,

    /// When the subscription was created.
    pub created_at: DateTime<Utc>,

    /// When the subscription was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Check the period invariant: `current_period_end > current_period_start`.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidPeriod` if the invariant does not hold.
    pub fn validate(&self) -> Result<()> {
        if self.current_period_end <= self.current_period_start {
            return Err(BillingError::InvalidPeriod {
                start: self.current_period_start,
                end: self.current_period_end,
            });
        }
        Ok(())
    }

    /// Whether this subscription counts as "the active subscription" for its
    /// organization. At most one subscription per organization may be
    /// active-like at a time.
    #[must_use]
    pub fn is_active_like(&self) -> bool {
        self.status.is_active_like()
    }
}

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// In a trial period; billable like an active subscription.
    Trialing,

    /// Active and billing normally.
    Active,

    /// Payment failed; still the organization's active subscription.
    PastDue,

    /// Canceled; no longer billable.
    Canceled,

    /// Created but initial payment never completed.
    Incomplete,

    /// Incomplete and past the completion window.
    IncompleteExpired,
}

impl SubscriptionStatus {
    /// Whether this status makes the subscription "the active subscription"
    /// for invoice building.
    #[must_use]
    pub const fn is_active_like(&self) -> bool {
        matches!(self, Self::Trialing | Self::Active | Self::PastDue)
    }

    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
        }
    }
}

/// How often a subscription's recurring charge applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    /// Billed every month.
    Monthly,

    /// Billed every three months.
    Quarterly,

    /// Billed every year.
    Annual,
}

impl BillingInterval {
    /// Get the interval name as a string. Used in default recurring-line
    /// descriptions ("monthly subscription").
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Annual => "annual",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn subscription(start_day: u32, end_day: u32) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::generate(),
            organization_id: OrganizationId::generate(),
            package_id: PackageId::generate(),
            status: SubscriptionStatus::Active,
            currency: "usd".into(),
            amount_cents: 10000,
            billing_interval: BillingInterval::Monthly,
            current_period_start: Utc.with_ymd_and_hms(2026, 1, start_day, 0, 0, 0).unwrap(),
            current_period_end: Utc.with_ymd_and_hms(2026, 1, end_day, 0, 0, 0).unwrap(),
            trial_ends_at: None,
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn valid_period_passes() {
        assert!(subscription(1, 31).validate().is_ok());
    }

    #[test]
    fn inverted_period_fails() {
        assert!(matches!(
            subscription(31, 1).validate(),
            Err(BillingError::InvalidPeriod { .. })
        ));
    }

    #[test]
    fn equal_period_fails() {
        assert!(subscription(15, 15).validate().is_err());
    }

    #[test]
    fn active_like_statuses() {
        assert!(SubscriptionStatus::Trialing.is_active_like());
        assert!(SubscriptionStatus::Active.is_active_like());
        assert!(SubscriptionStatus::PastDue.is_active_like());
        assert!(!SubscriptionStatus::Canceled.is_active_like());
        assert!(!SubscriptionStatus::Incomplete.is_active_like());
        assert!(!SubscriptionStatus::IncompleteExpired.is_active_like());
    }

    #[test]
    fn interval_as_str() {
        assert_eq!(BillingInterval::Monthly.as_str(), "monthly");
        assert_eq!(BillingInterval::Annual.as_str(), "annual");
    }
}
