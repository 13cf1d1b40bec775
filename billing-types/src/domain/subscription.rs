//! Subscription domain model and lifecycle state machine.
//!
//! | From \ action | renew | cancel | suspend | resume |
//! |---------------|-------|--------|---------|--------|
//! | pending       |       |        |         |        |
//! | active        | yes   | yes    | yes*    |        |
//! | expired       | yes   | yes    |         |        |
//! | suspended     |       | yes    |         | yes    |
//! | cancelled     |       |        |         |        |
//!
//! `*` only while the period has not effectively lapsed.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::money::Money;
use crate::error::{DomainError, ValidationError};

uuid_id!(
    /// Unique identifier for a Subscription.
    SubscriptionId
);

persisted_enum! {
    pub enum SubscriptionStatus {
        Pending => "PENDING",
        Active => "ACTIVE",
        Expired => "EXPIRED",
        Cancelled => "CANCELLED",
        Suspended => "SUSPENDED",
    }
}

persisted_enum! {
    /// Status as seen by authorization checks at a given instant.
    pub enum EffectiveStatus {
        Pending => "PENDING",
        Active => "ACTIVE",
        Expired => "EXPIRED",
        Cancelled => "CANCELLED",
        Suspended => "SUSPENDED",
    }
}

persisted_enum! {
    pub enum SubscriptionType {
        OrgPlan => "ORG_PLAN",
        UserPlan => "USER_PLAN",
        UserCourse => "USER_COURSE",
    }
}

persisted_enum! {
    /// The recurrence period of a subscription.
    pub enum BillingCycle {
        Monthly => "MONTHLY",
        Yearly => "YEARLY",
        OneTime => "ONE_TIME",
    }
}

impl BillingCycle {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, BillingCycle::OneTime)
    }

    /// End of a period starting at `from`; `None` for open-ended grants.
    ///
    /// Month arithmetic clamps to the end of the target month, so Jan 31
    /// plus one month is the last day of February.
    pub fn period_end(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            BillingCycle::Monthly => from.checked_add_months(Months::new(1)),
            BillingCycle::Yearly => from.checked_add_months(Months::new(12)),
            BillingCycle::OneTime => None,
        }
    }
}

/// Lifecycle operations, used in transition errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAction {
    Renew,
    Cancel,
    Suspend,
    Resume,
}

impl std::fmt::Display for SubscriptionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionAction::Renew => "renew",
            SubscriptionAction::Cancel => "cancel",
            SubscriptionAction::Suspend => "suspend",
            SubscriptionAction::Resume => "resume",
        };
        f.write_str(s)
    }
}

/// What a subscription grants access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionGrant {
    OrgPlan {
        organization_id: String,
        plan_id: String,
        seats: u32,
    },
    UserPlan {
        user_id: String,
        plan_id: String,
    },
    UserCourse {
        user_id: String,
        course_id: String,
    },
}

impl SubscriptionGrant {
    pub fn subscription_type(&self) -> SubscriptionType {
        match self {
            SubscriptionGrant::OrgPlan { .. } => SubscriptionType::OrgPlan,
            SubscriptionGrant::UserPlan { .. } => SubscriptionType::UserPlan,
            SubscriptionGrant::UserCourse { .. } => SubscriptionType::UserCourse,
        }
    }

    /// The organization or user holding the grant.
    pub fn owner_ref(&self) -> &str {
        match self {
            SubscriptionGrant::OrgPlan {
                organization_id, ..
            } => organization_id,
            SubscriptionGrant::UserPlan { user_id, .. }
            | SubscriptionGrant::UserCourse { user_id, .. } => user_id,
        }
    }

    /// The plan or course being granted.
    pub fn target_ref(&self) -> &str {
        match self {
            SubscriptionGrant::OrgPlan { plan_id, .. }
            | SubscriptionGrant::UserPlan { plan_id, .. } => plan_id,
            SubscriptionGrant::UserCourse { course_id, .. } => course_id,
        }
    }

    pub fn is_course(&self) -> bool {
        matches!(self, SubscriptionGrant::UserCourse { .. })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.owner_ref().trim().is_empty() || self.target_ref().trim().is_empty() {
            return Err(ValidationError::Invalid(
                "grant owner and target must not be empty".into(),
            ));
        }
        if let SubscriptionGrant::OrgPlan { seats: 0, .. } = self {
            return Err(ValidationError::Invalid(
                "organization plans need at least one seat".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Billing {
    /// Price of one period
    pub amount: Money,
    pub billing_cycle: BillingCycle,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub total_paid: Money,
    pub last_payment_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RenewalRecord {
    pub renewed_at: DateTime<Utc>,
    pub previous_end_date: Option<DateTime<Utc>>,
    pub new_end_date: Option<DateTime<Utc>>,
    pub amount: Option<Money>,
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Cancellation {
    pub cancelled_at: DateTime<Utc>,
    pub reason: String,
    pub cancelled_by: String,
    /// Refund the canceller intends to issue; executing it is a ledger entry
    pub refund_amount: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Suspension {
    pub suspended_at: DateTime<Utc>,
    pub reason: String,
}

/// A recurring (or one-time) access grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub grant: SubscriptionGrant,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub billing: Billing,
    /// Payment that created the subscription; unique across subscriptions
    pub origin_transaction_id: Option<String>,
    pub renewal_history: Vec<RenewalRecord>,
    pub cancellation: Option<Cancellation>,
    pub suspension: Option<Suspension>,
    /// Optimistic concurrency token
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Creates an active subscription for a confirmed payment.
    ///
    /// A paid grant must name the transaction that paid for it; zero-amount
    /// grants may omit it.
    pub fn from_payment(
        grant: SubscriptionGrant,
        price: Money,
        billing_cycle: BillingCycle,
        origin_transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        grant.validate()?;
        if !price.is_zero() && origin_transaction_id.is_none() {
            return Err(ValidationError::Invalid(
                "a paid subscription requires the originating transaction".into(),
            )
            .into());
        }

        let end_date = billing_cycle.period_end(now);
        Ok(Self {
            id: SubscriptionId::new(),
            grant,
            status: SubscriptionStatus::Active,
            start_date: now,
            end_date,
            billing: Billing {
                amount: price,
                billing_cycle,
                next_billing_date: next_billing(billing_cycle, end_date),
                total_paid: price,
                last_payment_date: (!price.is_zero()).then_some(now),
            },
            origin_transaction_id,
            renewal_history: Vec::new(),
            cancellation: None,
            suspension: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        self.grant.subscription_type()
    }

    pub fn owner_ref(&self) -> &str {
        self.grant.owner_ref()
    }

    pub fn target_ref(&self) -> &str {
        self.grant.target_ref()
    }

    /// Checks the transition table without changing anything.
    pub fn check(&self, action: SubscriptionAction, now: DateTime<Utc>) -> Result<(), DomainError> {
        use SubscriptionAction as A;
        use SubscriptionStatus as S;

        let allowed = match (self.status, action) {
            (S::Active | S::Expired, A::Renew) => true,
            (S::Active | S::Expired | S::Suspended, A::Cancel) => true,
            (S::Active, A::Suspend) => !self.has_lapsed(now),
            (S::Suspended, A::Resume) => true,
            _ => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(DomainError::IllegalTransition {
                from: self.status,
                action,
            })
        }
    }

    /// Starts a new period from `now`.
    ///
    /// Returns `Ok(false)` without touching anything when a renewal with the
    /// same transaction id was already recorded.
    pub fn renew(
        &mut self,
        amount: Option<Money>,
        transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        if let Some(tx) = &transaction_id {
            if self.has_renewal(tx) {
                return Ok(false);
            }
        }
        self.check(SubscriptionAction::Renew, now)?;

        let total_paid = match &amount {
            Some(paid) => self.billing.total_paid.checked_add(*paid)?,
            None => self.billing.total_paid,
        };

        let new_end = self.billing.billing_cycle.period_end(now);
        self.renewal_history.push(RenewalRecord {
            renewed_at: now,
            previous_end_date: self.end_date,
            new_end_date: new_end,
            amount,
            transaction_id,
        });
        self.status = SubscriptionStatus::Active;
        self.end_date = new_end;
        self.billing.next_billing_date = next_billing(self.billing.billing_cycle, new_end);
        self.billing.total_paid = total_paid;
        if amount.is_some() {
            self.billing.last_payment_date = Some(now);
        }
        self.updated_at = now;
        Ok(true)
    }

    pub fn cancel(
        &mut self,
        reason: String,
        cancelled_by: String,
        refund_amount: Option<Money>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.check(SubscriptionAction::Cancel, now)?;
        if let Some(refund) = &refund_amount {
            self.billing.total_paid.ensure_same_currency(refund)?;
        }

        self.status = SubscriptionStatus::Cancelled;
        self.billing.next_billing_date = None;
        self.cancellation = Some(Cancellation {
            cancelled_at: now,
            reason,
            cancelled_by,
            refund_amount,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Freezes access without ending the period.
    pub fn suspend(&mut self, reason: String, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.check(SubscriptionAction::Suspend, now)?;
        self.status = SubscriptionStatus::Suspended;
        self.suspension = Some(Suspension {
            suspended_at: now,
            reason,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Lifts a suspension; the period end is unchanged.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.check(SubscriptionAction::Resume, now)?;
        self.status = SubscriptionStatus::Active;
        self.suspension = None;
        self.updated_at = now;
        Ok(())
    }

    /// Status for authorization purposes. Never writes.
    pub fn status_as_of(&self, now: DateTime<Utc>) -> EffectiveStatus {
        match self.status {
            SubscriptionStatus::Active if self.has_lapsed(now) => EffectiveStatus::Expired,
            SubscriptionStatus::Active => EffectiveStatus::Active,
            SubscriptionStatus::Pending => EffectiveStatus::Pending,
            SubscriptionStatus::Expired => EffectiveStatus::Expired,
            SubscriptionStatus::Cancelled => EffectiveStatus::Cancelled,
            SubscriptionStatus::Suspended => EffectiveStatus::Suspended,
        }
    }

    pub fn grants_access(&self, now: DateTime<Utc>) -> bool {
        self.status_as_of(now) == EffectiveStatus::Active
    }

    /// Whole days left in the period, rounded up; `None` when open-ended.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.end_date.map(|end| {
            let secs = (end - now).num_seconds();
            if secs <= 0 { 0 } else { (secs + 86_399) / 86_400 }
        })
    }

    /// Stored as active but past its end date.
    pub fn has_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.end_date.is_some_and(|end| end < now)
    }

    pub fn has_renewal(&self, transaction_id: &str) -> bool {
        self.renewal_history
            .iter()
            .any(|r| r.transaction_id.as_deref() == Some(transaction_id))
    }
}

fn next_billing(cycle: BillingCycle, end_date: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if cycle.is_recurring() { end_date } else { None }
}
