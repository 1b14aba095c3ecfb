use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a rate limit record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitKey {
    /// Executions of a unit for one tenant.
    Unit {
        /// Unit name.
        unit: String,
        /// Tenant id.
        tenant: String,
    },
    /// Proactive executions of a unit towards one customer.
    Customer {
        /// Unit name.
        unit: String,
        /// Tenant id.
        tenant: String,
        /// Customer id.
        customer: String,
    },
}

impl LimitKey {
    /// Key for the (unit, tenant) record.
    #[must_use]
    pub fn unit(unit: &str, tenant: &str) -> Self {
        Self::Unit {
            unit: unit.to_string(),
            tenant: tenant.to_string(),
        }
    }

    /// Key for the (unit, tenant, customer) record.
    #[must_use]
    pub fn customer(unit: &str, tenant: &str, customer: &str) -> Self {
        Self::Customer {
            unit: unit.to_string(),
            tenant: tenant.to_string(),
            customer: customer.to_string(),
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit { unit, tenant } => write!(f, "{unit}:{tenant}"),
            Self::Customer {
                unit,
                tenant,
                customer,
            } => write!(f, "{unit}:{tenant}:{customer}"),
        }
    }
}

/// Execution counters of one key.
///
/// `count` covers the day that started at `first_execution_at`; `hour_count` covers the
/// hour that started at `hour_started_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Executions since `first_execution_at`.
    pub count: u32,
    /// Start of the daily window.
    pub first_execution_at: DateTime<Utc>,
    /// Most recent execution.
    pub last_execution_at: DateTime<Utc>,
    /// Start of the current hourly bucket.
    pub hour_started_at: DateTime<Utc>,
    /// Executions in the current hourly bucket.
    pub hour_count: u32,
}

impl RateLimitRecord {
    pub(crate) const fn empty(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            first_execution_at: now,
            last_execution_at: now,
            hour_started_at: now,
            hour_count: 0,
        }
    }

    /// Counts one execution at `now`, restarting windows that have elapsed.
    pub(crate) fn bump(&mut self, now: DateTime<Utc>) {
        if now - self.first_execution_at >= Duration::hours(24) {
            *self = Self::empty(now);
        }
        if now - self.hour_started_at >= Duration::hours(1) {
            self.hour_started_at = now;
            self.hour_count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.hour_count = self.hour_count.saturating_add(1);
        self.last_execution_at = now;
    }

    /// Whether the daily window has fully elapsed.
    #[must_use]
    pub fn day_elapsed(&self, now: DateTime<Utc>) -> bool {
        now - self.first_execution_at >= Duration::hours(24)
    }

    /// Executions in the trailing hour bucket.
    #[must_use]
    pub fn executions_this_hour(&self, now: DateTime<Utc>) -> u32 {
        if now - self.hour_started_at < Duration::hours(1) {
            self.hour_count
        } else {
            0
        }
    }

    /// Executions in the trailing day window.
    #[must_use]
    pub fn executions_today(&self, now: DateTime<Utc>) -> u32 {
        if self.day_elapsed(now) {
            0
        } else {
            self.count
        }
    }

    /// Time until the hourly bucket rolls over.
    #[must_use]
    pub fn hour_reset_in(&self, now: DateTime<Utc>) -> Duration {
        (self.hour_started_at + Duration::hours(1) - now).max(Duration::zero())
    }

    /// Time until the daily window rolls over.
    #[must_use]
    pub fn day_reset_in(&self, now: DateTime<Utc>) -> Duration {
        (self.first_execution_at + Duration::hours(24) - now).max(Duration::zero())
    }

    /// Time left of a cooldown measured from the last execution, if still running.
    #[must_use]
    pub fn cooldown_remaining(&self, cooldown: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let elapsed = now - self.last_execution_at;
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_bucket_rolls_over() {
        let start = Utc::now();
        let mut record = RateLimitRecord::empty(start);
        record.bump(start);
        record.bump(start + Duration::minutes(10));
        assert_eq!(record.executions_this_hour(start + Duration::minutes(30)), 2);
        assert_eq!(record.executions_this_hour(start + Duration::minutes(61)), 0);

        record.bump(start + Duration::minutes(70));
        assert_eq!(record.hour_count, 1);
        assert_eq!(record.count, 3);
        assert_eq!(record.executions_today(start + Duration::hours(2)), 3);
    }

    #[test]
    fn day_window_resets_on_bump() {
        let start = Utc::now();
        let mut record = RateLimitRecord::empty(start);
        record.bump(start);
        record.bump(start + Duration::hours(25));
        assert_eq!(record.count, 1);
        assert_eq!(record.first_execution_at, start + Duration::hours(25));
    }

    #[test]
    fn cooldown_remaining_counts_down() {
        let start = Utc::now();
        let mut record = RateLimitRecord::empty(start);
        record.bump(start);
        let left = record
            .cooldown_remaining(Duration::minutes(15), start + Duration::minutes(5))
            .unwrap();
        assert_eq!(left, Duration::minutes(10));
        assert!(record
            .cooldown_remaining(Duration::minutes(15), start + Duration::minutes(15))
            .is_none());
    }
}
