//! Layered admission control: global ceiling, unit policy, then per-customer throttling
//! for proactive units.

/// Proactive unit table.
pub mod proactive;
/// Per-key counters.
pub mod record;

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::Duration;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

pub use proactive::ProactiveRules;
pub use record::{LimitKey, RateLimitRecord};

use crate::{
    clock::{SharedClock, SystemClock},
    unit::RateLimitPolicy,
};

/// Machine-readable reason for a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DenialReason {
    /// The unit hit the global hourly ceiling for this tenant.
    GlobalHourlyCeiling {
        /// Ceiling.
        limit: u32,
    },
    /// The unit hit the global daily ceiling for this tenant.
    GlobalDailyCeiling {
        /// Ceiling.
        limit: u32,
    },
    /// The unit's own cooldown is still running.
    UnitCooldown {
        /// Configured cooldown.
        minutes: u32,
    },
    /// The unit's hourly cap is exhausted.
    UnitHourlyCap {
        /// Cap.
        limit: u32,
    },
    /// The unit's daily cap is exhausted.
    UnitDailyCap {
        /// Cap.
        limit: u32,
    },
    /// The customer already got a proactive message in the current window.
    ProactiveMessageLimit {
        /// Window length.
        window_hours: i64,
    },
    /// The unit's fixed per-customer cooldown is still running.
    ProactiveCooldown {
        /// Cooldown length.
        hours: i64,
    },
}

impl DenialReason {
    /// Stable code for logs and analytics.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::GlobalHourlyCeiling { .. } => "global_hourly_ceiling",
            Self::GlobalDailyCeiling { .. } => "global_daily_ceiling",
            Self::UnitCooldown { .. } => "unit_cooldown",
            Self::UnitHourlyCap { .. } => "unit_hourly_cap",
            Self::UnitDailyCap { .. } => "unit_daily_cap",
            Self::ProactiveMessageLimit { .. } => "proactive_message_limit",
            Self::ProactiveCooldown { .. } => "proactive_cooldown",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GlobalHourlyCeiling { limit } => {
                write!(f, "global safety ceiling of {limit} executions per hour reached")
            }
            Self::GlobalDailyCeiling { limit } => {
                write!(f, "global safety ceiling of {limit} executions per day reached")
            }
            Self::UnitCooldown { minutes } => write!(f, "unit cooldown of {minutes} minutes active"),
            Self::UnitHourlyCap { limit } => write!(f, "unit limit of {limit} executions per hour reached"),
            Self::UnitDailyCap { limit } => write!(f, "unit limit of {limit} executions per day reached"),
            Self::ProactiveMessageLimit { window_hours } => write!(
                f,
                "proactive message limit: one proactive message per customer every {window_hours} hours"
            ),
            Self::ProactiveCooldown { hours } => {
                write!(f, "proactive cooldown of {hours} hours for this customer active")
            }
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The unit may run.
    Allowed,
    /// The unit may not run now.
    Denied {
        /// Why.
        reason: DenialReason,
        /// When a retry could succeed.
        retry_after: Option<Duration>,
    },
}

impl Admission {
    /// Whether the unit may run.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    const fn deny(reason: DenialReason, retry_after: Duration) -> Self {
        Self::Denied {
            reason,
            retry_after: Some(retry_after),
        }
    }
}

/// Global ceilings applied to every (unit, tenant) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSettings {
    /// Executions allowed per trailing hour.
    pub global_hourly_ceiling: u32,
    /// Executions allowed per trailing day.
    pub global_daily_ceiling: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            global_hourly_ceiling: 100,
            global_daily_ceiling: 500,
        }
    }
}

type Slot = Arc<Mutex<RateLimitRecord>>;

/// In-memory admission control shared by concurrent dispatches.
///
/// Each key has its own mutex, so a read-modify-write on one key never interleaves and
/// checks on different keys never wait on each other.
#[derive(Debug)]
pub struct RateLimiter {
    settings: LimiterSettings,
    rules: ProactiveRules,
    clock: SharedClock,
    records: RwLock<HashMap<LimitKey, Slot>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimiterSettings::default(), ProactiveRules::default())
    }
}

impl RateLimiter {
    /// Limiter on the wall clock.
    #[must_use]
    pub fn new(settings: LimiterSettings, rules: ProactiveRules) -> Self {
        Self {
            settings,
            rules,
            clock: Arc::new(SystemClock),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Proactive unit table.
    #[must_use]
    pub const fn rules(&self) -> &ProactiveRules {
        &self.rules
    }

    /// Decides whether `unit_name` may run for the tenant (and customer) right now.
    #[must_use]
    pub fn check_allowed(
        &self,
        unit_name: &str,
        tenant_id: &str,
        policy: Option<&RateLimitPolicy>,
        customer_id: Option<&str>,
    ) -> Admission {
        let now = self.clock.now();

        if let Some(slot) = self.slot(&LimitKey::unit(unit_name, tenant_id)) {
            let record = slot.lock();
            if !record.day_elapsed(now) {
                let admission = self.check_unit_record(&record, policy, now);
                if !admission.is_allowed() {
                    return admission;
                }
            }
        }

        let Some(customer) = customer_id else {
            return Admission::Allowed;
        };
        if !self.rules.is_proactive(unit_name) {
            return Admission::Allowed;
        }
        let Some(slot) = self.slot(&LimitKey::customer(unit_name, tenant_id, customer)) else {
            return Admission::Allowed;
        };
        let record = slot.lock();
        if let Some(left) = record.cooldown_remaining(self.rules.window(), now) {
            return Admission::deny(
                DenialReason::ProactiveMessageLimit {
                    window_hours: self.rules.window().num_hours(),
                },
                left,
            );
        }
        if let Some(cooldown) = self.rules.fixed_cooldown(unit_name) {
            if let Some(left) = record.cooldown_remaining(cooldown, now) {
                return Admission::deny(
                    DenialReason::ProactiveCooldown {
                        hours: cooldown.num_hours(),
                    },
                    left,
                );
            }
        }
        Admission::Allowed
    }

    fn check_unit_record(
        &self,
        record: &RateLimitRecord,
        policy: Option<&RateLimitPolicy>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Admission {
        let this_hour = record.executions_this_hour(now);
        let today = record.executions_today(now);

        if this_hour >= self.settings.global_hourly_ceiling {
            return Admission::deny(
                DenialReason::GlobalHourlyCeiling {
                    limit: self.settings.global_hourly_ceiling,
                },
                record.hour_reset_in(now),
            );
        }
        if today >= self.settings.global_daily_ceiling {
            return Admission::deny(
                DenialReason::GlobalDailyCeiling {
                    limit: self.settings.global_daily_ceiling,
                },
                record.day_reset_in(now),
            );
        }

        let Some(policy) = policy else {
            return Admission::Allowed;
        };
        if let Some(minutes) = policy.cooldown_minutes {
            let cooldown = Duration::minutes(i64::from(minutes));
            if let Some(left) = record.cooldown_remaining(cooldown, now) {
                return Admission::deny(DenialReason::UnitCooldown { minutes }, left);
            }
        }
        if let Some(limit) = policy.max_per_hour {
            if this_hour >= limit {
                return Admission::deny(DenialReason::UnitHourlyCap { limit }, record.hour_reset_in(now));
            }
        }
        if let Some(limit) = policy.max_per_day {
            if today >= limit {
                return Admission::deny(DenialReason::UnitDailyCap { limit }, record.day_reset_in(now));
            }
        }
        Admission::Allowed
    }

    /// Counts a committed execution. Customer records are only kept for proactive units.
    pub fn record_execution(&self, unit_name: &str, tenant_id: &str, customer_id: Option<&str>) {
        let now = self.clock.now();
        self.slot_or_insert(LimitKey::unit(unit_name, tenant_id))
            .lock()
            .bump(now);

        if let Some(customer) = customer_id {
            if self.rules.is_proactive(unit_name) {
                self.slot_or_insert(LimitKey::customer(unit_name, tenant_id, customer))
                    .lock()
                    .bump(now);
            }
        }
    }

    /// Drops records whose governing window has fully elapsed. Returns how many were removed.
    /// A slot still held by an in-flight `record_execution` is kept.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let retention = self.rules.retention();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|key, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let record = slot.lock();
            match key {
                LimitKey::Unit { .. } => !record.day_elapsed(now),
                LimitKey::Customer { .. } => now - record.last_execution_at < retention,
            }
        });
        before - records.len()
    }

    /// Copy of one record.
    #[must_use]
    pub fn record(&self, key: &LimitKey) -> Option<RateLimitRecord> {
        self.slot(key).map(|slot| slot.lock().clone())
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn slot(&self, key: &LimitKey) -> Option<Slot> {
        self.records.read().get(key).cloned()
    }

    fn slot_or_insert(&self, key: LimitKey) -> Slot {
        if let Some(slot) = self.slot(&key) {
            return slot;
        }
        let now = self.clock.now();
        Arc::clone(
            self.records
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(RateLimitRecord::empty(now)))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = RateLimiter::default().with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    fn denial(admission: Admission) -> DenialReason {
        match admission {
            Admission::Denied { reason, .. } => reason,
            Admission::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn hourly_cap_denies_then_rolls_over() {
        let (limiter, clock) = limiter();
        let policy = RateLimitPolicy::per_hour(3);
        for _ in 0..3 {
            assert!(limiter
                .check_allowed("front_desk", "t1", Some(&policy), None)
                .is_allowed());
            limiter.record_execution("front_desk", "t1", None);
        }

        let admission = limiter.check_allowed("front_desk", "t1", Some(&policy), None);
        assert_eq!(denial(admission), DenialReason::UnitHourlyCap { limit: 3 });

        clock.advance(Duration::minutes(61));
        assert!(limiter
            .check_allowed("front_desk", "t1", Some(&policy), None)
            .is_allowed());
    }

    #[test]
    fn cooldown_reports_retry_after() {
        let (limiter, clock) = limiter();
        let policy = RateLimitPolicy::cooldown(30);
        limiter.record_execution("front_desk", "t1", None);
        clock.advance(Duration::minutes(10));
        match limiter.check_allowed("front_desk", "t1", Some(&policy), None) {
            Admission::Denied {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, DenialReason::UnitCooldown { minutes: 30 });
                assert_eq!(retry_after, Some(Duration::minutes(20)));
            }
            Admission::Allowed => panic!("cooldown should deny"),
        }
        // Other tenants are unaffected.
        assert!(limiter
            .check_allowed("front_desk", "t2", Some(&policy), None)
            .is_allowed());
    }

    #[test]
    fn global_ceiling_applies_without_policy() {
        let (limiter, clock) = limiter();
        for _ in 0..100 {
            limiter.record_execution("bulk", "t1", None);
        }
        assert_eq!(
            denial(limiter.check_allowed("bulk", "t1", None, None)),
            DenialReason::GlobalHourlyCeiling { limit: 100 }
        );
        clock.advance(Duration::hours(1));
        assert!(limiter.check_allowed("bulk", "t1", None, None).is_allowed());
    }

    #[test]
    fn global_ceiling_runs_before_policy() {
        let limiter = RateLimiter::new(
            LimiterSettings {
                global_hourly_ceiling: 2,
                global_daily_ceiling: 10,
            },
            ProactiveRules::empty(),
        );
        limiter.record_execution("u", "t", None);
        limiter.record_execution("u", "t", None);
        let admission = limiter.check_allowed("u", "t", Some(&RateLimitPolicy::cooldown(5)), None);
        assert_eq!(denial(admission), DenialReason::GlobalHourlyCeiling { limit: 2 });
    }

    #[test]
    fn daily_cap_counts_across_hours() {
        let (limiter, clock) = limiter();
        let policy = RateLimitPolicy::default().with_daily_cap(2);
        limiter.record_execution("u", "t", None);
        clock.advance(Duration::hours(3));
        limiter.record_execution("u", "t", None);
        clock.advance(Duration::hours(3));
        assert_eq!(
            denial(limiter.check_allowed("u", "t", Some(&policy), None)),
            DenialReason::UnitDailyCap { limit: 2 }
        );
        clock.advance(Duration::hours(19));
        assert!(limiter.check_allowed("u", "t", Some(&policy), None).is_allowed());
    }

    #[test]
    fn proactive_unit_is_throttled_per_customer() {
        let (limiter, clock) = limiter();
        limiter.record_execution("appointment_reminder", "t1", Some("cust-x"));
        clock.advance(Duration::hours(2));

        let reason = denial(limiter.check_allowed("appointment_reminder", "t1", None, Some("cust-x")));
        assert_eq!(reason, DenialReason::ProactiveMessageLimit { window_hours: 6 });
        assert!(reason.to_string().contains("proactive message limit"));

        assert!(limiter
            .check_allowed("appointment_reminder", "t1", None, Some("cust-y"))
            .is_allowed());
        clock.advance(Duration::hours(4));
        assert!(limiter
            .check_allowed("appointment_reminder", "t1", None, Some("cust-x"))
            .is_allowed());
    }

    #[test]
    fn fixed_cooldown_outlasts_the_window() {
        let (limiter, clock) = limiter();
        limiter.record_execution("reactivation_outreach", "t1", Some("c"));
        clock.advance(Duration::hours(10));
        assert_eq!(
            denial(limiter.check_allowed("reactivation_outreach", "t1", None, Some("c"))),
            DenialReason::ProactiveCooldown { hours: 72 }
        );
        clock.advance(Duration::hours(62));
        assert!(limiter
            .check_allowed("reactivation_outreach", "t1", None, Some("c"))
            .is_allowed());
    }

    #[test]
    fn reactive_units_keep_no_customer_records() {
        let (limiter, _clock) = limiter();
        limiter.record_execution("front_desk", "t1", Some("c"));
        assert!(limiter.record(&LimitKey::customer("front_desk", "t1", "c")).is_none());
        assert_eq!(limiter.record(&LimitKey::unit("front_desk", "t1")).unwrap().count, 1);
    }

    #[test]
    fn cleanup_purges_elapsed_windows() {
        let (limiter, clock) = limiter();
        limiter.record_execution("review_requester", "t1", Some("c"));
        limiter.record_execution("front_desk", "t1", None);
        assert_eq!(limiter.len(), 3);

        clock.advance(Duration::hours(25));
        assert_eq!(limiter.cleanup(), 2);
        assert!(limiter.record(&LimitKey::customer("review_requester", "t1", "c")).is_some());

        clock.advance(Duration::days(7));
        assert_eq!(limiter.cleanup(), 1);
        assert!(limiter.is_empty());
    }

    #[test]
    fn cleanup_keeps_slots_still_in_use() {
        let (limiter, clock) = limiter();
        limiter.record_execution("front_desk", "t1", None);
        clock.advance(Duration::hours(25));

        let held = limiter.slot_or_insert(LimitKey::unit("front_desk", "t1"));
        assert_eq!(limiter.cleanup(), 0);
        held.lock().bump(clock.now());
        drop(held);

        let record = limiter.record(&LimitKey::unit("front_desk", "t1")).unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.first_execution_at, clock.now());
        assert_eq!(limiter.cleanup(), 0);

        clock.advance(Duration::hours(24));
        assert_eq!(limiter.cleanup(), 1);
    }

    #[test]
    fn global_daily_ceiling_denies_across_hours() {
        let limiter = RateLimiter::new(
            LimiterSettings {
                global_hourly_ceiling: 5,
                global_daily_ceiling: 8,
            },
            ProactiveRules::empty(),
        );
        let clock = ManualClock::default();
        let limiter = limiter.with_clock(Arc::new(clock.clone()));

        for _ in 0..5 {
            limiter.record_execution("bulk", "t1", None);
        }
        clock.advance(Duration::hours(2));
        for _ in 0..3 {
            assert!(limiter.check_allowed("bulk", "t1", None, None).is_allowed());
            limiter.record_execution("bulk", "t1", None);
        }

        match limiter.check_allowed("bulk", "t1", None, None) {
            Admission::Denied {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, DenialReason::GlobalDailyCeiling { limit: 8 });
                assert_eq!(retry_after, Some(Duration::hours(22)));
            }
            Admission::Allowed => panic!("daily ceiling should deny"),
        }

        clock.advance(Duration::hours(21));
        assert_eq!(
            denial(limiter.check_allowed("bulk", "t1", None, None)),
            DenialReason::GlobalDailyCeiling { limit: 8 }
        );
        clock.advance(Duration::hours(1));
        assert!(limiter.check_allowed("bulk", "t1", None, None).is_allowed());
    }

    #[test]
    fn review_requester_waits_a_week() {
        let (limiter, clock) = limiter();
        limiter.record_execution("review_requester", "t1", Some("c"));

        clock.advance(Duration::hours(7));
        match limiter.check_allowed("review_requester", "t1", None, Some("c")) {
            Admission::Denied {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, DenialReason::ProactiveCooldown { hours: 168 });
                assert_eq!(retry_after, Some(Duration::hours(161)));
            }
            Admission::Allowed => panic!("weekly cooldown should deny"),
        }

        clock.advance(Duration::hours(160));
        assert_eq!(
            denial(limiter.check_allowed("review_requester", "t1", None, Some("c"))),
            DenialReason::ProactiveCooldown { hours: 168 }
        );
        clock.advance(Duration::hours(1));
        assert!(limiter
            .check_allowed("review_requester", "t1", None, Some("c"))
            .is_allowed());
    }

    #[test]
    fn stale_unit_record_is_not_evaluated() {
        let (limiter, clock) = limiter();
        let policy = RateLimitPolicy::per_hour(1).with_daily_cap(1);
        limiter.record_execution("u", "t", None);
        clock.advance(Duration::hours(24));
        assert!(limiter.check_allowed("u", "t", Some(&policy), None).is_allowed());
    }
}
