use chrono::Duration;
use indexmap::IndexMap;

/// Units that start unsolicited customer contact, with optional fixed cooldowns.
///
/// The defaults are business rules rather than policy: review requests may reach a customer
/// at most weekly and reactivation outreach at most every three days.
#[derive(Debug, Clone)]
pub struct ProactiveRules {
    window: Duration,
    units: IndexMap<String, Option<Duration>>,
}

impl Default for ProactiveRules {
    fn default() -> Self {
        let mut units = IndexMap::new();
        units.insert("review_requester".to_string(), Some(Duration::hours(168)));
        units.insert("reactivation_outreach".to_string(), Some(Duration::hours(72)));
        units.insert("appointment_reminder".to_string(), None);
        units.insert("lead_follow_up".to_string(), None);
        units.insert("no_show_recovery".to_string(), None);
        Self {
            window: Duration::hours(6),
            units,
        }
    }
}

impl ProactiveRules {
    /// Rules with no proactive units.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            window: Duration::hours(6),
            units: IndexMap::new(),
        }
    }

    /// Overrides the one-message-per-window length.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Marks a unit as proactive, optionally with its own fixed cooldown.
    #[must_use]
    pub fn with_unit(mut self, name: impl Into<String>, cooldown: Option<Duration>) -> Self {
        self.units.insert(name.into(), cooldown);
        self
    }

    /// Whether the unit is proactive.
    #[must_use]
    pub fn is_proactive(&self, unit: &str) -> bool {
        self.units.contains_key(unit)
    }

    /// Fixed cooldown of a proactive unit.
    #[must_use]
    pub fn fixed_cooldown(&self, unit: &str) -> Option<Duration> {
        self.units.get(unit).copied().flatten()
    }

    /// Length of the one-message-per-customer window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// How long customer records must be kept: the longest rule, at least seven days.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.units
            .values()
            .flatten()
            .copied()
            .chain([self.window, Duration::days(7)])
            .max()
            .unwrap_or_else(|| Duration::days(7))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_fixed_cooldowns() {
        let rules = ProactiveRules::default();
        assert_eq!(rules.fixed_cooldown("review_requester"), Some(Duration::hours(168)));
        assert_eq!(rules.fixed_cooldown("reactivation_outreach"), Some(Duration::hours(72)));
        assert!(rules.is_proactive("appointment_reminder"));
        assert_eq!(rules.fixed_cooldown("appointment_reminder"), None);
        assert!(!rules.is_proactive("front_desk"));
        assert_eq!(rules.retention(), Duration::days(7));
    }

    #[test]
    fn retention_grows_with_longer_cooldowns() {
        let rules = ProactiveRules::empty().with_unit("annual_checkup", Some(Duration::days(30)));
        assert_eq!(rules.retention(), Duration::days(30));
    }
}
