use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::{
    context::DispatchContext,
    error::RelayError,
    unit::{DecisionUnit, Trigger},
};

/// Catalogue of decision units, keyed by name in registration order.
#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: RwLock<IndexMap<String, Arc<DecisionUnit>>>,
}

impl UnitRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every unit in order, failing on the first duplicate name.
    pub fn from_units(units: impl IntoIterator<Item = DecisionUnit>) -> Result<Self, RelayError> {
        let registry = Self::new();
        for unit in units {
            registry.register(unit)?;
        }
        Ok(registry)
    }

    /// Adds a unit. Names are unique.
    pub fn register(&self, unit: DecisionUnit) -> Result<(), RelayError> {
        let mut units = self.units.write();
        if units.contains_key(&unit.name) {
            return Err(RelayError::DuplicateUnit(unit.name));
        }
        tracing::debug!(unit = %unit.name, priority = unit.priority, "decision unit registered");
        units.insert(unit.name.clone(), Arc::new(unit));
        Ok(())
    }

    /// Removes a unit, keeping the registration order of the rest.
    pub fn unregister(&self, name: &str) -> Option<Arc<DecisionUnit>> {
        self.units.write().shift_remove(name)
    }

    /// Looks up a unit by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<DecisionUnit>> {
        self.units.read().get(name).cloned()
    }

    /// Enabled units bound to the context's trigger, highest priority first.
    /// Equal priorities keep registration order.
    #[must_use]
    pub fn find_candidates(&self, context: &DispatchContext) -> Vec<Arc<DecisionUnit>> {
        let mut candidates: Vec<_> = self
            .units
            .read()
            .values()
            .filter(|unit| unit.enabled && unit.handles(&context.trigger))
            .cloned()
            .collect();
        // `sort_by` is stable.
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        candidates
    }

    /// Every unit bound to `trigger`, enabled or not, in registration order.
    #[must_use]
    pub fn find_by_trigger(&self, trigger: &Trigger) -> Vec<Arc<DecisionUnit>> {
        self.units
            .read()
            .values()
            .filter(|unit| unit.handles(trigger))
            .cloned()
            .collect()
    }

    /// All units in registration order.
    #[must_use]
    pub fn all_units(&self) -> Vec<Arc<DecisionUnit>> {
        self.units.read().values().cloned().collect()
    }

    /// Number of registered units.
    #[must_use]
    pub fn count(&self) -> usize {
        self.units.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str, priority: i32, trigger: Trigger) -> DecisionUnit {
        DecisionUnit::builder(name)
            .trigger(trigger)
            .priority(priority)
            .build()
    }

    fn names(units: &[Arc<DecisionUnit>]) -> Vec<&str> {
        units.iter().map(|unit| unit.name.as_str()).collect()
    }

    #[test]
    fn rejects_duplicate_names() {
        let registry = UnitRegistry::new();
        registry
            .register(unit("front_desk", 10, Trigger::MessageReceived))
            .unwrap();
        let err = registry
            .register(unit("front_desk", 99, Trigger::MissedCall))
            .unwrap_err();
        assert_eq!(err, RelayError::DuplicateUnit("front_desk".into()));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn candidates_are_enabled_matching_and_stably_sorted() {
        let registry = UnitRegistry::from_units([
            unit("a", 50, Trigger::MessageReceived),
            unit("b", 90, Trigger::MessageReceived),
            unit("c", 50, Trigger::MessageReceived),
            unit("d", 100, Trigger::MissedCall),
            DecisionUnit::builder("e")
                .trigger(Trigger::MessageReceived)
                .priority(200)
                .enabled(false)
                .build(),
            unit("f", 50, Trigger::MessageReceived),
        ])
        .unwrap();

        let context = DispatchContext::builder(Trigger::MessageReceived, "t").build();
        let candidates = registry.find_candidates(&context);
        assert_eq!(names(&candidates), vec!["b", "a", "c", "f"]);

        let all = registry.find_by_trigger(&Trigger::MessageReceived);
        assert_eq!(names(&all), vec!["a", "b", "c", "e", "f"]);
    }

    #[test]
    fn unregister_keeps_order() {
        let registry = UnitRegistry::from_units([
            unit("a", 1, Trigger::MessageReceived),
            unit("b", 1, Trigger::MessageReceived),
            unit("c", 1, Trigger::MessageReceived),
        ])
        .unwrap();
        assert!(registry.unregister("b").is_some());
        assert!(registry.unregister("b").is_none());
        assert_eq!(names(&registry.all_units()), vec!["a", "c"]);
        assert!(registry.get("c").is_some());
    }
}
