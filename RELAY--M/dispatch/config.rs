use std::{collections::HashSet, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::{
    engine::EngineTimeouts,
    error::RelayError,
    limiter::{LimiterSettings, ProactiveRules},
    prompt::{PromptTemplate, TemplateRenderer},
    registry::UnitRegistry,
    safety::SafetySettings,
    unit::DecisionUnit,
};

/// Relay configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    /// Admission control.
    #[serde(default)]
    pub limiter: LimiterSection,
    /// Screening.
    #[serde(default)]
    pub safety: SafetySection,
    /// Suspension-point timeouts.
    #[serde(default)]
    pub engine: EngineSection,
    /// Background sweeping.
    #[serde(default)]
    pub maintenance: MaintenanceSection,
    /// Prompt templates keyed by unit name.
    #[serde(default)]
    pub templates: IndexMap<String, PromptTemplate>,
    /// Decision units in registration order.
    #[serde(default)]
    pub units: Vec<DecisionUnit>,
}

/// `[limiter]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct LimiterSection {
    /// Executions per hour per (unit, tenant).
    #[serde(default = "default_hourly_ceiling")]
    pub global_hourly_ceiling: u32,
    /// Executions per day per (unit, tenant).
    #[serde(default = "default_daily_ceiling")]
    pub global_daily_ceiling: u32,
    /// One proactive message per customer per this many hours.
    #[serde(default = "default_proactive_window")]
    pub proactive_window_hours: u32,
    /// Proactive units. When absent the built-in table applies.
    #[serde(default)]
    pub proactive: Option<Vec<ProactiveEntry>>,
}

impl Default for LimiterSection {
    fn default() -> Self {
        Self {
            global_hourly_ceiling: default_hourly_ceiling(),
            global_daily_ceiling: default_daily_ceiling(),
            proactive_window_hours: default_proactive_window(),
            proactive: None,
        }
    }
}

/// `[[limiter.proactive]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ProactiveEntry {
    /// Unit name.
    pub name: String,
    /// Fixed per-customer cooldown.
    #[serde(default)]
    pub cooldown_hours: Option<u32>,
}

/// `[safety]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct SafetySection {
    /// Prompt size limit.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    /// Raw output size limit.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    /// Dedup memory.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_minutes: u32,
    /// Dedup capacity.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            max_prompt_chars: default_max_prompt_chars(),
            max_output_chars: default_max_output_chars(),
            dedup_window_minutes: default_dedup_window(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

/// `[engine]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Completion call limit.
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_ms: u64,
    /// Per-action limit.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            completion_timeout_ms: default_completion_timeout(),
            action_timeout_ms: default_action_timeout(),
        }
    }
}

/// `[maintenance]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceSection {
    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

const fn default_hourly_ceiling() -> u32 {
    100
}

const fn default_daily_ceiling() -> u32 {
    500
}

const fn default_proactive_window() -> u32 {
    6
}

const fn default_max_prompt_chars() -> usize {
    24_000
}

const fn default_max_output_chars() -> usize {
    16_000
}

const fn default_dedup_window() -> u32 {
    24 * 60
}

const fn default_dedup_capacity() -> usize {
    10_000
}

const fn default_completion_timeout() -> u64 {
    30_000
}

const fn default_action_timeout() -> u64 {
    10_000
}

const fn default_sweep_interval() -> u64 {
    300
}

macro_rules! invalid {
    ($($arg:tt)*) => {
        return Err(RelayError::InvalidConfig(format!($($arg)*)))
    };
}

impl RelayConfig {
    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading relay config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("decoding relay config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), RelayError> {
        let limiter = &self.limiter;
        if limiter.global_hourly_ceiling == 0 || limiter.global_daily_ceiling == 0 {
            invalid!("global ceilings must be positive");
        }
        if limiter.global_hourly_ceiling > limiter.global_daily_ceiling {
            invalid!(
                "global_hourly_ceiling {} exceeds global_daily_ceiling {}",
                limiter.global_hourly_ceiling,
                limiter.global_daily_ceiling
            );
        }
        if limiter.proactive_window_hours == 0 {
            invalid!("proactive_window_hours must be positive");
        }
        if self.safety.dedup_capacity == 0 || self.safety.dedup_window_minutes == 0 {
            invalid!("dedup window and capacity must be positive");
        }
        if self.engine.completion_timeout_ms == 0 || self.engine.action_timeout_ms == 0 {
            invalid!("engine timeouts must be positive");
        }
        if self.maintenance.sweep_interval_secs == 0 {
            invalid!("sweep_interval_secs must be positive");
        }
        let mut seen = HashSet::new();
        for unit in &self.units {
            if unit.name.trim().is_empty() {
                invalid!("unit with empty name");
            }
            if !seen.insert(unit.name.as_str()) {
                invalid!("duplicate unit name '{}'", unit.name);
            }
            if !(0.0..=1.0).contains(&unit.confidence_threshold) {
                invalid!(
                    "unit '{}' confidence_threshold {} outside [0, 1]",
                    unit.name,
                    unit.confidence_threshold
                );
            }
            if unit.triggers.is_empty() {
                invalid!("unit '{}' has no triggers", unit.name);
            }
        }
        Ok(())
    }

    /// Global ceilings.
    #[must_use]
    pub const fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            global_hourly_ceiling: self.limiter.global_hourly_ceiling,
            global_daily_ceiling: self.limiter.global_daily_ceiling,
        }
    }

    /// Proactive unit table: the configured entries, or the built-in table.
    #[must_use]
    pub fn proactive_rules(&self) -> ProactiveRules {
        let window = chrono::Duration::hours(i64::from(self.limiter.proactive_window_hours));
        match &self.limiter.proactive {
            None => ProactiveRules::default().with_window(window),
            Some(entries) => entries.iter().fold(ProactiveRules::empty().with_window(window), |rules, entry| {
                rules.with_unit(
                    entry.name.clone(),
                    entry.cooldown_hours.map(|hours| chrono::Duration::hours(i64::from(hours))),
                )
            }),
        }
    }

    /// Safety gate settings.
    #[must_use]
    pub fn safety_settings(&self) -> SafetySettings {
        SafetySettings {
            max_prompt_chars: self.safety.max_prompt_chars,
            max_output_chars: self.safety.max_output_chars,
            dedup_window: chrono::Duration::minutes(i64::from(self.safety.dedup_window_minutes)),
            dedup_capacity: self.safety.dedup_capacity,
        }
    }

    /// Engine and executor timeouts.
    #[must_use]
    pub const fn engine_timeouts(&self) -> EngineTimeouts {
        EngineTimeouts {
            completion: Duration::from_millis(self.engine.completion_timeout_ms),
            action: Duration::from_millis(self.engine.action_timeout_ms),
        }
    }

    /// Sweep period.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance.sweep_interval_secs)
    }

    /// Registry holding the configured units.
    pub fn build_registry(&self) -> Result<UnitRegistry> {
        UnitRegistry::from_units(self.units.iter().cloned()).context("registering configured units")
    }

    /// Template renderer with the configured templates over the built-in default.
    #[must_use]
    pub fn build_renderer(&self) -> TemplateRenderer {
        self.templates
            .iter()
            .fold(TemplateRenderer::new(), |renderer, (unit, template)| {
                renderer.with_template(unit.clone(), template.clone())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Trigger, UnitTier};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[limiter]
global_hourly_ceiling = 20
global_daily_ceiling = 200

[[limiter.proactive]]
name = "review_requester"
cooldown_hours = 168

[safety]
dedup_window_minutes = 60

[engine]
completion_timeout_ms = 5000

[templates.front_desk]
system = "You are {{unit}}"
user = "{{message}}"

[[units]]
name = "front_desk"
tier = "primary"
triggers = ["message_received", "missed_call"]
priority = 80
confidence_threshold = 0.7
rate_limit = { cooldown_minutes = 5 }

[[units]]
name = "review_requester"
triggers = ["booking_completed"]
model = { model = "small", temperature = 0.1 }
"#;

    #[test]
    fn loads_sample_document() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = RelayConfig::load(file.path()).unwrap();

        assert_eq!(config.limiter_settings().global_hourly_ceiling, 20);
        assert_eq!(config.safety_settings().dedup_window, chrono::Duration::hours(1));
        assert_eq!(config.safety_settings().max_prompt_chars, 24_000);
        assert_eq!(config.engine_timeouts().completion, Duration::from_secs(5));
        assert_eq!(config.engine_timeouts().action, Duration::from_secs(10));
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));

        let rules = config.proactive_rules();
        assert!(rules.is_proactive("review_requester"));
        assert!(!rules.is_proactive("appointment_reminder"));

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.count(), 2);
        let front = registry.get("front_desk").unwrap();
        assert_eq!(front.tier, UnitTier::Primary);
        assert!(front.handles(&Trigger::MissedCall));
        assert_eq!(front.rate_limit.as_ref().unwrap().cooldown_minutes, Some(5));
        let review = registry.get("review_requester").unwrap();
        assert_eq!(review.model.model, "small");
        assert_eq!(review.model.max_tokens, 1024);
        assert!((review.confidence_threshold - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config.limiter_settings(), LimiterSettings::default());
        assert!(config.proactive_rules().is_proactive("appointment_reminder"));
        assert_eq!(config.engine_timeouts(), EngineTimeouts::default());
        assert_eq!(config.safety_settings(), SafetySettings::default());
    }

    #[test]
    fn rejects_invalid_documents() {
        let cases = [
            "[limiter]\nglobal_hourly_ceiling = 0",
            "[limiter]\nglobal_hourly_ceiling = 600",
            "[[units]]\nname = \"a\"\ntriggers = [\"missed_call\"]\nconfidence_threshold = 1.5",
            "[[units]]\nname = \"a\"\ntriggers = [\"missed_call\"]\n[[units]]\nname = \"a\"\ntriggers = [\"lead_created\"]",
            "[[units]]\nname = \"a\"\ntriggers = []",
        ];
        for raw in cases {
            assert!(RelayConfig::from_toml_str(raw).is_err(), "accepted: {raw}");
        }
    }

    #[test]
    fn validation_failures_are_typed() {
        let err = RelayConfig::from_toml_str("[engine]\naction_timeout_ms = 0").unwrap_err();
        assert_eq!(
            err.downcast_ref::<RelayError>(),
            Some(&RelayError::InvalidConfig("engine timeouts must be positive".into()))
        );

        let err = RelayConfig::from_toml_str(
            "[[units]]\nname = \"a\"\ntriggers = [\"missed_call\"]\nconfidence_threshold = 1.5",
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::InvalidConfig(msg)) if msg.contains("confidence_threshold")
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RelayConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(format!("{err:#}").contains("/definitely/not/here.toml"));
    }
}
