use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Business events a decision unit can be bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Trigger {
    /// Inbound customer message.
    MessageReceived,
    /// Customer asked for an appointment.
    BookingRequested,
    /// An existing booking was cancelled.
    BookingCancelled,
    /// A booking was completed.
    BookingCompleted,
    /// A booking passed without the customer showing up.
    BookingNoShow,
    /// A new lead entered the funnel.
    LeadCreated,
    /// A call was missed.
    MissedCall,
    /// Time to ask for a review.
    ReviewWindow,
    /// Customer has been inactive for a while.
    CustomerInactive,
    /// Scheduler tick.
    ScheduledTick,
    /// Trigger supplied by configuration.
    Custom(String),
}

impl Trigger {
    /// Snake-case label used in configuration and logs.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::MessageReceived => "message_received",
            Self::BookingRequested => "booking_requested",
            Self::BookingCancelled => "booking_cancelled",
            Self::BookingCompleted => "booking_completed",
            Self::BookingNoShow => "booking_no_show",
            Self::LeadCreated => "lead_created",
            Self::MissedCall => "missed_call",
            Self::ReviewWindow => "review_window",
            Self::CustomerInactive => "customer_inactive",
            Self::ScheduledTick => "scheduled_tick",
            Self::Custom(label) => label,
        }
    }
}

impl From<String> for Trigger {
    fn from(raw: String) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "message_received" => Self::MessageReceived,
            "booking_requested" => Self::BookingRequested,
            "booking_cancelled" => Self::BookingCancelled,
            "booking_completed" => Self::BookingCompleted,
            "booking_no_show" => Self::BookingNoShow,
            "lead_created" => Self::LeadCreated,
            "missed_call" => Self::MissedCall,
            "review_window" => Self::ReviewWindow,
            "customer_inactive" => Self::CustomerInactive,
            "scheduled_tick" => Self::ScheduledTick,
            _ => Self::Custom(normalized),
        }
    }
}

impl From<&str> for Trigger {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<Trigger> for String {
    fn from(trigger: Trigger) -> Self {
        trigger.label().to_string()
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ranking category of a unit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitTier {
    /// Business-critical responders.
    Critical,
    /// Main line responders.
    Primary,
    /// Supporting responders.
    #[default]
    Secondary,
    /// Housekeeping and low-stakes automations.
    Background,
}

/// Per-unit rate limit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Minimum minutes between two executions for the same tenant.
    #[serde(default)]
    pub cooldown_minutes: Option<u32>,
    /// Executions allowed per hour for the same tenant.
    #[serde(default)]
    pub max_per_hour: Option<u32>,
    /// Executions allowed per day for the same tenant.
    #[serde(default)]
    pub max_per_day: Option<u32>,
}

impl RateLimitPolicy {
    /// Policy with only a cooldown.
    #[must_use]
    pub fn cooldown(minutes: u32) -> Self {
        Self {
            cooldown_minutes: Some(minutes),
            ..Self::default()
        }
    }

    /// Policy with only an hourly cap.
    #[must_use]
    pub fn per_hour(max: u32) -> Self {
        Self {
            max_per_hour: Some(max),
            ..Self::default()
        }
    }

    /// Adds a daily cap.
    #[must_use]
    pub fn with_daily_cap(mut self, max: u32) -> Self {
        self.max_per_day = Some(max);
        self
    }
}

/// Completion model settings of a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Model selector passed to the completion service.
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion token ceiling.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Ask the service for JSON-constrained output.
    #[serde(default = "default_structured")]
    pub structured_output: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            structured_output: default_structured(),
        }
    }
}

fn default_model() -> String {
    "standard".into()
}

const fn default_temperature() -> f32 {
    0.3
}

const fn default_max_tokens() -> u32 {
    1024
}

const fn default_structured() -> bool {
    true
}

const fn default_enabled() -> bool {
    true
}

const fn default_threshold() -> f64 {
    0.6
}

/// Immutable configuration of one automated responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionUnit {
    /// Unique name; also the prompt template key.
    pub name: String,
    /// Ranking category.
    #[serde(default)]
    pub tier: UnitTier,
    /// Events the unit responds to.
    pub triggers: IndexSet<Trigger>,
    /// Higher values are tried first.
    #[serde(default)]
    pub priority: i32,
    /// Disabled units are never candidates.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Outputs below this confidence are rejected unless they only ask for clarification.
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    /// Optional admission policy.
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    /// Completion settings.
    #[serde(default)]
    pub model: ModelConfig,
}

impl DecisionUnit {
    /// Starts a builder for an enabled unit with default settings.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DecisionUnitBuilder {
        DecisionUnitBuilder {
            unit: Self {
                name: name.into(),
                tier: UnitTier::default(),
                triggers: IndexSet::new(),
                priority: 0,
                enabled: true,
                confidence_threshold: default_threshold(),
                rate_limit: None,
                model: ModelConfig::default(),
            },
        }
    }

    /// Whether the unit responds to `trigger`.
    #[must_use]
    pub fn handles(&self, trigger: &Trigger) -> bool {
        self.triggers.contains(trigger)
    }
}

/// Fluent constructor for [`DecisionUnit`].
#[derive(Debug)]
pub struct DecisionUnitBuilder {
    unit: DecisionUnit,
}

impl DecisionUnitBuilder {
    /// Sets the tier.
    #[must_use]
    pub fn tier(mut self, tier: UnitTier) -> Self {
        self.unit.tier = tier;
        self
    }

    /// Adds a trigger.
    #[must_use]
    pub fn trigger(mut self, trigger: impl Into<Trigger>) -> Self {
        self.unit.triggers.insert(trigger.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.unit.priority = priority;
        self
    }

    /// Enables or disables the unit.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.unit.enabled = enabled;
        self
    }

    /// Sets the confidence threshold, clamped into `[0, 1]`.
    #[must_use]
    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.unit.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Attaches a rate limit policy.
    #[must_use]
    pub fn rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.unit.rate_limit = Some(policy);
        self
    }

    /// Replaces the model settings.
    #[must_use]
    pub fn model(mut self, model: ModelConfig) -> Self {
        self.unit.model = model;
        self
    }

    /// Finalizes the unit.
    #[must_use]
    pub fn build(self) -> DecisionUnit {
        self.unit
    }
}
