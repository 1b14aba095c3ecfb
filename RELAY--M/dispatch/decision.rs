use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::completion::TokenUsage;

/// Closed set of side effects a decision may request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    /// Append an outbound message to the conversation.
    SendMessage,
    /// Ask the customer a clarifying question.
    AskClarification,
    /// Create a booking record.
    CreateBooking,
    /// Patch a booking record.
    UpdateBooking,
    /// Mark a booking as cancelled.
    CancelBooking,
    /// Create a lead record.
    CreateLead,
    /// Patch a lead record.
    UpdateLead,
    /// Patch the customer record.
    UpdateCustomer,
    /// Patch tenant settings.
    UpdateSettings,
    /// Notify the business owner.
    NotifyOwner,
    /// Hand the conversation to a human.
    EscalateToHuman,
    /// Create a follow-up task.
    ScheduleFollowUp,
    /// Explicitly do nothing.
    NoOp,
    /// A tag this build does not know. Always fails at execution time.
    Unknown(String),
}

impl ActionKind {
    /// Wire label.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::SendMessage => "send_message",
            Self::AskClarification => "ask_clarification",
            Self::CreateBooking => "create_booking",
            Self::UpdateBooking => "update_booking",
            Self::CancelBooking => "cancel_booking",
            Self::CreateLead => "create_lead",
            Self::UpdateLead => "update_lead",
            Self::UpdateCustomer => "update_customer",
            Self::UpdateSettings => "update_settings",
            Self::NotifyOwner => "notify_owner",
            Self::EscalateToHuman => "escalate_to_human",
            Self::ScheduleFollowUp => "schedule_follow_up",
            Self::NoOp => "no_op",
            Self::Unknown(tag) => tag,
        }
    }

    /// Whether the action reaches out to the customer.
    #[must_use]
    pub const fn is_outreach(&self) -> bool {
        matches!(
            self,
            Self::SendMessage | Self::AskClarification | Self::ScheduleFollowUp
        )
    }
}

impl From<String> for ActionKind {
    fn from(raw: String) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "send_message" | "reply" => Self::SendMessage,
            "ask_clarification" | "request_clarification" => Self::AskClarification,
            "create_booking" => Self::CreateBooking,
            "update_booking" | "reschedule_booking" => Self::UpdateBooking,
            "cancel_booking" => Self::CancelBooking,
            "create_lead" => Self::CreateLead,
            "update_lead" => Self::UpdateLead,
            "update_customer" => Self::UpdateCustomer,
            "update_settings" => Self::UpdateSettings,
            "notify_owner" => Self::NotifyOwner,
            "escalate_to_human" | "escalate" => Self::EscalateToHuman,
            "schedule_follow_up" => Self::ScheduleFollowUp,
            "no_op" | "noop" | "none" => Self::NoOp,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.label().to_string()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One effectful instruction of a decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    /// Action type.
    #[serde(rename = "type")]
    pub kind: ActionKind,
    /// Open key/value payload.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Action {
    /// Creates an action. Non-object payloads are wrapped under `"value"`.
    #[must_use]
    pub fn new(kind: ActionKind, payload: serde_json::Value) -> Self {
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        Self { kind, payload }
    }

    /// String field of the payload.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(serde_json::Value::as_str)
    }

    /// Customer-facing text carried by the action, if any.
    #[must_use]
    pub fn message_text(&self) -> Option<&str> {
        ["message", "text", "question", "body"]
            .iter()
            .find_map(|key| self.text(key))
    }
}

/// Structural problems with a decision output.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OutputError {
    /// No actions.
    #[error("decision output has no actions")]
    NoActions,
    /// Confidence outside `[0, 1]` or not finite.
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    /// An action had an empty type tag.
    #[error("action #{0} has an empty type")]
    EmptyActionType(usize),
}

/// Structured result of one successful unit invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionOutput {
    /// Actions in execution order.
    pub actions: Vec<Action>,
    /// Human-readable explanation.
    #[serde(default)]
    pub summary: String,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,
    /// Whether a human or later run should follow up.
    #[serde(default)]
    pub follow_up_needed: bool,
}

impl DecisionOutput {
    /// Output consisting of a single clarification question.
    #[must_use]
    pub fn clarification(question: impl Into<String>, confidence: f64, summary: impl Into<String>) -> Self {
        Self {
            actions: vec![Action::new(
                ActionKind::AskClarification,
                serde_json::json!({ "question": question.into() }),
            )],
            summary: summary.into(),
            confidence: confidence.clamp(0.0, 1.0),
            follow_up_needed: true,
        }
    }

    /// Checks the structural invariants.
    pub fn validate(&self) -> Result<(), OutputError> {
        if self.actions.is_empty() {
            return Err(OutputError::NoActions);
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(OutputError::ConfidenceOutOfRange(self.confidence));
        }
        if let Some(idx) = self
            .actions
            .iter()
            .position(|action| action.kind.label().trim().is_empty())
        {
            return Err(OutputError::EmptyActionType(idx));
        }
        Ok(())
    }

    /// True when the only action is a clarification request.
    #[must_use]
    pub fn is_clarification_only(&self) -> bool {
        matches!(self.actions.as_slice(), [action] if action.kind == ActionKind::AskClarification)
    }

    /// Whether any action reaches out to the customer.
    #[must_use]
    pub fn has_outreach(&self) -> bool {
        self.actions.iter().any(|action| action.kind.is_outreach())
    }

    /// Customer-facing text of all outreach actions, in order.
    #[must_use]
    pub fn outreach_texts(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter(|action| action.kind.is_outreach())
            .filter_map(Action::message_text)
            .collect()
    }
}

/// Outcome of invoking one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Unit that ran.
    pub unit_name: String,
    /// Whether a valid, screened decision was produced.
    pub success: bool,
    /// The decision, on success.
    pub output: Option<DecisionOutput>,
    /// Failure description, on failure.
    pub error: Option<String>,
    /// Wall time spent.
    pub elapsed_ms: u64,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
    /// Model that served the request.
    #[serde(default)]
    pub model: Option<String>,
    /// Token accounting reported by the completion service.
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
}

impl ExecutionResult {
    /// Successful result.
    #[must_use]
    pub fn succeeded(unit_name: impl Into<String>, output: DecisionOutput, elapsed_ms: u64) -> Self {
        Self {
            unit_name: unit_name.into(),
            success: true,
            output: Some(output),
            error: None,
            elapsed_ms,
            timestamp: Utc::now(),
            model: None,
            token_usage: None,
        }
    }

    /// Failed result.
    #[must_use]
    pub fn failed(unit_name: impl Into<String>, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            unit_name: unit_name.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            elapsed_ms,
            timestamp: Utc::now(),
            model: None,
            token_usage: None,
        }
    }

    /// Records the model and token usage.
    #[must_use]
    pub fn with_usage(mut self, model: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        self.model = Some(model.into());
        self.token_usage = usage;
        self
    }
}
