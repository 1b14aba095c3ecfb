use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::unit::Trigger;

/// Untrusted input attached to the triggering event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputPayload {
    /// Message text, if the event carried one.
    #[serde(default)]
    pub message: String,
    /// Free-form event metadata.
    #[serde(default)]
    pub metadata: IndexMap<String, serde_json::Value>,
}

/// Who authored a conversation turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// The customer. Treated as untrusted input.
    Customer,
    /// An automated response.
    Assistant,
    /// A staff member.
    Staff,
}

impl TurnRole {
    /// Lowercase role name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Assistant => "assistant",
            Self::Staff => "staff",
        }
    }
}

/// One prior turn of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryTurn {
    /// Author.
    pub role: TurnRole,
    /// Text.
    pub content: String,
}

/// Everything one pipeline run knows about the external event. Read-only once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchContext {
    /// Correlation id for logs.
    #[serde(default = "Uuid::new_v4")]
    pub dispatch_id: Uuid,
    /// Event type.
    pub trigger: Trigger,
    /// Owning tenant.
    pub tenant_id: String,
    /// Customer the event concerns.
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Conversation the event belongs to.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Business entity (booking, lead, ...) the event refers to.
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Untrusted input.
    #[serde(default)]
    pub input: InputPayload,
    /// Prior conversation turns, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    /// Snapshot of tenant settings.
    #[serde(default)]
    pub tenant_config: Option<serde_json::Value>,
    /// When the event was received.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl DispatchContext {
    /// Starts a builder for the given trigger and tenant.
    #[must_use]
    pub fn builder(trigger: impl Into<Trigger>, tenant_id: impl Into<String>) -> DispatchContextBuilder {
        DispatchContextBuilder {
            context: Self {
                dispatch_id: Uuid::new_v4(),
                trigger: trigger.into(),
                tenant_id: tenant_id.into(),
                customer_id: None,
                conversation_id: None,
                entity_id: None,
                input: InputPayload::default(),
                history: Vec::new(),
                tenant_config: None,
                received_at: Utc::now(),
            },
        }
    }

    /// Looks up an input metadata value.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.input.metadata.get(key)
    }

    /// Text the safety gate treats as untrusted: the message, customer-authored history, and
    /// every string inside the input metadata and tenant config, since templates can render both.
    #[must_use]
    pub fn untrusted_segments(&self) -> Vec<&str> {
        let mut segments = vec![self.input.message.as_str()];
        segments.extend(
            self.history
                .iter()
                .filter(|turn| turn.role == TurnRole::Customer)
                .map(|turn| turn.content.as_str()),
        );
        for value in self.input.metadata.values() {
            collect_strings(value, &mut segments);
        }
        if let Some(config) = &self.tenant_config {
            collect_strings(config, &mut segments);
        }
        segments
    }
}

fn collect_strings<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(text) => out.push(text),
        serde_json::Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        serde_json::Value::Object(fields) => fields.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

/// Fluent constructor for [`DispatchContext`].
#[derive(Debug)]
pub struct DispatchContextBuilder {
    context: DispatchContext,
}

impl DispatchContextBuilder {
    /// Sets the customer.
    #[must_use]
    pub fn customer(mut self, customer_id: impl Into<String>) -> Self {
        self.context.customer_id = Some(customer_id.into());
        self
    }

    /// Sets the conversation.
    #[must_use]
    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.context.conversation_id = Some(conversation_id.into());
        self
    }

    /// Sets the referenced business entity.
    #[must_use]
    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.context.entity_id = Some(entity_id.into());
        self
    }

    /// Sets the message text.
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.context.input.message = message.into();
        self
    }

    /// Adds an input metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.input.metadata.insert(key.into(), value);
        self
    }

    /// Appends a history turn.
    #[must_use]
    pub fn turn(mut self, role: TurnRole, content: impl Into<String>) -> Self {
        self.context.history.push(HistoryTurn {
            role,
            content: content.into(),
        });
        self
    }

    /// Attaches the tenant settings snapshot.
    #[must_use]
    pub fn tenant_config(mut self, config: serde_json::Value) -> Self {
        self.context.tenant_config = Some(config);
        self
    }

    /// Finalizes the context.
    #[must_use]
    pub fn build(self) -> DispatchContext {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn untrusted_segments_skip_assistant_turns() {
        let context = DispatchContext::builder(Trigger::MessageReceived, "t1")
            .message("can I book friday?")
            .turn(TurnRole::Customer, "hi")
            .turn(TurnRole::Assistant, "hello! how can I help?")
            .build();
        assert_eq!(context.untrusted_segments(), vec!["can I book friday?", "hi"]);
    }

    #[test]
    fn untrusted_segments_walk_metadata_and_tenant_config() {
        let context = DispatchContext::builder(Trigger::MessageReceived, "t1")
            .message("hello")
            .metadata("note", json!("left at the desk"))
            .metadata("extra", json!({"tags": ["vip", 3], "opted_out": false}))
            .tenant_config(json!({"greeting": "Welcome!"}))
            .build();
        assert_eq!(
            context.untrusted_segments(),
            vec!["hello", "left at the desk", "vip", "Welcome!"]
        );
    }

    #[test]
    fn deserializes_minimal_context() {
        let context: DispatchContext = serde_json::from_value(json!({
            "trigger": "missed_call",
            "tenant_id": "salon-1",
            "customer_id": "c-9"
        }))
        .unwrap();
        assert_eq!(context.trigger, Trigger::MissedCall);
        assert!(context.input.message.is_empty());
        assert_eq!(context.customer_id.as_deref(), Some("c-9"));
    }
}
