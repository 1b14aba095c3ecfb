use std::{
    collections::HashSet,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field map of a business record.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Business record families the executor touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Customer profile.
    Customer,
    /// Appointment.
    Booking,
    /// Sales lead.
    Lead,
    /// Tenant settings.
    Settings,
    /// Scheduled follow-up task.
    FollowUp,
}

impl RecordKind {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Booking => "booking",
            Self::Lead => "lead",
            Self::Settings => "settings",
            Self::FollowUp => "follow_up",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record with that id.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Record family.
        kind: RecordKind,
        /// Requested id.
        id: String,
    },
    /// The write was refused.
    #[error("invalid write: {0}")]
    Invalid(String),
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Why a message is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageIntent {
    /// Ordinary reply or outreach.
    Reply,
    /// Clarifying question.
    Clarification,
}

/// Outbound message appended to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Owning tenant.
    pub tenant_id: String,
    /// Message text.
    pub text: String,
    /// Why it is sent.
    pub intent: MessageIntent,
    /// When it was queued.
    pub sent_at: DateTime<Utc>,
}

/// Who a notification is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Business owner heads-up.
    Owner,
    /// Human takeover request.
    Escalation,
}

/// Notification to staff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Audience.
    pub kind: NotificationKind,
    /// Owning tenant.
    pub tenant_id: String,
    /// Body text.
    pub message: String,
    /// Related customer.
    pub customer_id: Option<String>,
    /// Related conversation.
    pub conversation_id: Option<String>,
}

/// Persistence the action executor writes through.
#[async_trait]
pub trait ActionTargetStore: Send + Sync {
    /// Creates a record and returns its id.
    async fn create(&self, kind: RecordKind, fields: Fields) -> Result<String, StoreError>;

    /// Merges `patch` into an existing record.
    async fn update(&self, kind: RecordKind, id: &str, patch: Fields) -> Result<(), StoreError>;

    /// Looks up a record.
    async fn find_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<Fields>, StoreError>;

    /// Appends an outbound message to a conversation.
    async fn append_message(&self, conversation_id: &str, message: OutboundMessage) -> Result<(), StoreError>;

    /// Sends a staff notification.
    async fn notify(&self, notification: Notification) -> Result<(), StoreError>;
}

/// In-memory store with failure and latency injection.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    records: Mutex<IndexMap<(RecordKind, String), Fields>>,
    messages: Mutex<Vec<(String, OutboundMessage)>>,
    notifications: Mutex<Vec<Notification>>,
    failing: Mutex<HashSet<RecordKind>>,
    delay: Option<Duration>,
    next_id: AtomicU64,
}

impl MemoryTargetStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record.
    #[must_use]
    pub fn with_record(self, kind: RecordKind, id: impl Into<String>, fields: Fields) -> Self {
        self.records.lock().insert((kind, id.into()), fields);
        self
    }

    /// Delays every operation.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every write to `kind` fail as unavailable.
    pub fn fail_on(&self, kind: RecordKind) {
        self.failing.lock().insert(kind);
    }

    /// Copy of one record.
    #[must_use]
    pub fn get(&self, kind: RecordKind, id: &str) -> Option<Fields> {
        self.records.lock().get(&(kind, id.to_string())).cloned()
    }

    /// All records of one family, in insertion order.
    #[must_use]
    pub fn records(&self, kind: RecordKind) -> Vec<(String, Fields)> {
        self.records
            .lock()
            .iter()
            .filter(|((record_kind, _), _)| *record_kind == kind)
            .map(|((_, id), fields)| (id.clone(), fields.clone()))
            .collect()
    }

    /// Appended messages with their conversation ids.
    #[must_use]
    pub fn messages(&self) -> Vec<(String, OutboundMessage)> {
        self.messages.lock().clone()
    }

    /// Sent notifications.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn guard(&self, kind: RecordKind) -> Result<(), StoreError> {
        if self.failing.lock().contains(&kind) {
            return Err(StoreError::Unavailable(format!("{kind} writes are failing")));
        }
        Ok(())
    }
}

#[async_trait]
impl ActionTargetStore for MemoryTargetStore {
    async fn create(&self, kind: RecordKind, fields: Fields) -> Result<String, StoreError> {
        self.pause().await;
        self.guard(kind)?;
        let id = format!("{kind}-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.records.lock().insert((kind, id.clone()), fields);
        Ok(id)
    }

    async fn update(&self, kind: RecordKind, id: &str, patch: Fields) -> Result<(), StoreError> {
        self.pause().await;
        self.guard(kind)?;
        let mut records = self.records.lock();
        let record = records
            .get_mut(&(kind, id.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        record.extend(patch);
        Ok(())
    }

    async fn find_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<Fields>, StoreError> {
        self.pause().await;
        Ok(self.get(kind, id))
    }

    async fn append_message(&self, conversation_id: &str, message: OutboundMessage) -> Result<(), StoreError> {
        self.pause().await;
        if message.text.trim().is_empty() {
            return Err(StoreError::Invalid("empty message".into()));
        }
        self.messages.lock().push((conversation_id.to_string(), message));
        Ok(())
    }

    async fn notify(&self, notification: Notification) -> Result<(), StoreError> {
        self.pause().await;
        self.notifications.lock().push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn create_update_find() {
        let store = MemoryTargetStore::new();
        let id = store
            .create(RecordKind::Booking, fields(json!({"slot": "fri 10:00"})))
            .await
            .unwrap();
        assert_eq!(id, "booking-1");
        store
            .update(RecordKind::Booking, &id, fields(json!({"status": "cancelled"})))
            .await
            .unwrap();
        let record = store.find_by_id(RecordKind::Booking, &id).await.unwrap().unwrap();
        assert_eq!(record["slot"], "fri 10:00");
        assert_eq!(record["status"], "cancelled");
        assert!(store.find_by_id(RecordKind::Lead, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_missing_record_fails() {
        let store = MemoryTargetStore::new();
        assert_eq!(
            store.update(RecordKind::Customer, "c-1", Fields::new()).await,
            Err(StoreError::NotFound {
                kind: RecordKind::Customer,
                id: "c-1".into()
            })
        );
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemoryTargetStore::new();
        store.fail_on(RecordKind::Lead);
        assert!(matches!(
            store.create(RecordKind::Lead, Fields::new()).await,
            Err(StoreError::Unavailable(_))
        ));
        let empty = OutboundMessage {
            tenant_id: "t".into(),
            text: " ".into(),
            intent: MessageIntent::Reply,
            sent_at: Utc::now(),
        };
        assert!(matches!(
            store.append_message("conv", empty).await,
            Err(StoreError::Invalid(_))
        ));
    }
}
