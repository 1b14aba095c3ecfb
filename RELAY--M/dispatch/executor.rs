use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    context::DispatchContext,
    decision::{Action, ActionKind},
    store::{
        ActionTargetStore, Fields, MessageIntent, Notification, NotificationKind, OutboundMessage,
        RecordKind, StoreError,
    },
};

/// Outcome of one attempted action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Position in the decision's action list.
    pub index: usize,
    /// Action type.
    pub kind: ActionKind,
    /// Whether the side effect was applied.
    pub success: bool,
    /// Id of the created or touched record.
    #[serde(default)]
    pub record_id: Option<String>,
    /// Failure description.
    #[serde(default)]
    pub error: Option<String>,
    /// Wall time spent.
    pub elapsed_ms: u64,
}

/// Number of leading successful results.
#[must_use]
pub fn succeeded(results: &[ActionResult]) -> usize {
    results.iter().take_while(|result| result.success).count()
}

type Applied = Result<Option<String>, String>;

/// Applies decision actions in order through an [`ActionTargetStore`], stopping at the first failure.
pub struct ActionExecutor {
    store: Arc<dyn ActionTargetStore>,
    action_timeout: Duration,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("action_timeout", &self.action_timeout)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    /// Executor with a 10 second per-action timeout.
    #[must_use]
    pub fn new(store: Arc<dyn ActionTargetStore>) -> Self {
        Self {
            store,
            action_timeout: Duration::from_secs(10),
        }
    }

    /// Overrides the per-action timeout.
    #[must_use]
    pub const fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Runs actions in order. Only attempted actions are reported, so a failure is always last.
    pub async fn execute_all(&self, actions: &[Action], context: &DispatchContext) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            let started = Instant::now();
            let outcome = self.execute_one(action, context).await;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let result = match outcome {
                Ok(record_id) => ActionResult {
                    index,
                    kind: action.kind.clone(),
                    success: true,
                    record_id,
                    error: None,
                    elapsed_ms,
                },
                Err(error) => ActionResult {
                    index,
                    kind: action.kind.clone(),
                    success: false,
                    record_id: None,
                    error: Some(error),
                    elapsed_ms,
                },
            };
            let failed = !result.success;
            results.push(result);
            if failed {
                warn!(
                    dispatch_id = %context.dispatch_id,
                    action = %action.kind,
                    index,
                    "action failed; skipping the rest"
                );
                break;
            }
        }
        debug!(dispatch_id = %context.dispatch_id, applied = succeeded(&results), "actions executed");
        results
    }

    async fn execute_one(&self, action: &Action, context: &DispatchContext) -> Applied {
        let store = self.store.as_ref();
        match &action.kind {
            ActionKind::SendMessage => self.send(action, context, MessageIntent::Reply).await,
            ActionKind::AskClarification => self.send(action, context, MessageIntent::Clarification).await,
            ActionKind::CreateBooking => {
                let customer = required(action, context, &["customer_id"], |ctx| ctx.customer_id.as_deref())
                    .ok_or("create_booking requires a customer id")?;
                let mut fields = scoped_fields(action, context);
                fields.insert("customer_id".into(), Value::String(customer));
                fields.entry("status").or_insert_with(|| Value::String("confirmed".into()));
                self.guarded(store.create(RecordKind::Booking, fields)).await.map(Some)
            }
            ActionKind::UpdateBooking => {
                let id = entity_id(action, context, "booking_id").ok_or("update_booking requires a booking id")?;
                self.patch(RecordKind::Booking, id, without_ids(action)).await
            }
            ActionKind::CancelBooking => {
                let id = entity_id(action, context, "booking_id").ok_or("cancel_booking requires a booking id")?;
                let mut patch = Fields::new();
                patch.insert("status".into(), Value::String("cancelled".into()));
                if let Some(reason) = action.text("reason") {
                    patch.insert("cancel_reason".into(), Value::String(reason.into()));
                }
                self.patch(RecordKind::Booking, id, patch).await
            }
            ActionKind::CreateLead => {
                let fields = scoped_fields(action, context);
                self.guarded(store.create(RecordKind::Lead, fields)).await.map(Some)
            }
            ActionKind::UpdateLead => {
                let id = entity_id(action, context, "lead_id").ok_or("update_lead requires a lead id")?;
                self.patch(RecordKind::Lead, id, without_ids(action)).await
            }
            ActionKind::UpdateCustomer => {
                let id = required(action, context, &["customer_id", "id"], |ctx| ctx.customer_id.as_deref())
                    .ok_or("update_customer requires a customer id")?;
                self.patch(RecordKind::Customer, id, without_ids(action)).await
            }
            ActionKind::UpdateSettings => {
                self.patch(RecordKind::Settings, context.tenant_id.clone(), without_ids(action))
                    .await
            }
            ActionKind::ScheduleFollowUp => {
                let mut fields = scoped_fields(action, context);
                if let Some(customer) = &context.customer_id {
                    fields.entry("customer_id").or_insert_with(|| Value::String(customer.clone()));
                }
                if let Some(conversation) = &context.conversation_id {
                    fields
                        .entry("conversation_id")
                        .or_insert_with(|| Value::String(conversation.clone()));
                }
                self.guarded(store.create(RecordKind::FollowUp, fields)).await.map(Some)
            }
            ActionKind::NotifyOwner => self.notify(action, context, NotificationKind::Owner).await,
            ActionKind::EscalateToHuman => self.notify(action, context, NotificationKind::Escalation).await,
            ActionKind::NoOp => Ok(None),
            ActionKind::Unknown(tag) => Err(format!("unsupported action type '{tag}'")),
        }
    }

    async fn send(&self, action: &Action, context: &DispatchContext, intent: MessageIntent) -> Applied {
        let conversation = required(action, context, &["conversation_id"], |ctx| ctx.conversation_id.as_deref())
            .ok_or_else(|| format!("{} requires a conversation id", action.kind))?;
        let text = action
            .message_text()
            .ok_or_else(|| format!("{} requires message text", action.kind))?;
        let message = OutboundMessage {
            tenant_id: context.tenant_id.clone(),
            text: text.to_string(),
            intent,
            sent_at: Utc::now(),
        };
        self.guarded(self.store.append_message(&conversation, message)).await?;
        Ok(Some(conversation))
    }

    async fn notify(&self, action: &Action, context: &DispatchContext, kind: NotificationKind) -> Applied {
        let message = ["message", "reason", "summary"]
            .iter()
            .find_map(|key| action.text(key))
            .unwrap_or("attention needed")
            .to_string();
        let notification = Notification {
            kind,
            tenant_id: context.tenant_id.clone(),
            message,
            customer_id: context.customer_id.clone(),
            conversation_id: context.conversation_id.clone(),
        };
        self.guarded(self.store.notify(notification)).await.map(|()| None)
    }

    async fn patch(&self, kind: RecordKind, id: String, patch: Fields) -> Applied {
        self.guarded(self.store.update(kind, &id, patch)).await?;
        Ok(Some(id))
    }

    async fn guarded<T>(&self, effect: impl Future<Output = Result<T, StoreError>> + Send) -> Result<T, String> {
        match tokio::time::timeout(self.action_timeout, effect).await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err(format!("action timed out after {}ms", self.action_timeout.as_millis())),
        }
    }
}

/// First payload string among `keys`, else the context fallback.
fn required(
    action: &Action,
    context: &DispatchContext,
    keys: &[&str],
    fallback: impl Fn(&DispatchContext) -> Option<&str>,
) -> Option<String> {
    keys.iter()
        .find_map(|key| action.text(key))
        .or_else(|| fallback(context))
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
}

/// Record id from `key`, `id`, or the context's entity.
fn entity_id(action: &Action, context: &DispatchContext, key: &str) -> Option<String> {
    required(action, context, &[key, "id"], |ctx| ctx.entity_id.as_deref())
}

fn without_ids(action: &Action) -> Fields {
    action
        .payload
        .iter()
        .filter(|(key, _)| !(key.as_str() == "id" || key.ends_with("_id")))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn scoped_fields(action: &Action, context: &DispatchContext) -> Fields {
    let mut fields = action.payload.clone();
    fields.insert("tenant_id".into(), Value::String(context.tenant_id.clone()));
    fields
}
