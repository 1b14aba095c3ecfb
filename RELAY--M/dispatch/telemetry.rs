use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use uuid::Uuid;

use crate::{
    context::DispatchContext,
    decision::ExecutionResult,
    dispatcher::{CandidateAttempt, DispatchOutcome},
};

/// Final status of a dispatch, as logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// A candidate committed.
    Committed,
    /// A direct dispatch was refused.
    Rejected,
    /// Every candidate was rejected.
    Exhausted,
}

/// Summary of one dispatch for the execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// Correlation id.
    pub dispatch_id: Uuid,
    /// Tenant.
    pub tenant_id: String,
    /// Trigger label.
    pub trigger: String,
    /// Final status.
    pub status: DispatchStatus,
    /// Committed or rejected unit.
    pub unit: Option<String>,
    /// Candidates rejected on the way.
    pub rejected_candidates: usize,
    /// Actions attempted by the committed unit.
    pub actions_attempted: usize,
    /// Actions applied by the committed unit.
    pub actions_executed: usize,
    /// Rejection reason, for direct dispatches.
    pub reason: Option<String>,
    /// When the dispatch finished.
    pub finished_at: DateTime<Utc>,
}

impl DispatchRecord {
    /// Summarizes an outcome.
    #[must_use]
    pub fn from_outcome(context: &DispatchContext, outcome: &DispatchOutcome, finished_at: DateTime<Utc>) -> Self {
        let mut record = Self {
            dispatch_id: context.dispatch_id,
            tenant_id: context.tenant_id.clone(),
            trigger: context.trigger.to_string(),
            status: DispatchStatus::Exhausted,
            unit: None,
            rejected_candidates: 0,
            actions_attempted: 0,
            actions_executed: 0,
            reason: None,
            finished_at,
        };
        match outcome {
            DispatchOutcome::Committed {
                unit,
                actions_executed,
                actions_attempted,
                attempts,
                ..
            } => {
                record.status = DispatchStatus::Committed;
                record.unit = Some(unit.clone());
                record.rejected_candidates = attempts.len();
                record.actions_attempted = *actions_attempted;
                record.actions_executed = *actions_executed;
            }
            DispatchOutcome::Rejected { unit, reason, .. } => {
                record.status = DispatchStatus::Rejected;
                record.unit = Some(unit.clone());
                record.rejected_candidates = 1;
                record.reason = Some(reason.clone());
            }
            DispatchOutcome::Exhausted { attempts } => {
                record.rejected_candidates = attempts.len();
            }
        }
        record
    }

    /// Dotted event name for the status.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self.status {
            DispatchStatus::Committed => "dispatch.committed",
            DispatchStatus::Rejected => "dispatch.rejected",
            DispatchStatus::Exhausted => "dispatch.exhausted",
        }
    }
}

/// Receives every execution result and dispatch outcome. Failures are logged by the caller
/// and never fail a dispatch.
#[async_trait]
pub trait ExecutionLogSink: Send + Sync {
    /// Records one unit invocation.
    async fn record_execution(&self, result: &ExecutionResult) -> Result<()>;

    /// Records the end of a dispatch.
    async fn record_outcome(&self, record: &DispatchRecord) -> Result<()>;

    /// Records a rejected candidate.
    async fn record_rejection(&self, _dispatch_id: Uuid, _attempt: &CandidateAttempt) -> Result<()> {
        Ok(())
    }
}

/// Builder for [`DispatchTelemetry`].
pub struct DispatchTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    log_sink: Option<Arc<dyn LogSink>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    min_level: LogLevel,
}

impl DispatchTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            log_sink: None,
            event_publisher: None,
            min_level: LogLevel::Info,
        }
    }

    /// Logs to a JSON-lines file.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Logs to an existing sink. Takes precedence over [`Self::log_path`].
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Minimum level for file logs.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<DispatchTelemetry> {
        let logger = match (self.log_sink, self.log_path) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => {
                Some(Arc::new(JsonLogger::new(path)?.with_min_level(self.min_level)) as Arc<dyn LogSink>)
            }
            (None, None) => None,
        };
        Ok(DispatchTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// JSON logs plus bus events for the dispatch pipeline.
#[derive(Clone)]
pub struct DispatchTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    module: String,
    logger: Option<Arc<dyn LogSink>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for DispatchTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTelemetry")
            .field("module", &self.inner.module)
            .finish_non_exhaustive()
    }
}

impl DispatchTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> DispatchTelemetryBuilder {
        DispatchTelemetryBuilder::new(module)
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(&self.inner.module, level, message);
            if let Value::Object(fields) = metadata {
                record.metadata = fields;
            }
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub async fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            publisher
                .publish(EventRecord::new(&self.inner.module, event_type, payload))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionLogSink for DispatchTelemetry {
    async fn record_execution(&self, result: &ExecutionResult) -> Result<()> {
        let (level, message) = if result.success {
            (LogLevel::Info, "dispatch.execution.succeeded")
        } else {
            (LogLevel::Warn, "dispatch.execution.failed")
        };
        self.log(
            level,
            message,
            json!({
                "unit": result.unit_name,
                "elapsed_ms": result.elapsed_ms,
                "error": result.error,
                "model": result.model,
                "total_tokens": result.token_usage.map(|usage| usage.total_tokens),
                "confidence": result.output.as_ref().map(|output| output.confidence),
            }),
        )?;
        self.event("dispatch.execution", serde_json::to_value(result)?).await
    }

    async fn record_outcome(&self, record: &DispatchRecord) -> Result<()> {
        let level = match record.status {
            DispatchStatus::Committed => LogLevel::Info,
            DispatchStatus::Rejected | DispatchStatus::Exhausted => LogLevel::Warn,
        };
        let payload = serde_json::to_value(record)?;
        self.log(level, record.event_type(), payload.clone())?;
        self.event(record.event_type(), payload).await
    }

    async fn record_rejection(&self, dispatch_id: Uuid, attempt: &CandidateAttempt) -> Result<()> {
        let payload = json!({
            "dispatch_id": dispatch_id,
            "unit": attempt.unit,
            "stage": attempt.stage,
            "reason": attempt.reason,
        });
        self.log(LogLevel::Info, "dispatch.candidate.rejected", payload.clone())?;
        self.event("dispatch.candidate.rejected", payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decision::DecisionOutput,
        dispatcher::DispatchStage,
        testkit,
    };
    use shared_event_bus::MemoryEventBus;
    use shared_logging::MemoryLogger;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_file_log_and_events() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("dispatch.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = DispatchTelemetry::builder("dispatch")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();

        let result = ExecutionResult::succeeded("front_desk", DecisionOutput::clarification("when?", 0.4, ""), 12);
        telemetry.record_execution(&result).await.unwrap();
        telemetry
            .record_rejection(
                Uuid::new_v4(),
                &CandidateAttempt::new("night_shift", DispatchStage::RateCheck, "cooldown"),
            )
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("dispatch.execution.succeeded"));
        assert!(content.contains("dispatch.candidate.rejected"));
        assert_eq!(bus.events_of_type("dispatch.execution").len(), 1);
        assert_eq!(bus.events_of_type("dispatch.candidate.rejected").len(), 1);
    }

    #[tokio::test]
    async fn outcome_records_summarize() {
        let logger = Arc::new(MemoryLogger::new(32));
        let telemetry = DispatchTelemetry::builder("dispatch")
            .log_sink(logger.clone())
            .build()
            .unwrap();
        let context = testkit::message("hi");
        let outcome = DispatchOutcome::Exhausted {
            attempts: vec![CandidateAttempt::new("a", DispatchStage::Executing, "boom")],
        };
        let record = DispatchRecord::from_outcome(&context, &outcome, Utc::now());
        assert_eq!(record.status, DispatchStatus::Exhausted);
        assert_eq!(record.rejected_candidates, 1);
        telemetry.record_outcome(&record).await.unwrap();

        let logged = logger.find("dispatch.exhausted");
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].level, LogLevel::Warn);
        assert_eq!(logged[0].metadata["tenant_id"], "salon");
    }
}
