//! Fixtures shared by the unit tests.

use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use shared_event_bus::MemoryEventBus;
use shared_logging::MemoryLogger;

use crate::{
    clock::ManualClock,
    completion::ScriptedCompletionService,
    context::DispatchContext,
    dispatcher::Dispatcher,
    engine::ExecutionEngine,
    executor::ActionExecutor,
    limiter::RateLimiter,
    prompt::TemplateRenderer,
    registry::UnitRegistry,
    safety::SafetyGate,
    store::MemoryTargetStore,
    telemetry::{DispatchTelemetry, ExecutionLogSink},
    unit::{DecisionUnit, Trigger},
};

/// Message-triggered unit with default threshold and no rate limit.
pub fn unit(name: &str, priority: i32) -> DecisionUnit {
    DecisionUnit::builder(name)
        .trigger(Trigger::MessageReceived)
        .priority(priority)
        .build()
}

/// Inbound message from `cust-1` of the `salon` tenant.
pub fn message(text: &str) -> DispatchContext {
    DispatchContext::builder(Trigger::MessageReceived, "salon")
        .customer("cust-1")
        .conversation("conv-1")
        .message(text)
        .build()
}

pub fn decision_json(actions: Value, confidence: f64) -> String {
    json!({
        "actions": actions,
        "summary": "scripted",
        "confidence": confidence,
    })
    .to_string()
}

pub fn reply_json(text: &str, confidence: f64) -> String {
    decision_json(
        json!([{"type": "send_message", "payload": {"message": text}}]),
        confidence,
    )
}

pub fn clarification_json(question: &str, confidence: f64) -> String {
    decision_json(
        json!([{"type": "ask_clarification", "payload": {"question": question}}]),
        confidence,
    )
}

/// Dispatcher wired to in-memory collaborators on a manual clock.
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub store: Arc<MemoryTargetStore>,
    pub clock: ManualClock,
    pub logger: Arc<MemoryLogger>,
    pub bus: Arc<MemoryEventBus>,
    pub service: Arc<ScriptedCompletionService>,
}

impl Harness {
    pub fn new(units: Vec<DecisionUnit>, service: ScriptedCompletionService) -> Self {
        Self::build(units, service, None)
    }

    pub fn with_sink(
        units: Vec<DecisionUnit>,
        service: ScriptedCompletionService,
        sink: Arc<dyn ExecutionLogSink>,
    ) -> Self {
        Self::build(units, service, Some(sink))
    }

    fn build(
        units: Vec<DecisionUnit>,
        service: ScriptedCompletionService,
        sink: Option<Arc<dyn ExecutionLogSink>>,
    ) -> Self {
        let clock = ManualClock::default();
        let logger = Arc::new(MemoryLogger::new(256));
        let bus = Arc::new(MemoryEventBus::new(256));
        let service = Arc::new(service);
        let store = Arc::new(MemoryTargetStore::new());

        let registry = Arc::new(UnitRegistry::from_units(units).unwrap());
        let safety = Arc::new(SafetyGate::default().with_clock(Arc::new(clock.clone())));
        let engine = ExecutionEngine::new(
            Arc::new(TemplateRenderer::new()),
            Arc::clone(&service) as _,
            Arc::clone(&safety),
        )
        .with_completion_timeout(Duration::from_secs(5));
        let executor = ActionExecutor::new(Arc::clone(&store) as _);
        let sink = sink.unwrap_or_else(|| {
            Arc::new(
                DispatchTelemetry::builder("dispatch")
                    .log_sink(Arc::clone(&logger) as _)
                    .event_publisher(Arc::clone(&bus) as _)
                    .build()
                    .unwrap(),
            ) as Arc<dyn ExecutionLogSink>
        });

        let dispatcher = Dispatcher::builder(registry, Arc::new(engine), Arc::new(executor))
            .limiter(Arc::new(RateLimiter::default().with_clock(Arc::new(clock.clone()))))
            .safety(safety)
            .telemetry(sink)
            .clock(Arc::new(clock.clone()))
            .build();

        Self {
            dispatcher,
            store,
            clock,
            logger,
            bus,
            service,
        }
    }
}
