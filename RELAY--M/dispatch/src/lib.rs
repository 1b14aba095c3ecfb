#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Relay decision-unit dispatch library.
//!
//! Given a [`context::DispatchContext`], the [`dispatcher::Dispatcher`] walks the
//! priority-ordered candidates from the [`registry::UnitRegistry`], admits each through the
//! [`limiter::RateLimiter`], runs it with the [`engine::ExecutionEngine`], screens the result
//! with the [`safety::SafetyGate`] and carries out its actions with the
//! [`executor::ActionExecutor`], committing on the first candidate that makes it through.

/// Injectable time source.
#[path = "../clock.rs"]
pub mod clock;

/// Configuration errors shared by the registry and dispatcher.
#[path = "../error.rs"]
pub mod error;

/// Decision unit configuration records.
#[path = "../unit.rs"]
pub mod unit;

/// Per-event dispatch input.
#[path = "../context.rs"]
pub mod context;

/// Decision outputs, actions, and execution results.
#[path = "../decision.rs"]
pub mod decision;

/// Catalogue of registered decision units.
#[path = "../registry.rs"]
pub mod registry;

/// Multi-level admission control.
#[path = "../limiter/main.rs"]
pub mod limiter;

/// Input and output screening.
#[path = "../safety/main.rs"]
pub mod safety;

/// Raw completion text to validated decision output.
#[path = "../interpreter.rs"]
pub mod interpreter;

/// Completion service seam.
#[path = "../completion.rs"]
pub mod completion;

/// Prompt rendering seam.
#[path = "../prompt.rs"]
pub mod prompt;

/// Single-unit invocation.
#[path = "../engine.rs"]
pub mod engine;

/// Business record store consumed by the action executor.
#[path = "../store.rs"]
pub mod store;

/// Ordered action execution.
#[path = "../executor.rs"]
pub mod executor;

/// Execution log sink and structured telemetry.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Top-level candidate state machine.
#[path = "../dispatcher.rs"]
pub mod dispatcher;

/// Periodic sweeping of limiter and dedup state.
#[path = "../maintenance.rs"]
pub mod maintenance;

/// TOML configuration.
#[path = "../config.rs"]
pub mod config;

#[cfg(test)]
#[path = "../testkit.rs"]
mod testkit;

/// Prelude exports for embedding the pipeline.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::completion::{
        CompletionError, CompletionRequest, CompletionResponse, CompletionService,
        ScriptedCompletionService,
    };
    pub use crate::config::RelayConfig;
    pub use crate::context::{DispatchContext, HistoryTurn, InputPayload};
    pub use crate::decision::{Action, ActionKind, DecisionOutput, ExecutionResult};
    pub use crate::dispatcher::{
        CandidateAttempt, DispatchOutcome, DispatchStage, Dispatcher, DispatcherBuilder,
    };
    pub use crate::engine::ExecutionEngine;
    pub use crate::error::RelayError;
    pub use crate::executor::{ActionExecutor, ActionResult};
    pub use crate::interpreter::OutputInterpreter;
    pub use crate::limiter::{Admission, DenialReason, RateLimiter};
    pub use crate::maintenance::{MaintenanceHandle, MaintenanceTask};
    pub use crate::prompt::{PromptRenderer, TemplateRenderer};
    pub use crate::registry::UnitRegistry;
    pub use crate::safety::{SafetyGate, SafetyVerdict};
    pub use crate::store::{ActionTargetStore, MemoryTargetStore};
    pub use crate::telemetry::{DispatchTelemetry, ExecutionLogSink};
    pub use crate::unit::{DecisionUnit, ModelConfig, RateLimitPolicy, Trigger, UnitTier};
}
