use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    clock::{SharedClock, SystemClock},
    context::DispatchContext,
    decision::{DecisionOutput, ExecutionResult},
    engine::ExecutionEngine,
    error::RelayError,
    executor::{succeeded, ActionExecutor, ActionResult},
    limiter::{Admission, RateLimiter},
    registry::UnitRegistry,
    safety::SafetyGate,
    telemetry::{DispatchRecord, ExecutionLogSink},
    unit::DecisionUnit,
};

/// Longest a dispatch waits on one execution log write.
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(2);

/// Pipeline stage a candidate reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStage {
    /// Picking the next candidate.
    Selecting,
    /// Admission control.
    RateCheck,
    /// Unit invocation.
    Executing,
    /// Decision screening.
    SafetyCheck,
    /// Confidence threshold.
    ConfidenceCheck,
    /// Applying actions.
    Acting,
    /// Committed.
    Committed,
    /// No candidate left.
    Exhausted,
}

impl DispatchStage {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Selecting => "selecting",
            Self::RateCheck => "rate_check",
            Self::Executing => "executing",
            Self::SafetyCheck => "safety_check",
            Self::ConfidenceCheck => "confidence_check",
            Self::Acting => "acting",
            Self::Committed => "committed",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected candidate and where it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAttempt {
    /// Unit name.
    pub unit: String,
    /// Stage that rejected it.
    pub stage: DispatchStage,
    /// Why.
    pub reason: String,
}

impl CandidateAttempt {
    /// Creates an attempt record.
    #[must_use]
    pub fn new(unit: impl Into<String>, stage: DispatchStage, reason: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            stage,
            reason: reason.into(),
        }
    }
}

/// Terminal result of a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A unit's decision was applied.
    Committed {
        /// Committed unit.
        unit: String,
        /// Actions applied.
        actions_executed: usize,
        /// Actions attempted.
        actions_attempted: usize,
        /// Per-action results, attempted actions only.
        action_results: Vec<ActionResult>,
        /// The applied decision.
        output: DecisionOutput,
        /// Candidates rejected before this one.
        attempts: Vec<CandidateAttempt>,
    },
    /// A direct dispatch was refused.
    Rejected {
        /// Requested unit.
        unit: String,
        /// Stage that refused it.
        stage: DispatchStage,
        /// Why.
        reason: String,
    },
    /// Every candidate was rejected, or there were none.
    Exhausted {
        /// Rejected candidates in order.
        attempts: Vec<CandidateAttempt>,
    },
}

impl DispatchOutcome {
    /// Whether a decision was applied.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    /// Name of the committed unit.
    #[must_use]
    pub fn committed_unit(&self) -> Option<&str> {
        match self {
            Self::Committed { unit, .. } => Some(unit),
            _ => None,
        }
    }
}

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Automatic dispatches started.
    pub dispatches: u64,
    /// Dispatches, automatic or direct, that committed.
    pub commits: u64,
    /// Automatic dispatches with no committing candidate.
    pub exhaustions: u64,
    /// Candidates rejected during automatic dispatch.
    pub fallbacks: u64,
    /// Direct dispatches started.
    pub direct_dispatches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatches: AtomicU64,
    commits: AtomicU64,
    exhaustions: AtomicU64,
    fallbacks: AtomicU64,
    direct_dispatches: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            direct_dispatches: self.direct_dispatches.load(Ordering::Relaxed),
        }
    }
}

struct Commit {
    output: DecisionOutput,
    action_results: Vec<ActionResult>,
    executed: usize,
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    registry: Arc<UnitRegistry>,
    engine: Arc<ExecutionEngine>,
    executor: Arc<ActionExecutor>,
    limiter: Option<Arc<RateLimiter>>,
    safety: Option<Arc<SafetyGate>>,
    sink: Option<Arc<dyn ExecutionLogSink>>,
    sink_timeout: Duration,
    clock: Option<SharedClock>,
}

impl DispatcherBuilder {
    /// Overrides the rate limiter.
    #[must_use]
    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Overrides the safety gate. Defaults to the engine's gate so dedup state is shared.
    #[must_use]
    pub fn safety(mut self, safety: Arc<SafetyGate>) -> Self {
        self.safety = Some(safety);
        self
    }

    /// Attaches an execution log sink.
    #[must_use]
    pub fn telemetry(mut self, sink: Arc<dyn ExecutionLogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Overrides how long each sink write may take before it is abandoned.
    #[must_use]
    pub const fn sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout = timeout;
        self
    }

    /// Overrides the clock used for outcome timestamps.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the dispatcher.
    #[must_use]
    pub fn build(self) -> Dispatcher {
        let safety = self.safety.unwrap_or_else(|| self.engine.safety());
        Dispatcher {
            registry: self.registry,
            engine: self.engine,
            executor: self.executor,
            limiter: self.limiter.unwrap_or_default(),
            safety,
            sink: self.sink,
            sink_timeout: self.sink_timeout,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            counters: Counters::default(),
        }
    }
}

/// Walks candidate units for an event and commits the first acceptable decision.
pub struct Dispatcher {
    registry: Arc<UnitRegistry>,
    engine: Arc<ExecutionEngine>,
    executor: Arc<ActionExecutor>,
    limiter: Arc<RateLimiter>,
    safety: Arc<SafetyGate>,
    sink: Option<Arc<dyn ExecutionLogSink>>,
    sink_timeout: Duration,
    clock: SharedClock,
    counters: Counters,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("units", &self.registry.count())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Starts a builder.
    #[must_use]
    pub fn builder(
        registry: Arc<UnitRegistry>,
        engine: Arc<ExecutionEngine>,
        executor: Arc<ActionExecutor>,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            registry,
            engine,
            executor,
            limiter: None,
            safety: None,
            sink: None,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
            clock: None,
        }
    }

    /// Unit catalogue.
    #[must_use]
    pub fn registry(&self) -> Arc<UnitRegistry> {
        Arc::clone(&self.registry)
    }

    /// Admission control state.
    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Screening state.
    #[must_use]
    pub fn safety(&self) -> Arc<SafetyGate> {
        Arc::clone(&self.safety)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Tries candidates in priority order until one commits.
    #[instrument(skip(self, context), fields(dispatch_id = %context.dispatch_id, trigger = %context.trigger))]
    pub async fn dispatch(&self, context: &DispatchContext) -> DispatchOutcome {
        Counters::bump(&self.counters.dispatches);
        let candidates = self.registry.find_candidates(context);
        let mut attempts = Vec::new();

        for unit in candidates {
            match self.run_candidate(&unit, context, true).await {
                Ok(commit) => {
                    Counters::bump(&self.counters.commits);
                    info!(unit = %unit.name, fallbacks = attempts.len(), "dispatch committed");
                    let outcome = DispatchOutcome::Committed {
                        unit: unit.name.clone(),
                        actions_executed: commit.executed,
                        actions_attempted: commit.action_results.len(),
                        action_results: commit.action_results,
                        output: commit.output,
                        attempts,
                    };
                    self.log_outcome(context, &outcome).await;
                    return outcome;
                }
                Err(attempt) => {
                    Counters::bump(&self.counters.fallbacks);
                    self.log_rejection(context, &attempt).await;
                    attempts.push(attempt);
                }
            }
        }

        Counters::bump(&self.counters.exhaustions);
        warn!(candidates = attempts.len(), "dispatch exhausted");
        let outcome = DispatchOutcome::Exhausted { attempts };
        self.log_outcome(context, &outcome).await;
        outcome
    }

    /// Runs one named unit, skipping selection and admission control.
    ///
    /// The unit's execution is still recorded with the limiter, so later automatic dispatches
    /// see it.
    #[instrument(skip(self, context), fields(dispatch_id = %context.dispatch_id))]
    pub async fn dispatch_to(&self, unit_name: &str, context: &DispatchContext) -> Result<DispatchOutcome, RelayError> {
        let unit = self
            .registry
            .get(unit_name)
            .ok_or_else(|| RelayError::UnitNotFound(unit_name.to_string()))?;
        Counters::bump(&self.counters.direct_dispatches);

        let outcome = match self.run_candidate(&unit, context, false).await {
            Ok(commit) => {
                Counters::bump(&self.counters.commits);
                DispatchOutcome::Committed {
                    unit: unit.name.clone(),
                    actions_executed: commit.executed,
                    actions_attempted: commit.action_results.len(),
                    action_results: commit.action_results,
                    output: commit.output,
                    attempts: Vec::new(),
                }
            }
            Err(attempt) => {
                self.log_rejection(context, &attempt).await;
                DispatchOutcome::Rejected {
                    unit: attempt.unit,
                    stage: attempt.stage,
                    reason: attempt.reason,
                }
            }
        };
        self.log_outcome(context, &outcome).await;
        Ok(outcome)
    }

    async fn run_candidate(
        &self,
        unit: &DecisionUnit,
        context: &DispatchContext,
        admission_control: bool,
    ) -> Result<Commit, CandidateAttempt> {
        let reject = |stage, reason: String| CandidateAttempt::new(&unit.name, stage, reason);

        if admission_control {
            let admission = self.limiter.check_allowed(
                &unit.name,
                &context.tenant_id,
                unit.rate_limit.as_ref(),
                context.customer_id.as_deref(),
            );
            if let Admission::Denied { reason, .. } = admission {
                return Err(reject(DispatchStage::RateCheck, reason.to_string()));
            }
        }

        let result = self.engine.execute(unit, context).await;
        self.log_execution(&result).await;
        let output = match result {
            ExecutionResult {
                success: true,
                output: Some(output),
                ..
            } => output,
            ExecutionResult { error, .. } => {
                return Err(reject(
                    DispatchStage::Executing,
                    error.unwrap_or_else(|| "execution produced no output".into()),
                ))
            }
        };

        let verdict = self.safety.check_output(&output, context);
        if !verdict.safe {
            return Err(reject(
                DispatchStage::SafetyCheck,
                format!("blocked by safety gate: {}", verdict.describe()),
            ));
        }

        if output.confidence < unit.confidence_threshold && !output.is_clarification_only() {
            return Err(reject(
                DispatchStage::ConfidenceCheck,
                format!(
                    "confidence {:.2} below threshold {:.2}",
                    output.confidence, unit.confidence_threshold
                ),
            ));
        }

        let action_results = self.executor.execute_all(&output.actions, context).await;
        let executed = succeeded(&action_results);
        if executed == 0 {
            let cause = action_results
                .last()
                .and_then(|result| result.error.clone())
                .unwrap_or_else(|| "no actions".into());
            return Err(reject(DispatchStage::Acting, format!("no action succeeded: {cause}")));
        }

        self.limiter
            .record_execution(&unit.name, &context.tenant_id, context.customer_id.as_deref());
        self.safety.mark_dispatched(&output, context);
        Ok(Commit {
            output,
            action_results,
            executed,
        })
    }

    async fn log_execution(&self, result: &ExecutionResult) {
        if let Some(sink) = &self.sink {
            self.deliver("execution", sink.record_execution(result)).await;
        }
    }

    async fn log_rejection(&self, context: &DispatchContext, attempt: &CandidateAttempt) {
        info!(unit = %attempt.unit, stage = %attempt.stage, reason = %attempt.reason, "candidate rejected");
        if let Some(sink) = &self.sink {
            self.deliver("rejection", sink.record_rejection(context.dispatch_id, attempt))
                .await;
        }
    }

    async fn log_outcome(&self, context: &DispatchContext, outcome: &DispatchOutcome) {
        if let Some(sink) = &self.sink {
            let record = DispatchRecord::from_outcome(context, outcome, self.clock.now());
            self.deliver("outcome", sink.record_outcome(&record)).await;
        }
    }

    async fn deliver(&self, kind: &str, write: impl Future<Output = anyhow::Result<()>> + Send) {
        match tokio::time::timeout(self.sink_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(record = kind, error = %err, "execution log sink failed"),
            Err(_) => warn!(
                record = kind,
                timeout = ?self.sink_timeout,
                "execution log sink timed out"
            ),
        }
    }
}
