use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token accounting reported by a completion service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens produced.
    pub completion_tokens: u32,
    /// Sum of both.
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Usage with the total filled in.
    #[must_use]
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// One completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Unit issuing the request.
    pub unit_name: String,
    /// Model identifier.
    pub model: String,
    /// Trusted instructions.
    pub system_prompt: String,
    /// Rendered event content.
    pub user_prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion length cap.
    pub max_tokens: u32,
    /// Whether the service should constrain output to JSON.
    pub structured_output: bool,
}

/// Raw completion text plus accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text.
    pub text: String,
    /// Token usage, when the service reports it.
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
}

/// Failures of a completion service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// Temporary failure; the same request may succeed later.
    #[error("transient completion failure: {0}")]
    Transient(String),
    /// The service gave up waiting.
    #[error("completion service timed out: {0}")]
    Timeout(String),
    /// The service refused the request.
    #[error("completion rejected: {0}")]
    Rejected(String),
    /// The service cannot be reached.
    #[error("completion service unavailable: {0}")]
    Unavailable(String),
}

/// Generates raw decision text from a rendered prompt.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Runs one completion.
    async fn generate(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError>;
}

#[derive(Debug, Clone)]
enum Step {
    Reply(String),
    Fail(CompletionError),
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
    delay: Option<Duration>,
}

impl Script {
    /// Pops the next step; the last one repeats forever.
    fn next_step(&mut self) -> Option<Step> {
        if self.steps.len() > 1 {
            self.steps.pop_front()
        } else {
            self.steps.front().cloned()
        }
    }
}

const DEFAULT_SCRIPT: &str = "*";

/// Completion service replaying canned replies per unit, with optional delays and failures.
#[derive(Debug, Default)]
pub struct ScriptedCompletionService {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletionService {
    /// Service with no scripts. Every call fails as unavailable until scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for a unit.
    #[must_use]
    pub fn respond(mut self, unit: impl Into<String>, text: impl Into<String>) -> Self {
        self.script(unit.into()).steps.push_back(Step::Reply(text.into()));
        self
    }

    /// Queues a failure for a unit.
    #[must_use]
    pub fn fail(mut self, unit: impl Into<String>, error: CompletionError) -> Self {
        self.script(unit.into()).steps.push_back(Step::Fail(error));
        self
    }

    /// Delays every reply to a unit.
    #[must_use]
    pub fn delay(mut self, unit: impl Into<String>, delay: Duration) -> Self {
        self.script(unit.into()).delay = Some(delay);
        self
    }

    /// Reply for units without a script of their own.
    #[must_use]
    pub fn respond_default(self, text: impl Into<String>) -> Self {
        self.respond(DEFAULT_SCRIPT, text)
    }

    /// Builds a service from a parsed script file.
    #[must_use]
    pub fn from_script(file: ScriptFile) -> Self {
        let mut service = Self::new();
        if let Some(text) = file.default {
            service = service.respond_default(text);
        }
        for (unit, entry) in file.units {
            service = match entry {
                ScriptEntry::Text(text) => service.respond(unit, text),
                ScriptEntry::Detailed(step) => step.apply(service, unit),
                ScriptEntry::Sequence(steps) => steps
                    .into_iter()
                    .fold(service, |service, step| step.apply(service, unit.clone())),
            };
        }
        service
    }

    /// Requests received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    /// Names of the units that called, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|request| request.unit_name.clone())
            .collect()
    }

    fn script(&mut self, unit: String) -> &mut Script {
        self.scripts.get_mut().entry(unit).or_default()
    }

    fn next(&self, unit: &str) -> (Option<Step>, Option<Duration>) {
        let mut scripts = self.scripts.lock();
        let key = if scripts.contains_key(unit) { unit } else { DEFAULT_SCRIPT };
        scripts
            .get_mut(key)
            .map_or((None, None), |script| (script.next_step(), script.delay))
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletionService {
    async fn generate(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        let (step, delay) = self.next(&request.unit_name);
        let prompt_chars = request.system_prompt.len() + request.user_prompt.len();
        let unit = request.unit_name.clone();
        self.requests.lock().push(request);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match step {
            Some(Step::Reply(text)) => {
                let usage = TokenUsage::new(estimate_tokens(prompt_chars), estimate_tokens(text.len()));
                Ok(CompletionResponse {
                    text,
                    token_usage: Some(usage),
                })
            }
            Some(Step::Fail(error)) => Err(error),
            None => Err(CompletionError::Unavailable(format!(
                "no scripted response for unit '{unit}'"
            ))),
        }
    }
}

fn estimate_tokens(chars: usize) -> u32 {
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

/// Scripted responses as stored in a JSON file.
///
/// ```json
/// { "default": "{...}", "units": { "front_desk": "{...}", "slow": { "delay_ms": 50, "text": "{...}" } } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptFile {
    /// Reply for units without their own entry.
    #[serde(default)]
    pub default: Option<String>,
    /// Per-unit entries.
    #[serde(default)]
    pub units: IndexMap<String, ScriptEntry>,
}

/// Script for one unit.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScriptEntry {
    /// A single reply.
    Text(String),
    /// A single step with options.
    Detailed(ScriptStep),
    /// Steps consumed in order, the last one repeating.
    Sequence(Vec<ScriptStep>),
}

/// One scripted step.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptStep {
    /// Reply text.
    #[serde(default)]
    pub text: Option<String>,
    /// Failure kind: `transient`, `timeout`, `rejected` or `unavailable`.
    #[serde(default)]
    pub error: Option<String>,
    /// Delay before answering.
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl ScriptStep {
    fn apply(self, mut service: ScriptedCompletionService, unit: String) -> ScriptedCompletionService {
        if let Some(ms) = self.delay_ms {
            service = service.delay(unit.clone(), Duration::from_millis(ms));
        }
        match (self.text, self.error) {
            (_, Some(kind)) => {
                let detail = "scripted failure".to_string();
                let error = match kind.as_str() {
                    "transient" => CompletionError::Transient(detail),
                    "timeout" => CompletionError::Timeout(detail),
                    "rejected" => CompletionError::Rejected(detail),
                    _ => CompletionError::Unavailable(detail),
                };
                service.fail(unit, error)
            }
            (Some(text), None) => service.respond(unit, text),
            (None, None) => service,
        }
    }
}
