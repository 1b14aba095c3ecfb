//! Screening around the completion call: untrusted input before it, raw text and decoded
//! decisions after it.

/// Content-hash cache of recent outreach.
pub mod dedup;
mod screening;
mod tone;

use std::{fmt, sync::Arc};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use dedup::{content_hash, DedupCache};

use crate::{
    clock::{SharedClock, SystemClock},
    context::DispatchContext,
    decision::DecisionOutput,
};

/// Stable violation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    /// Rendered prompt exceeds the size limit.
    PromptTooLong,
    /// Untrusted input carries a personal identifier.
    SensitiveData,
    /// Untrusted input tries to override instructions.
    PromptInjection,
    /// Untrusted input imitates instructions.
    InstructionMimicry,
    /// Raw completion text exceeds the size limit.
    OutputTooLong,
    /// Outreach to a customer who opted out.
    OptOutOutreach,
    /// Hostile outreach text.
    AggressiveTone,
    /// Repetitive outreach text.
    SpamRepetition,
    /// Same outreach already dispatched recently.
    DuplicateContent,
}

impl ViolationCode {
    /// Snake-case code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PromptTooLong => "prompt_too_long",
            Self::SensitiveData => "sensitive_data",
            Self::PromptInjection => "prompt_injection",
            Self::InstructionMimicry => "instruction_mimicry",
            Self::OutputTooLong => "output_too_long",
            Self::OptOutOutreach => "opt_out_outreach",
            Self::AggressiveTone => "aggressive_tone",
            Self::SpamRepetition => "spam_repetition",
            Self::DuplicateContent => "duplicate_content",
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One blocking finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyViolation {
    /// Code.
    pub code: ViolationCode,
    /// Human-readable detail.
    pub detail: String,
}

impl SafetyViolation {
    /// Creates a violation.
    #[must_use]
    pub fn new(code: ViolationCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Result of one screening pass. Warnings never block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    /// Whether the checked content may proceed.
    pub safe: bool,
    /// Blocking findings.
    pub violations: Vec<SafetyViolation>,
    /// Non-blocking findings.
    pub warnings: Vec<String>,
}

impl SafetyVerdict {
    fn from_findings(violations: Vec<SafetyViolation>, warnings: Vec<String>) -> Self {
        Self {
            safe: violations.is_empty(),
            violations,
            warnings,
        }
    }

    /// Verdict with no findings.
    #[must_use]
    pub fn pass() -> Self {
        Self::from_findings(Vec::new(), Vec::new())
    }

    /// Codes of the violations, in order, without repeats.
    #[must_use]
    pub fn codes(&self) -> Vec<ViolationCode> {
        let mut codes = Vec::new();
        for violation in &self.violations {
            if !codes.contains(&violation.code) {
                codes.push(violation.code);
            }
        }
        codes
    }

    /// Comma-separated violation codes, for error and rejection text.
    #[must_use]
    pub fn describe(&self) -> String {
        self.codes()
            .iter()
            .map(|code| code.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Size limits and dedup bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetySettings {
    /// Longest accepted rendered prompt, in characters.
    pub max_prompt_chars: usize,
    /// Longest accepted raw completion, in characters.
    pub max_output_chars: usize,
    /// How long dispatched content is remembered.
    pub dedup_window: Duration,
    /// Most content hashes remembered at once.
    pub dedup_capacity: usize,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            max_prompt_chars: 24_000,
            max_output_chars: 16_000,
            dedup_window: Duration::hours(24),
            dedup_capacity: 10_000,
        }
    }
}

/// Pre- and post-invocation screening shared by the engine and the dispatcher.
#[derive(Debug)]
pub struct SafetyGate {
    settings: SafetySettings,
    dedup: DedupCache,
    clock: SharedClock,
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new(SafetySettings::default())
    }
}

impl SafetyGate {
    /// Gate on the wall clock.
    #[must_use]
    pub fn new(settings: SafetySettings) -> Self {
        Self {
            dedup: DedupCache::new(settings.dedup_window, settings.dedup_capacity),
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &SafetySettings {
        &self.settings
    }

    /// Screens the rendered prompt and the untrusted parts of the context.
    #[must_use]
    pub fn check_input(&self, prompt: &str, context: &DispatchContext) -> SafetyVerdict {
        let mut violations = Vec::new();
        let length = prompt.chars().count();
        if length > self.settings.max_prompt_chars {
            violations.push(SafetyViolation::new(
                ViolationCode::PromptTooLong,
                format!(
                    "prompt has {length} characters, limit is {}",
                    self.settings.max_prompt_chars
                ),
            ));
        }
        for segment in context.untrusted_segments() {
            violations.extend(screening::sensitive_data(segment));
            violations.extend(screening::injection(segment));
        }
        if !violations.is_empty() {
            debug!(dispatch_id = %context.dispatch_id, count = violations.len(), "input screening blocked");
        }
        SafetyVerdict::from_findings(violations, Vec::new())
    }

    /// Screens raw completion text before it is interpreted.
    #[must_use]
    pub fn check_raw_output(&self, text: &str) -> SafetyVerdict {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let length = text.chars().count();
        if length > self.settings.max_output_chars {
            violations.push(SafetyViolation::new(
                ViolationCode::OutputTooLong,
                format!(
                    "output has {length} characters, limit is {}",
                    self.settings.max_output_chars
                ),
            ));
        }
        if screening::has_template_delimiters(text) {
            warnings.push("output echoes chat-template delimiters".to_string());
        }
        SafetyVerdict::from_findings(violations, warnings)
    }

    /// Screens a decoded decision before its actions run.
    #[must_use]
    pub fn check_output(&self, output: &DecisionOutput, context: &DispatchContext) -> SafetyVerdict {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        if output.has_outreach() && tone::opt_out_signal(context) {
            violations.push(SafetyViolation::new(
                ViolationCode::OptOutOutreach,
                "customer opted out of contact",
            ));
        }
        for text in output.outreach_texts() {
            if tone::aggressive(text) {
                violations.push(SafetyViolation::new(
                    ViolationCode::AggressiveTone,
                    "outreach contains hostile phrasing",
                ));
            }
            if tone::spam_like(text) {
                violations.push(SafetyViolation::new(
                    ViolationCode::SpamRepetition,
                    "outreach repeats itself",
                ));
            }
            if tone::shouting(text) {
                warnings.push("outreach uses excessive capitals or exclamation marks".to_string());
            }
        }
        if let Some(hash) = content_hash(output, context) {
            if self.dedup.contains(&hash, self.clock.now()) {
                violations.push(SafetyViolation::new(
                    ViolationCode::DuplicateContent,
                    "identical outreach already sent within the dedup window",
                ));
            }
        }
        SafetyVerdict::from_findings(violations, warnings)
    }

    /// Remembers the outreach of a committed decision.
    pub fn mark_dispatched(&self, output: &DecisionOutput, context: &DispatchContext) {
        if let Some(hash) = content_hash(output, context) {
            self.dedup.insert(hash, self.clock.now());
        }
    }

    /// Drops expired dedup entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.dedup.sweep(self.clock.now())
    }

    /// Number of remembered content hashes.
    #[must_use]
    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }
}
