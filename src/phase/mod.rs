//! Workflow phases and their execution.
//!
//! - `Phase` names one step of an issue workflow
//! - [`executor`] invokes the external agent for one phase
//! - [`retry`] wraps it in the cold-start retry / fallback protocol
//! - [`verdict`] extracts the QA verdict from phase output

pub mod executor;
pub mod retry;
pub mod verdict;

pub use executor::{AgentOutput, AgentPhaseRunner, PhaseExecutor, PhaseInvocation, PhaseRunner};
pub use retry::{COLD_START_MAX_RETRIES, COLD_START_THRESHOLD, RetryPolicy};
pub use verdict::{QaVerdict, parse_qa_verdict};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One named workflow step. The work itself is done by the external agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Planning: read the issue, draft acceptance criteria.
    Spec,
    /// Security review of the plan, only meaningful after `spec`.
    SecurityReview,
    /// Implementation.
    Exec,
    /// Verification (browser/UI testing).
    Test,
    /// Review against acceptance criteria; emits a verdict.
    Qa,
    /// Fix pass of the quality loop.
    Loop,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Spec,
        Phase::SecurityReview,
        Phase::Exec,
        Phase::Test,
        Phase::Qa,
        Phase::Loop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Spec => "spec",
            Phase::SecurityReview => "security-review",
            Phase::Exec => "exec",
            Phase::Test => "test",
            Phase::Qa => "qa",
            Phase::Loop => "loop",
        }
    }

    /// Parse a phase token leniently (case, surrounding punctuation, `_`).
    /// Returns `None` for anything unrecognised.
    pub fn parse_token(token: &str) -> Option<Phase> {
        let cleaned = token
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
            .replace('_', "-");
        match cleaned.as_str() {
            "spec" => Some(Phase::Spec),
            "security-review" => Some(Phase::SecurityReview),
            "exec" => Some(Phase::Exec),
            "test" => Some(Phase::Test),
            "qa" => Some(Phase::Qa),
            "loop" => Some(Phase::Loop),
            _ => None,
        }
    }

    /// Phases whose failure can be repaired by the quality loop.
    pub fn is_verification(&self) -> bool {
        matches!(self, Phase::Test | Phase::Qa)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = crate::errors::PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::parse_token(s).ok_or_else(|| crate::errors::PhaseError::UnknownPhase(s.to_string()))
    }
}

/// Parse a comma/space separated phase list, dropping unknown tokens.
pub fn parse_phase_list(raw: &str) -> Vec<Phase> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .filter_map(Phase::parse_token)
        .collect()
}

/// Default phase sequence when nothing more specific applies.
pub fn default_phases() -> Vec<Phase> {
    vec![Phase::Spec, Phase::Exec, Phase::Qa]
}

/// How the orchestrator treats a failed issue.
///
/// `ContinueOnFailure` is a scheduling policy only: issues still run one at a
/// time, a failure just does not halt the remaining ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    StopOnFailure,
    #[default]
    ContinueOnFailure,
}

/// Per-run, immutable execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Explicit phase list; `None` lets the planner decide per issue.
    pub phases: Option<Vec<Phase>>,
    pub failure_policy: FailurePolicy,
    #[serde(with = "duration_secs")]
    pub phase_timeout: Duration,
    pub quality_loop: bool,
    pub max_iterations: u32,
    /// Enhanced-capability (tool/plugin) mode for the agent.
    pub enhanced: bool,
    /// Cold-start retry protocol.
    pub retry: bool,
    pub dry_run: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            phases: None,
            failure_policy: FailurePolicy::default(),
            phase_timeout: Duration::from_secs(1800),
            quality_loop: false,
            max_iterations: 3,
            enhanced: true,
            retry: true,
            dry_run: false,
        }
    }
}

impl ExecutionConfig {
    pub fn stops_on_failure(&self) -> bool {
        self.failure_policy == FailurePolicy::StopOnFailure
    }
}

/// Output of one phase invocation (after retries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub success: bool,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<QaVerdict>,
    /// Number of agent invocations it took to produce this result.
    #[serde(default = "one")]
    pub attempts: u32,
    /// Captured agent output; not persisted in run logs.
    #[serde(skip)]
    pub output: String,
}

fn one() -> u32 {
    1
}

impl PhaseResult {
    pub fn succeeded(phase: Phase, duration: Duration) -> Self {
        Self {
            phase,
            success: true,
            duration,
            error: None,
            verdict: None,
            attempts: 1,
            output: String::new(),
        }
    }

    pub fn failed(phase: Phase, duration: Duration, error: impl Into<String>) -> Self {
        Self {
            phase,
            success: false,
            duration,
            error: Some(error.into()),
            verdict: None,
            attempts: 1,
            output: String::new(),
        }
    }
}

/// Serialize `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
