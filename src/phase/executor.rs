//! Single-phase invocation of the external agent.
//!
//! The agent is opaque: it gets an issue number, a phase name, a working
//! directory and the enhanced-mode flag, and hands back an exit status plus
//! captured text. [`PhaseExecutor`] turns that into a [`PhaseResult`].

use super::retry::RetryPolicy;
use super::verdict::parse_qa_verdict;
use super::{ExecutionConfig, Phase, PhaseResult};
use crate::process::CommandSpec;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the orchestrator asks the agent to do.
#[derive(Debug, Clone)]
pub struct PhaseInvocation {
    pub issue: u64,
    pub phase: Phase,
    /// Working-directory override (the issue's worktree).
    pub working_dir: Option<PathBuf>,
    /// Enhanced-capability mode (tool/plugin integration).
    pub enhanced: bool,
    pub timeout: Duration,
}

/// What the agent handed back.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    /// `None` when the process was killed (timeout or cancellation).
    pub exit_code: Option<i32>,
    pub output: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Collaborator boundary for the external phase agent.
/// Real implementation: `AgentPhaseRunner`. Tests use scripted runners.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    async fn run_phase(
        &self,
        invocation: &PhaseInvocation,
        cancel: &CancellationToken,
    ) -> anyhow::Result<AgentOutput>;
}

/// Runs the agent as a subprocess.
///
/// `args` may contain `{issue}` and `{phase}` placeholders; `enhanced_args`
/// are appended only in enhanced mode. The agent also sees
/// `SEQUANT_ISSUE`, `SEQUANT_PHASE` and `SEQUANT_ENHANCED` in its environment.
pub struct AgentPhaseRunner {
    program: String,
    args: Vec<String>,
    enhanced_args: Vec<String>,
    default_dir: PathBuf,
}

impl AgentPhaseRunner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        enhanced_args: Vec<String>,
        default_dir: PathBuf,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            enhanced_args,
            default_dir,
        }
    }

    pub fn build_command(&self, invocation: &PhaseInvocation) -> CommandSpec {
        let issue = invocation.issue.to_string();
        let phase = invocation.phase.as_str();
        let expand = |arg: &String| arg.replace("{issue}", &issue).replace("{phase}", phase);

        let mut spec = CommandSpec::new(&self.program)
            .args(self.args.iter().map(expand))
            .current_dir(
                invocation
                    .working_dir
                    .as_ref()
                    .unwrap_or(&self.default_dir),
            )
            .env("SEQUANT_ISSUE", issue.clone())
            .env("SEQUANT_PHASE", phase)
            .env(
                "SEQUANT_ENHANCED",
                if invocation.enhanced { "1" } else { "0" },
            )
            .timeout(invocation.timeout);
        if invocation.enhanced {
            spec = spec.args(self.enhanced_args.iter().map(expand));
        }
        spec
    }
}

#[async_trait]
impl PhaseRunner for AgentPhaseRunner {
    async fn run_phase(
        &self,
        invocation: &PhaseInvocation,
        cancel: &CancellationToken,
    ) -> anyhow::Result<AgentOutput> {
        let spec = self.build_command(invocation);
        let out = spec.run_cancellable(cancel).await?;
        Ok(AgentOutput {
            exit_code: out.code,
            output: out.combined(),
            duration: out.duration,
            timed_out: out.timed_out,
            cancelled: out.cancelled,
        })
    }
}

/// Interprets agent runs as phase results and applies the retry protocol.
pub struct PhaseExecutor {
    runner: Arc<dyn PhaseRunner>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl PhaseExecutor {
    pub fn new(runner: Arc<dyn PhaseRunner>, cancel: CancellationToken) -> Self {
        Self {
            runner,
            policy: RetryPolicy::default(),
            cancel,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one phase once.
    ///
    /// Spawn errors are folded into a failed result with zero duration, which
    /// the retry protocol then treats as a cold start.
    pub async fn execute_phase(
        &self,
        issue: u64,
        phase: Phase,
        config: &ExecutionConfig,
        working_dir: Option<PathBuf>,
        enhanced: bool,
    ) -> PhaseResult {
        if config.dry_run {
            tracing::info!(issue, phase = %phase, "dry run, phase not executed");
            return PhaseResult::succeeded(phase, Duration::ZERO);
        }

        let invocation = PhaseInvocation {
            issue,
            phase,
            working_dir,
            enhanced,
            timeout: config.phase_timeout,
        };

        let agent = match self.runner.run_phase(&invocation, &self.cancel).await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::warn!(issue, phase = %phase, error = %e, "phase agent could not be started");
                return PhaseResult::failed(phase, Duration::ZERO, format!("{:#}", e));
            }
        };

        interpret(phase, config, agent)
    }

    /// Run one phase under the cold-start retry protocol.
    pub async fn execute_phase_with_retry(
        &self,
        issue: u64,
        phase: Phase,
        config: &ExecutionConfig,
        working_dir: Option<PathBuf>,
    ) -> PhaseResult {
        super::retry::execute_with_retry(self, issue, phase, config, working_dir).await
    }
}

fn interpret(phase: Phase, config: &ExecutionConfig, agent: AgentOutput) -> PhaseResult {
    let verdict = if phase == Phase::Qa {
        parse_qa_verdict(&agent.output)
    } else {
        None
    };

    let error = if agent.cancelled {
        Some(format!("Phase {} was cancelled", phase))
    } else if agent.timed_out {
        Some(format!(
            "Phase {} timed out after {}s",
            phase,
            config.phase_timeout.as_secs()
        ))
    } else if agent.exit_code != Some(0) {
        Some(match agent.exit_code {
            Some(code) => format!("Agent exited with code {}{}", code, tail(&agent.output)),
            None => format!("Agent was terminated{}", tail(&agent.output)),
        })
    } else if let Some(v) = verdict.filter(|v| v.is_failing()) {
        Some(format!("QA verdict: {}", v))
    } else {
        None
    };

    PhaseResult {
        phase,
        success: error.is_none(),
        duration: agent.duration,
        error,
        verdict,
        attempts: 1,
        output: agent.output,
    }
}

/// Last non-empty output line, for error messages.
fn tail(output: &str) -> String {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| {
            let line: String = l.chars().take(200).collect();
            format!(": {}", line)
        })
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Runner that replays a scripted sequence of outputs and records calls.
    #[derive(Default)]
    pub struct ScriptedRunner {
        script: Mutex<VecDeque<AgentOutput>>,
        pub calls: Mutex<Vec<PhaseInvocation>>,
    }

    impl ScriptedRunner {
        pub fn new(script: Vec<AgentOutput>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    pub fn ok(secs: u64, output: &str) -> AgentOutput {
        AgentOutput {
            exit_code: Some(0),
            output: output.to_string(),
            duration: Duration::from_secs(secs),
            ..Default::default()
        }
    }

    pub fn fail(secs: u64, output: &str) -> AgentOutput {
        AgentOutput {
            exit_code: Some(1),
            output: output.to_string(),
            duration: Duration::from_secs(secs),
            ..Default::default()
        }
    }

    #[async_trait]
    impl PhaseRunner for ScriptedRunner {
        async fn run_phase(
            &self,
            invocation: &PhaseInvocation,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<AgentOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ok(120, "")))
        }
    }
}
