//! Cold-start retry and enhanced-mode fallback.
//!
//! A failure that returns faster than [`COLD_START_THRESHOLD`] means the agent
//! runtime never got going, not that the task failed. Those are retried with
//! the same configuration up to [`COLD_START_MAX_RETRIES`] times; if they keep
//! failing and enhanced mode was on, one last attempt runs without it. When
//! that also fails the first failure is reported, since it is the one that
//! explains what went wrong.
//!
//! Failures at or above the threshold are genuine and never retried.

use super::executor::PhaseExecutor;
use super::{ExecutionConfig, Phase, PhaseResult};
use std::path::PathBuf;
use std::time::Duration;

/// Failures shorter than this are treated as agent start-up failures.
pub const COLD_START_THRESHOLD: Duration = Duration::from_secs(60);

/// Retries after the first cold-start failure.
pub const COLD_START_MAX_RETRIES: u32 = 2;

/// Tunables of the retry protocol.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub cold_start_threshold: Duration,
    pub max_cold_start_retries: u32,
    /// Pause between attempts (same configuration, no growth).
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            cold_start_threshold: COLD_START_THRESHOLD,
            max_cold_start_retries: COLD_START_MAX_RETRIES,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn is_cold_start(&self, result: &PhaseResult) -> bool {
        !result.success && result.duration < self.cold_start_threshold
    }
}

pub(super) async fn execute_with_retry(
    executor: &PhaseExecutor,
    issue: u64,
    phase: Phase,
    config: &ExecutionConfig,
    working_dir: Option<PathBuf>,
) -> PhaseResult {
    let first = executor
        .execute_phase(issue, phase, config, working_dir.clone(), config.enhanced)
        .await;
    if first.success || !config.retry || config.dry_run {
        return first;
    }

    let policy = executor.policy();
    if !policy.is_cold_start(&first) {
        tracing::debug!(
            issue,
            phase = %phase,
            duration_secs = first.duration.as_secs_f64(),
            "genuine failure, not retrying"
        );
        return first;
    }

    let mut attempts = 1;
    for retry in 1..=policy.max_cold_start_retries {
        if executor.is_cancelled() {
            return with_attempts(first, attempts);
        }
        println!(
            "  {} {} failed after {:.1}s (cold start), retry {}/{}",
            console::style("↻").yellow(),
            phase,
            first.duration.as_secs_f64(),
            retry,
            policy.max_cold_start_retries
        );
        tracing::warn!(
            issue,
            phase = %phase,
            attempt = retry,
            max = policy.max_cold_start_retries,
            "cold-start failure, retrying"
        );
        tokio::time::sleep(policy.retry_delay).await;

        let result = executor
            .execute_phase(issue, phase, config, working_dir.clone(), config.enhanced)
            .await;
        attempts += 1;
        if result.success {
            tracing::info!(issue, phase = %phase, attempts, "phase succeeded after cold-start retry");
            return with_attempts(result, attempts);
        }
        if !policy.is_cold_start(&result) {
            // The agent got going this time; its failure is the real one.
            tracing::warn!(issue, phase = %phase, attempts, "retry ended in genuine failure");
            return with_attempts(result, attempts);
        }
    }

    if config.enhanced && !executor.is_cancelled() {
        println!(
            "  {} {} still failing, falling back to run without enhanced mode",
            console::style("↓").yellow(),
            phase
        );
        tracing::warn!(issue, phase = %phase, "cold-start retries exhausted, enhanced-mode fallback");
        tokio::time::sleep(policy.retry_delay).await;

        let fallback = executor
            .execute_phase(issue, phase, config, working_dir, false)
            .await;
        attempts += 1;
        if fallback.success {
            tracing::info!(issue, phase = %phase, "phase succeeded without enhanced mode");
            return with_attempts(fallback, attempts);
        }
        tracing::warn!(
            issue,
            phase = %phase,
            fallback_error = fallback.error.as_deref().unwrap_or(""),
            "fallback failed, reporting original error"
        );
    }

    with_attempts(first, attempts)
}

fn with_attempts(mut result: PhaseResult, attempts: u32) -> PhaseResult {
    result.attempts = attempts;
    result
}
