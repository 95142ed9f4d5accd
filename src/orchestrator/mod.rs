pub mod runner;
pub mod shutdown;

pub use runner::{Orchestrator, RunContext};
pub use shutdown::{CleanupHandle, ShutdownCoordinator};

use crate::phase::ExecutionConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the issues of a run are scheduled. Issues never run concurrently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One issue after another, honouring the failure policy.
    #[default]
    Sequential,
    /// Ordered groups of issues.
    Batch,
    /// Each issue branches from the previous issue's branch.
    Chain,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            RunMode::Sequential => "sequential",
            RunMode::Batch => "batch",
            RunMode::Chain => "chain",
        })
    }
}

/// Settings for a single run, fixed before the first issue starts.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub mode: RunMode,
    pub execution: ExecutionConfig,
    /// Chain mode only: pause instead of stopping when verification fails.
    pub qa_gate: bool,
    /// Run issues that are already ready for merge or merged.
    pub force: bool,
    /// Base for the first issue (chain) or every issue (otherwise).
    pub base_branch: Option<String>,
    pub create_pr: bool,
    pub comment_on_issues: bool,
}

/// What to run: a flat list, or groups for batch mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPlan {
    Issues(Vec<u64>),
    Batches(Vec<Vec<u64>>),
}

impl RunPlan {
    pub fn issue_count(&self) -> usize {
        match self {
            RunPlan::Issues(v) => v.len(),
            RunPlan::Batches(b) => b.iter().map(Vec::len).sum(),
        }
    }
}

/// Aggregate result of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub passed: Vec<u64>,
    pub failed: Vec<u64>,
    pub skipped: Vec<u64>,
    /// Chain paused at this issue by the quality gate.
    pub gated: Option<u64>,
    pub cancelled: bool,
    pub dry_run: bool,
    pub log_path: Option<PathBuf>,
}

impl RunOutcome {
    /// 0 when every issue passed or the run was dry; 1 otherwise.
    ///
    /// A quality-gate pause is a deliberate stop and does not count as a
    /// failure on its own.
    pub fn exit_code(&self) -> u8 {
        if self.dry_run {
            return 0;
        }
        if self.cancelled || !self.failed.is_empty() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_serde() {
        assert_eq!(serde_json::to_string(&RunMode::Chain).unwrap(), "\"chain\"");
        let m: RunMode = serde_json::from_str("\"batch\"").unwrap();
        assert_eq!(m, RunMode::Batch);
    }

    #[test]
    fn test_exit_codes() {
        let mut outcome = RunOutcome {
            passed: vec![1],
            ..Default::default()
        };
        assert_eq!(outcome.exit_code(), 0);

        outcome.gated = Some(2);
        assert_eq!(outcome.exit_code(), 0);

        outcome.failed.push(3);
        assert_eq!(outcome.exit_code(), 1);

        outcome.dry_run = true;
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn test_plan_issue_count() {
        assert_eq!(RunPlan::Batches(vec![vec![1, 2], vec![3]]).issue_count(), 3);
        assert_eq!(RunPlan::Issues(vec![]).issue_count(), 0);
    }
}
