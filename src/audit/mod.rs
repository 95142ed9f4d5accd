//! Run logs: one JSON document per orchestrator invocation.
//!
//! The writer side lives in [`logger`]; readers use [`list_runs`] and
//! [`load_run`]. A log without `endTime` and `summary` belongs to a run that
//! never finalized and is reported as [`Completion::Incomplete`].

use crate::orchestrator::RunMode;
use crate::phase::{ExecutionConfig, PhaseResult, duration_secs};
use crate::state::IssueStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub mod logger;
pub use logger::{RunLogWriter, list_runs, load_run};

pub const RUN_LOG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLog {
    pub version: u32,
    pub run_id: Uuid,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_commit: Option<String>,
    pub config: RunConfig,
    #[serde(default)]
    pub issues: Vec<IssueRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

impl RunLog {
    pub fn new(config: RunConfig, start_commit: Option<String>) -> Self {
        Self {
            version: RUN_LOG_VERSION,
            run_id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            start_commit,
            end_commit: None,
            config,
            issues: Vec::new(),
            summary: None,
        }
    }

    pub fn completion(&self) -> Completion {
        if self.end_time.is_some() && self.summary.is_some() {
            Completion::Complete
        } else {
            Completion::Incomplete
        }
    }

    /// Totals over the issue records written so far.
    pub fn compute_summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for record in &self.issues {
            summary.total += 1;
            summary.total_duration += record.total_duration;
            match record.outcome {
                IssueOutcome::Passed => summary.passed += 1,
                IssueOutcome::Failed => summary.failed += 1,
                IssueOutcome::Gated => summary.gated += 1,
                IssueOutcome::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Complete,
    Incomplete,
}

/// Snapshot of the settings a run was started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub mode: RunMode,
    pub qa_gate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueOutcome {
    Passed,
    Failed,
    /// Verification failed and the chain paused at the QA gate.
    Gated,
    Skipped,
}

/// Everything one issue contributed to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRecord {
    pub issue_number: u64,
    pub title: String,
    pub outcome: IssueOutcome,
    /// Lifecycle status the issue was left in.
    pub status: IssueStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub phases: Vec<PhaseResult>,
    #[serde(with = "duration_secs")]
    pub total_duration: Duration,
    #[serde(default)]
    pub loop_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<std::path::PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    #[serde(default)]
    pub gated: usize,
    pub skipped: usize,
    #[serde(with = "duration_secs")]
    pub total_duration: Duration,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::phase::Phase;

    pub(crate) fn make_config() -> RunConfig {
        RunConfig {
            mode: RunMode::Sequential,
            qa_gate: false,
            base_branch: None,
            execution: ExecutionConfig::default(),
        }
    }

    fn record(number: u64, outcome: IssueOutcome, secs: u64) -> IssueRecord {
        let now = Utc::now();
        IssueRecord {
            issue_number: number,
            title: format!("Issue {number}"),
            outcome,
            status: IssueStatus::ReadyForMerge,
            started_at: now,
            ended_at: now,
            phases: vec![PhaseResult::succeeded(Phase::Exec, Duration::from_secs(secs))],
            total_duration: Duration::from_secs(secs),
            loop_iterations: 0,
            branch: None,
            worktree: None,
            pr_url: None,
        }
    }

    #[test]
    fn test_new_log_is_incomplete() {
        let log = RunLog::new(make_config(), Some("abc123".into()));
        assert_eq!(log.completion(), Completion::Incomplete);
        assert_eq!(log.run_id.to_string().len(), 36);
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let mut log = RunLog::new(make_config(), None);
        log.issues.push(record(1, IssueOutcome::Passed, 10));
        log.issues.push(record(2, IssueOutcome::Failed, 20));
        log.issues.push(record(3, IssueOutcome::Skipped, 0));
        log.issues.push(record(4, IssueOutcome::Gated, 0));
        let summary = log.compute_summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.gated, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total_duration, Duration::from_secs(30));
    }

    #[test]
    fn test_end_time_without_summary_is_incomplete() {
        let mut log = RunLog::new(make_config(), None);
        log.end_time = Some(Utc::now());
        assert_eq!(log.completion(), Completion::Incomplete);
        log.summary = Some(log.compute_summary());
        assert_eq!(log.completion(), Completion::Complete);
    }

    #[test]
    fn test_log_json_field_names() {
        let mut log = RunLog::new(make_config(), Some("abc".into()));
        log.issues.push(record(9, IssueOutcome::Passed, 5));
        let value = serde_json::to_value(&log).unwrap();
        assert!(value.get("runId").is_some());
        assert!(value.get("startCommit").is_some());
        assert!(value.get("endTime").is_none());
        assert_eq!(value["issues"][0]["issueNumber"], 9);
        assert_eq!(value["issues"][0]["phases"][0]["phase"], "exec");
    }
}
