//! Durable workflow state.
//!
//! One JSON file (`.sequant/state.json`) holds every tracked issue's lifecycle
//! status and per-phase status. [`StateManager`] owns all reads and writes;
//! [`maintenance`] rebuilds, discovers, cleans up and reconciles it.

pub mod maintenance;
pub mod store;

pub use maintenance::{
    CleanupOptions, CleanupReport, DiscoverReport, ReconcileReport, RebuildReport,
    cleanup_stale_entries, discover_untracked_worktrees, reconcile_state, rebuild_state_from_logs,
};
pub use store::StateManager;

use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Schema version written to and accepted from the state file.
pub const STATE_VERSION: u32 = 1;

/// Lifecycle of an issue.
///
/// `not_started → in_progress → {waiting_for_qa_gate | blocked | ready_for_merge} → merged`,
/// with `abandoned` reachable from any non-terminal state through cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    NotStarted,
    InProgress,
    WaitingForQaGate,
    Blocked,
    ReadyForMerge,
    Merged,
    Abandoned,
}

impl IssueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IssueStatus::Merged | IssueStatus::Abandoned)
    }

    /// Already-finished work that a run skips unless forced.
    pub fn is_done(&self) -> bool {
        matches!(self, IssueStatus::ReadyForMerge | IssueStatus::Merged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::NotStarted => "not_started",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::WaitingForQaGate => "waiting_for_qa_gate",
            IssueStatus::Blocked => "blocked",
            IssueStatus::ReadyForMerge => "ready_for_merge",
            IssueStatus::Merged => "merged",
            IssueStatus::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Merge-request reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueState {
    pub number: u64,
    pub title: String,
    pub status: IssueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Phase>,
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Branch this issue's branch was created from (chain mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrInfo>,
    pub last_activity: DateTime<Utc>,
}

impl IssueState {
    pub fn new(number: u64, title: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            status: IssueStatus::NotStarted,
            current_phase: None,
            phases: BTreeMap::new(),
            worktree: None,
            branch: None,
            base_branch: None,
            pr: None,
            last_activity: Utc::now(),
        }
    }

    /// Record a phase transition, keeping `current_phase` consistent: it is
    /// set exactly while its phase is `in_progress`.
    pub fn set_phase_status(&mut self, phase: Phase, status: PhaseStatus, error: Option<String>) {
        let now = Utc::now();
        let entry = self.phases.entry(phase).or_default();
        entry.status = status;
        match status {
            PhaseStatus::InProgress => {
                entry.started_at = Some(now);
                entry.completed_at = None;
                entry.error = None;
            }
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped => {
                entry.completed_at = Some(now);
                entry.error = error;
            }
            PhaseStatus::Pending => {
                entry.error = None;
            }
        }

        if status == PhaseStatus::InProgress {
            self.current_phase = Some(phase);
        } else if self.current_phase == Some(phase) {
            self.current_phase = None;
        }
        self.last_activity = now;
    }

    pub fn set_status(&mut self, status: IssueStatus) {
        self.status = status;
        if status != IssueStatus::InProgress {
            // A finished or paused issue has no running phase.
            if let Some(phase) = self.current_phase.take()
                && let Some(entry) = self.phases.get_mut(&phase)
                && entry.status == PhaseStatus::InProgress
            {
                entry.status = PhaseStatus::Pending;
            }
        }
        self.last_activity = Utc::now();
    }

    /// Check the `current_phase` invariant.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        match self.current_phase {
            Some(phase) => self
                .phases
                .get(&phase)
                .is_some_and(|p| p.status == PhaseStatus::InProgress),
            None => true,
        }
    }
}

/// The whole state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub issues: BTreeMap<String, IssueState>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_updated: Utc::now(),
            issues: BTreeMap::new(),
        }
    }
}

impl WorkflowState {
    pub fn key(number: u64) -> String {
        number.to_string()
    }

    pub fn issue(&self, number: u64) -> Option<&IssueState> {
        self.issues.get(&Self::key(number))
    }

    pub fn issue_mut(&mut self, number: u64) -> Option<&mut IssueState> {
        self.issues.get_mut(&Self::key(number))
    }

    /// Get or create the entry for an issue.
    pub fn ensure_issue(&mut self, number: u64, title: &str) -> &mut IssueState {
        let entry = self
            .issues
            .entry(Self::key(number))
            .or_insert_with(|| IssueState::new(number, title));
        if entry.title.is_empty() && !title.is_empty() {
            entry.title = title.to_string();
        }
        entry
    }

    /// Structural equality ignoring the `last_updated` stamp.
    #[cfg(test)]
    pub(crate) fn same_content(&self, other: &WorkflowState) -> bool {
        self.version == other.version && self.issues == other.issues
    }
}
