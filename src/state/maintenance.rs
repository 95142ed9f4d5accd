//! Recovery and housekeeping passes over the state file.
//!
//! Each pass is idempotent: running it twice with nothing changed in between
//! leaves the second run with nothing to do.

use super::{IssueState, IssueStatus, PhaseState, PhaseStatus, StateManager, WorkflowState};
use crate::audit::{self, Completion, IssueOutcome};
use crate::errors::StateError;
use crate::github::{MergeRequests, PrState};
use crate::phase::Phase;
use crate::worktree::IssueWorktree;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct RebuildReport {
    pub logs_processed: usize,
    pub issues_rebuilt: usize,
    /// Logs of runs that never finalized. Still replayed.
    pub incomplete_logs: Vec<PathBuf>,
    /// Logs that could not be read or parsed. Skipped.
    pub unreadable_logs: Vec<PathBuf>,
}

/// Reconstruct the state file from scratch by replaying every run log,
/// oldest run first by start time. Later records of an issue override
/// earlier ones. Skipped records carry no lifecycle change and are ignored.
pub fn rebuild_state_from_logs(manager: &StateManager, log_dir: &Path) -> Result<RebuildReport> {
    let mut report = RebuildReport::default();

    let mut logs = Vec::new();
    for path in audit::list_runs(log_dir)? {
        match audit::load_run(&path) {
            Ok(log) => logs.push((path, log)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run log");
                report.unreadable_logs.push(path);
            }
        }
    }
    // File names only resolve to the second.
    logs.sort_by(|(pa, a), (pb, b)| a.start_time.cmp(&b.start_time).then_with(|| pa.cmp(pb)));

    let mut rebuilt = WorkflowState::default();
    for (path, log) in logs {
        if log.completion() == Completion::Incomplete {
            tracing::warn!(path = %path.display(), "replaying incomplete run log");
            report.incomplete_logs.push(path.clone());
        }
        report.logs_processed += 1;

        for record in log.issues.iter().filter(|r| r.outcome != IssueOutcome::Skipped) {
            let issue = rebuilt.ensure_issue(record.issue_number, &record.title);
            if !record.title.is_empty() {
                issue.title = record.title.clone();
            }
            issue.status = record.status;
            issue.current_phase = None;
            for result in &record.phases {
                issue.phases.insert(
                    result.phase,
                    PhaseState {
                        status: if result.success {
                            PhaseStatus::Completed
                        } else {
                            PhaseStatus::Failed
                        },
                        started_at: None,
                        completed_at: Some(record.ended_at),
                        error: result.error.clone(),
                    },
                );
            }
            if record.branch.is_some() {
                issue.branch = record.branch.clone();
            }
            if record.worktree.is_some() {
                issue.worktree = record.worktree.clone();
            }
            issue.last_activity = record.ended_at;
        }
    }

    report.issues_rebuilt = rebuilt.issues.len();
    manager.save(&rebuilt)?;
    Ok(report)
}

#[derive(Debug, Default)]
pub struct DiscoverReport {
    pub added: Vec<u64>,
    pub already_tracked: usize,
}

/// Add issue worktrees that exist on disk but are missing from state.
///
/// The phase is inferred from the branch: commits ahead of trunk mean
/// implementation has started, otherwise planning is still pending.
pub fn discover_untracked_worktrees(
    manager: &StateManager,
    worktrees: &[IssueWorktree],
) -> Result<DiscoverReport, StateError> {
    manager.update(|state| {
        let mut report = DiscoverReport::default();
        for wt in worktrees {
            if state.issue(wt.issue).is_some() {
                report.already_tracked += 1;
                continue;
            }
            let mut issue = IssueState::new(wt.issue, title_from_branch(&wt.branch, wt.issue));
            issue.status = IssueStatus::InProgress;
            issue.worktree = Some(wt.path.clone());
            issue.branch = Some(wt.branch.clone());
            if wt.commits_ahead > 0 {
                issue.phases.insert(
                    Phase::Spec,
                    PhaseState {
                        status: PhaseStatus::Completed,
                        ..Default::default()
                    },
                );
                issue.phases.insert(Phase::Exec, PhaseState::default());
            } else {
                issue.phases.insert(Phase::Spec, PhaseState::default());
            }
            tracing::info!(
                issue = wt.issue,
                branch = %wt.branch,
                commits_ahead = wt.commits_ahead,
                "discovered untracked worktree"
            );
            state.issues.insert(WorkflowState::key(wt.issue), issue);
            report.added.push(wt.issue);
        }
        report
    })
}

/// `feature/12-add-login-form` → `add login form`.
fn title_from_branch(branch: &str, issue: u64) -> String {
    let tail = branch.rsplit('/').next().unwrap_or(branch);
    let prefix = format!("{issue}-");
    let slug = tail.strip_prefix(&prefix).unwrap_or(tail);
    slug.replace('-', " ")
}

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub dry_run: bool,
    /// Merged issues idle for longer than this are removed.
    pub max_age_days: i64,
    pub now: DateTime<Utc>,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_age_days: 7,
            now: Utc::now(),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct CleanupReport {
    /// Issues whose worktree vanished, flipped to `abandoned`.
    pub orphaned: Vec<u64>,
    /// Entries removed from state.
    pub removed: Vec<u64>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.orphaned.is_empty() && self.removed.is_empty()
    }
}

/// Two passes over state: issues whose worktree no longer exists become
/// `abandoned`, then entries that were already `abandoned` and `merged`
/// entries older than the retention age are removed. An orphan is therefore
/// dropped by the following call, not the one that found it.
pub fn cleanup_stale_entries(
    manager: &StateManager,
    options: &CleanupOptions,
) -> Result<CleanupReport, StateError> {
    let mut state = manager.load()?;
    let report = plan_cleanup(&mut state, options);
    if options.dry_run || report.is_empty() {
        return Ok(report);
    }

    manager.update(|current| {
        let applied = plan_cleanup(current, options);
        if applied != report {
            tracing::debug!("state changed during cleanup, applied fresh plan");
        }
        applied
    })
}

fn plan_cleanup(state: &mut WorkflowState, options: &CleanupOptions) -> CleanupReport {
    let mut report = CleanupReport::default();
    let cutoff = options.now - chrono::Duration::days(options.max_age_days);

    for issue in state.issues.values_mut() {
        if issue.status.is_terminal() {
            continue;
        }
        if let Some(path) = &issue.worktree
            && !path.exists()
        {
            tracing::info!(issue = issue.number, path = %path.display(), "worktree missing, marking abandoned");
            issue.set_status(IssueStatus::Abandoned);
            report.orphaned.push(issue.number);
        }
    }

    // Entries orphaned in this pass survive until the next one.
    state.issues.retain(|_, issue| {
        let remove = match issue.status {
            IssueStatus::Abandoned => !report.orphaned.contains(&issue.number),
            IssueStatus::Merged => issue.last_activity < cutoff,
            _ => false,
        };
        if remove {
            report.removed.push(issue.number);
        }
        !remove
    });
    report.orphaned.sort_unstable();
    report.removed.sort_unstable();
    report
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub merged: Vec<u64>,
    pub abandoned: Vec<u64>,
    pub checked: usize,
}

/// Advance `ready_for_merge` issues whose merge request has been closed.
///
/// A merged request moves the issue to `merged`; one closed without merging
/// moves it to `abandoned`. Lookup failures are logged and skipped.
pub async fn reconcile_state(
    manager: &StateManager,
    prs: &dyn MergeRequests,
) -> Result<ReconcileReport, StateError> {
    let mut report = ReconcileReport::default();
    let candidates: Vec<(u64, u64)> = manager
        .get_all_issue_states()?
        .into_iter()
        .filter(|i| i.status == IssueStatus::ReadyForMerge)
        .filter_map(|i| i.pr.map(|pr| (i.number, pr.number)))
        .collect();

    for (issue, pr) in candidates {
        report.checked += 1;
        let pr_state = match prs.state(pr).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(issue, pr, error = %e, "could not query merge request state");
                continue;
            }
        };
        let next = match pr_state {
            PrState::Open => continue,
            PrState::Merged => IssueStatus::Merged,
            PrState::Closed => IssueStatus::Abandoned,
        };
        manager.try_update(|state| {
            if let Some(entry) = state.issue_mut(issue)
                && entry.status == IssueStatus::ReadyForMerge
            {
                entry.set_status(next);
            }
            Ok(())
        })?;
        tracing::info!(issue, pr, status = %next, "reconciled issue with merge request");
        match next {
            IssueStatus::Merged => report.merged.push(issue),
            _ => report.abandoned.push(issue),
        }
    }
    Ok(report)
}
