//! The run loop: issues in order, phases in order, one at a time.

use super::shutdown::{CleanupHandle, ShutdownCoordinator};
use super::{RunMode, RunOutcome, RunPlan, RunSettings};
use crate::audit::{IssueOutcome, IssueRecord, RunConfig, RunLogWriter};
use crate::errors::{OrchestratorError, StateError};
use crate::github::{Issue, IssueTracker, MergeRequests, PrRef};
use crate::phase::{Phase, PhaseExecutor, PhaseResult};
use crate::planner::{PlanSource, determine_phases_for_issue, parse_recommendation, sort_by_dependencies};
use crate::state::{IssueState, IssueStatus, PhaseStatus, PrInfo, StateManager, reconcile_state};
use crate::util::format_duration;
use crate::worktree::{WorktreeInfo, WorktreeManager};
use chrono::Utc;
use console::style;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Collaborators of a run. Everything except the executor and the issue
/// tracker is optional; a missing subsystem is skipped with a warning.
pub struct RunContext {
    pub executor: PhaseExecutor,
    pub issues: Arc<dyn IssueTracker>,
    pub state: Option<StateManager>,
    pub worktrees: Option<WorktreeManager>,
    pub prs: Option<Arc<dyn MergeRequests>>,
    pub log_dir: Option<PathBuf>,
    pub shutdown: ShutdownCoordinator,
}

type SharedLog = Arc<Mutex<Option<RunLogWriter>>>;

pub struct Orchestrator {
    ctx: RunContext,
    settings: RunSettings,
    log: SharedLog,
    log_guard: Mutex<Option<CleanupHandle>>,
}

/// What running one issue produced.
struct IssueRun {
    record: IssueRecord,
    failed_phase: Option<Phase>,
    cancelled: bool,
    worktree: Option<WorktreeInfo>,
}

impl IssueRun {
    fn passed(&self) -> bool {
        self.failed_phase.is_none() && !self.cancelled
    }
}

impl Orchestrator {
    pub fn new(ctx: RunContext, settings: RunSettings) -> Result<Self, OrchestratorError> {
        if settings.qa_gate && settings.mode != RunMode::Chain {
            return Err(OrchestratorError::InvalidConfig(
                "the QA gate only applies to chain mode".into(),
            ));
        }
        if settings.execution.phases.as_ref().is_some_and(Vec::is_empty) {
            return Err(OrchestratorError::InvalidConfig(
                "phase list is empty".into(),
            ));
        }
        Ok(Self {
            ctx,
            settings,
            log: Arc::new(Mutex::new(None)),
            log_guard: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    fn dry_run(&self) -> bool {
        self.settings.execution.dry_run
    }

    pub async fn run(&self, plan: RunPlan) -> Result<RunOutcome, OrchestratorError> {
        if plan.issue_count() == 0 {
            return Err(OrchestratorError::InvalidConfig("no issues to run".into()));
        }
        let groups = match (self.settings.mode, plan) {
            (RunMode::Batch, RunPlan::Batches(groups)) => groups,
            (RunMode::Batch, RunPlan::Issues(_)) => {
                return Err(OrchestratorError::InvalidConfig(
                    "batch mode needs at least one batch".into(),
                ));
            }
            (_, RunPlan::Batches(_)) => {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "batches cannot be combined with {} mode",
                    self.settings.mode
                )));
            }
            (_, RunPlan::Issues(numbers)) => vec![numbers],
        };

        if self.dry_run() {
            println!(
                "{} dry run: phases are planned, nothing is executed",
                style("ℹ").cyan()
            );
        }

        self.reconcile().await;
        self.start_log();

        let mut outcome = RunOutcome {
            dry_run: self.dry_run(),
            ..Default::default()
        };

        let mut fetched = Vec::with_capacity(groups.len());
        for group in groups {
            fetched.push(sort_by_dependencies(self.fetch_all(&group).await));
        }

        match self.settings.mode {
            RunMode::Sequential => {
                let issues = fetched.into_iter().flatten().collect();
                self.run_list(issues, &mut outcome).await;
            }
            RunMode::Batch => self.run_batches(fetched, &mut outcome).await,
            RunMode::Chain => {
                let issues = fetched.into_iter().flatten().collect();
                self.run_chain(issues, &mut outcome).await;
            }
        }

        outcome.cancelled |= self.ctx.shutdown.is_shutting_down();
        outcome.log_path = self.finish_log();
        print_summary(&outcome);
        Ok(outcome)
    }

    async fn run_list(&self, issues: Vec<Issue>, outcome: &mut RunOutcome) -> bool {
        let mut queue: VecDeque<Issue> = issues.into();
        while let Some(issue) = queue.pop_front() {
            if self.ctx.shutdown.is_shutting_down() {
                queue.push_front(issue);
                self.skip_all(queue, "run cancelled", outcome);
                return true;
            }
            if self.preflight_skip(&issue, outcome).is_some() {
                continue;
            }

            let run = self
                .run_issue(&issue, self.settings.base_branch.as_deref(), self.settings.create_pr)
                .await;
            let passed = run.passed();
            let cancelled = run.cancelled;
            self.finish_issue(run, outcome);

            if cancelled {
                self.skip_all(queue, "run cancelled", outcome);
                return true;
            }
            if !passed && self.settings.execution.stops_on_failure() {
                if !queue.is_empty() {
                    println!(
                        "  {} stopping after failure of #{}",
                        style("■").red(),
                        issue.number
                    );
                }
                self.skip_all(queue, "stopped after failure", outcome);
                return true;
            }
        }
        false
    }

    async fn run_batches(&self, groups: Vec<Vec<Issue>>, outcome: &mut RunOutcome) {
        let total = groups.len();
        let mut groups: VecDeque<Vec<Issue>> = groups.into();
        let mut index = 0;
        while let Some(group) = groups.pop_front() {
            index += 1;
            println!(
                "\n{} batch {}/{}: {}",
                style("▣").cyan().bold(),
                index,
                total,
                group
                    .iter()
                    .map(|i| format!("#{}", i.number))
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            let failed_before = outcome.failed.len();
            let halted = self.run_list(group, outcome).await;
            let group_failed = outcome.failed.len() > failed_before;

            if halted || (group_failed && self.settings.execution.stops_on_failure()) {
                let reason = if self.ctx.shutdown.is_shutting_down() {
                    "run cancelled"
                } else {
                    "an earlier batch failed"
                };
                self.skip_all(groups.into_iter().flatten(), reason, outcome);
                return;
            }
        }
    }

    async fn run_chain(&self, issues: Vec<Issue>, outcome: &mut RunOutcome) {
        let mut base = self.settings.base_branch.clone();
        let mut completed: Vec<(Issue, WorktreeInfo)> = Vec::new();
        let mut queue: VecDeque<Issue> = issues.into();

        while let Some(issue) = queue.pop_front() {
            if self.ctx.shutdown.is_shutting_down() {
                queue.push_front(issue);
                self.skip_all(queue, "run cancelled", outcome);
                break;
            }
            if let Some(tracked) = self.preflight_skip(&issue, outcome) {
                // The chain continues from the skipped issue's branch.
                if let Some(branch) = tracked.branch {
                    base = Some(branch);
                }
                continue;
            }

            let run = self.run_issue(&issue, base.as_deref(), false).await;
            let number = issue.number;
            let passed = run.passed();
            let failed_phase = run.failed_phase;
            let cancelled = run.cancelled;
            let worktree = run.worktree.clone();
            self.finish_issue(run, outcome);

            if passed {
                match worktree {
                    Some(wt) => {
                        self.checkpoint(&wt);
                        base = Some(wt.branch.clone());
                        completed.push((issue, wt));
                    }
                    None => base = Some(WorktreeManager::branch_name(number, &issue.title)),
                }
                continue;
            }

            if cancelled {
                self.skip_all(queue, "run cancelled", outcome);
                break;
            }
            if self.gate_applies(failed_phase) {
                println!(
                    "  {} chain paused at #{}: waiting for the QA gate",
                    style("⏸").yellow(),
                    number
                );
                tracing::info!(issue = number, "chain paused by QA gate");
                self.skip_all(queue, "chain paused at QA gate", outcome);
            } else {
                println!("  {} chain stopped at #{}", style("■").red(), number);
                self.skip_all(queue, "chain stopped", outcome);
            }
            break;
        }

        if self.settings.create_pr && !completed.is_empty() && !self.dry_run() {
            self.open_stacked_prs(&completed).await;
        }
    }

    fn gate_applies(&self, failed_phase: Option<Phase>) -> bool {
        self.settings.mode == RunMode::Chain
            && self.settings.qa_gate
            && failed_phase.is_some_and(|p| p.is_verification())
    }

    async fn run_issue(&self, issue: &Issue, base: Option<&str>, open_pr: bool) -> IssueRun {
        let number = issue.number;
        let started_at = Utc::now();
        let clock = Instant::now();
        println!(
            "\n{} #{} {}",
            style("▶").cyan().bold(),
            number,
            style(&issue.title).bold()
        );
        tracing::info!(issue = number, title = %issue.title, "starting issue");

        self.record_state("initialize issue", |s| {
            s.initialize_issue(number, &issue.title)?;
            s.update_issue_status(number, IssueStatus::InProgress)
        });

        let (worktree, mut discard) = match self.acquire_worktree(issue, base).await {
            Some((info, handle)) => (Some(info), handle),
            None => (None, None),
        };
        let working_dir = worktree.as_ref().map(|w| w.path.clone());

        let plan = determine_phases_for_issue(issue, &self.settings.execution);
        let mut quality_loop = plan.quality_loop;
        println!(
            "  {} {}{}",
            style("phases:").dim(),
            join_phases(&plan.phases),
            if quality_loop { " (quality loop)" } else { "" }
        );

        let mut phases: VecDeque<Phase> = plan.phases.into();
        let mut results: Vec<PhaseResult> = Vec::new();
        let mut failed_phase = None;
        let mut cancelled = false;
        let mut loop_iterations = 0;

        while let Some(phase) = phases.pop_front() {
            if self.ctx.executor.is_cancelled() {
                cancelled = true;
                break;
            }
            if let Some(handle) = discard.take() {
                handle.disarm();
            }

            let result = self.run_phase(number, phase, working_dir.clone()).await;
            let mut passed = result.success;

            if passed
                && phase == Phase::Spec
                && plan.source == PlanSource::Labels
                && let Some(rec) = parse_recommendation(&result.output)
            {
                let remaining: Vec<Phase> =
                    rec.phases.into_iter().filter(|p| *p != Phase::Spec).collect();
                if !remaining.is_empty() {
                    println!(
                        "  {} following recommended workflow: {}",
                        style("↳").cyan(),
                        join_phases(&remaining)
                    );
                    tracing::info!(issue = number, phases = %join_phases(&remaining), "recommended workflow applied");
                    phases = remaining.into();
                }
                if let Some(enabled) = rec.quality_loop {
                    quality_loop = enabled;
                }
            }
            results.push(result);

            if !passed && self.ctx.executor.is_cancelled() {
                cancelled = true;
                break;
            }
            if !passed && quality_loop && phase.is_verification() {
                let (recovered, iterations) = self
                    .quality_loop(number, phase, working_dir.clone(), &mut results)
                    .await;
                loop_iterations = iterations;
                passed = recovered;
                if !passed && self.ctx.executor.is_cancelled() {
                    cancelled = true;
                    break;
                }
            }
            if !passed {
                failed_phase = Some(phase);
                break;
            }
        }

        let status = if cancelled {
            IssueStatus::InProgress
        } else if failed_phase.is_none() {
            IssueStatus::ReadyForMerge
        } else if self.gate_applies(failed_phase) {
            IssueStatus::WaitingForQaGate
        } else {
            IssueStatus::Blocked
        };
        if !cancelled {
            self.record_state("update issue status", |s| s.update_issue_status(number, status));
        } else {
            println!(
                "  {} #{} interrupted, left in progress",
                style("!").yellow(),
                number
            );
        }

        let mut pr_url = None;
        if open_pr
            && failed_phase.is_none()
            && !cancelled
            && !self.dry_run()
            && let Some(wt) = worktree.as_ref()
        {
            let base = wt
                .base_branch
                .as_deref()
                .map(|b| b.strip_prefix("origin/").unwrap_or(b).to_string())
                .or_else(|| self.ctx.worktrees.as_ref().map(|m| m.trunk().to_string()));
            if let Some(base) = base {
                pr_url = self.open_pr(issue, wt, &base).await.map(|pr| pr.url);
            }
        }

        let outcome = if cancelled {
            IssueOutcome::Failed
        } else if failed_phase.is_none() {
            IssueOutcome::Passed
        } else if status == IssueStatus::WaitingForQaGate {
            IssueOutcome::Gated
        } else {
            IssueOutcome::Failed
        };
        let record = IssueRecord {
            issue_number: number,
            title: issue.title.clone(),
            outcome,
            status,
            started_at,
            ended_at: Utc::now(),
            phases: results,
            total_duration: clock.elapsed(),
            loop_iterations,
            branch: worktree.as_ref().map(|w| w.branch.clone()),
            worktree: worktree.as_ref().map(|w| w.path.clone()),
            pr_url,
        };

        if self.settings.comment_on_issues && !self.dry_run() && !cancelled {
            self.post_comment(&record).await;
        }

        IssueRun {
            record,
            failed_phase,
            cancelled,
            worktree,
        }
    }

    async fn run_phase(&self, number: u64, phase: Phase, working_dir: Option<PathBuf>) -> PhaseResult {
        self.record_state("phase start", |s| {
            s.update_phase_status(number, phase, PhaseStatus::InProgress, None)
        });
        println!("  {} {}", style("→").dim(), phase);

        let result = self
            .ctx
            .executor
            .execute_phase_with_retry(number, phase, &self.settings.execution, working_dir)
            .await;

        if result.success {
            println!(
                "  {} {} ({})",
                style("✓").green(),
                phase,
                format_duration(result.duration.as_secs_f64())
            );
        } else {
            println!(
                "  {} {} failed: {}",
                style("✗").red(),
                phase,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        tracing::info!(
            issue = number,
            phase = %phase,
            success = result.success,
            attempts = result.attempts,
            duration_secs = result.duration.as_secs(),
            "phase finished"
        );

        let status = if result.success {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };
        let error = result.error.clone();
        self.record_state("phase result", |s| {
            s.update_phase_status(number, phase, status, error)
        });
        result
    }

    /// Alternate fix rounds with re-runs of the failed phase until it passes
    /// or the iteration cap is hit.
    async fn quality_loop(
        &self,
        number: u64,
        failed: Phase,
        working_dir: Option<PathBuf>,
        results: &mut Vec<PhaseResult>,
    ) -> (bool, u32) {
        let max = self.settings.execution.max_iterations;
        let mut iterations = 0;
        while iterations < max {
            if self.ctx.executor.is_cancelled() {
                break;
            }
            iterations += 1;
            println!(
                "  {} quality loop {}/{} after {} failure",
                style("↻").yellow(),
                iterations,
                max,
                failed
            );
            tracing::info!(issue = number, phase = %failed, iteration = iterations, "quality loop iteration");

            let fix = self.run_phase(number, Phase::Loop, working_dir.clone()).await;
            let fixed = fix.success;
            results.push(fix);
            if !fixed {
                tracing::warn!(issue = number, iteration = iterations, "loop phase failed");
                continue;
            }

            let rerun = self.run_phase(number, failed, working_dir.clone()).await;
            let passed = rerun.success;
            results.push(rerun);
            if passed {
                return (true, iterations);
            }
        }
        if iterations == max {
            println!(
                "  {} quality loop exhausted after {} iteration(s)",
                style("!").yellow(),
                iterations
            );
        }
        (false, iterations)
    }

    fn finish_issue(&self, run: IssueRun, outcome: &mut RunOutcome) {
        let number = run.record.issue_number;
        if run.passed() {
            outcome.passed.push(number);
        } else if !run.cancelled && self.gate_applies(run.failed_phase) {
            outcome.gated = Some(number);
        } else {
            outcome.failed.push(number);
        }
        self.append_record(run.record);
    }

    /// Issues already ready for merge or merged are skipped unless forced.
    fn preflight_skip(&self, issue: &Issue, outcome: &mut RunOutcome) -> Option<IssueState> {
        if self.settings.force {
            return None;
        }
        let tracked = self.tracked(issue.number)?;
        if !tracked.status.is_done() {
            return None;
        }
        println!(
            "  {} #{} is already {}, skipping (use --force to run it again)",
            style("↷").dim(),
            issue.number,
            tracked.status
        );
        tracing::info!(issue = issue.number, status = %tracked.status, "skipped by preflight");
        outcome.skipped.push(issue.number);
        self.append_record(skipped_record(issue, tracked.status));
        Some(tracked)
    }

    fn skip_all(&self, issues: impl IntoIterator<Item = Issue>, reason: &str, outcome: &mut RunOutcome) {
        for issue in issues {
            println!("  {} #{} skipped: {}", style("↷").dim(), issue.number, reason);
            tracing::info!(issue = issue.number, reason, "issue skipped");
            outcome.skipped.push(issue.number);
            let status = self
                .tracked(issue.number)
                .map(|t| t.status)
                .unwrap_or_default();
            self.append_record(skipped_record(&issue, status));
        }
    }

    async fn fetch_all(&self, numbers: &[u64]) -> Vec<Issue> {
        let mut issues = Vec::with_capacity(numbers.len());
        for &number in numbers {
            match self.ctx.issues.fetch_issue(number).await {
                Ok(issue) => issues.push(issue),
                Err(e) => {
                    let title = self
                        .tracked(number)
                        .map(|t| t.title)
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| format!("Issue #{number}"));
                    println!(
                        "  {} could not fetch #{} ({:#}), continuing without labels",
                        style("!").yellow(),
                        number,
                        e
                    );
                    tracing::warn!(issue = number, error = %e, "issue fetch failed");
                    issues.push(Issue {
                        number,
                        title,
                        labels: Vec::new(),
                        body: String::new(),
                    });
                }
            }
        }
        issues
    }

    async fn reconcile(&self) {
        if self.dry_run() {
            return;
        }
        let (Some(state), Some(prs)) = (self.ctx.state.as_ref(), self.ctx.prs.as_ref()) else {
            return;
        };
        match reconcile_state(state, prs.as_ref()).await {
            Ok(report) => {
                for number in &report.merged {
                    println!("  {} #{} was merged", style("✓").green(), number);
                }
                for number in &report.abandoned {
                    println!(
                        "  {} #{} merge request closed, marked abandoned",
                        style("!").yellow(),
                        number
                    );
                }
            }
            Err(e) => warn_degraded("state reconciliation", &e),
        }
    }

    async fn acquire_worktree(
        &self,
        issue: &Issue,
        base: Option<&str>,
    ) -> Option<(WorktreeInfo, Option<CleanupHandle>)> {
        if self.dry_run() {
            return None;
        }
        let manager = self.ctx.worktrees.as_ref()?;
        let number = issue.number;
        match manager.ensure_worktree(number, &issue.title, base).await {
            Ok(info) => {
                self.record_state("worktree info", |s| {
                    s.update_worktree_info(number, &info.path, &info.branch, info.base_branch.as_deref())
                });
                let handle = (!info.existed).then(|| {
                    let manager = manager.clone();
                    self.ctx
                        .shutdown
                        .register(format!("discard worktree for #{number}"), move || async move {
                            manager
                                .remove_stale_worktree(number)
                                .await
                                .map(|_| ())
                                .map_err(anyhow::Error::from)
                        })
                });
                Some((info, handle))
            }
            Err(e) => {
                println!(
                    "  {} no worktree for #{} ({}), running in the repository",
                    style("!").yellow(),
                    number,
                    e
                );
                tracing::warn!(issue = number, error = %e, "worktree unavailable");
                None
            }
        }
    }

    fn checkpoint(&self, wt: &WorktreeInfo) {
        if self.dry_run() {
            return;
        }
        let Some(manager) = self.ctx.worktrees.as_ref() else {
            return;
        };
        match manager.checkpoint(&wt.path, wt.issue) {
            Ok(Some(sha)) => {
                println!(
                    "  {} checkpoint {} on {}",
                    style("●").dim(),
                    &sha[..sha.len().min(8)],
                    wt.branch
                );
                tracing::info!(issue = wt.issue, sha = %sha, "checkpoint committed");
            }
            Ok(None) => tracing::debug!(issue = wt.issue, "nothing to checkpoint"),
            Err(e) => warn_degraded("checkpoint commit", &e),
        }
    }

    async fn open_pr(&self, issue: &Issue, wt: &WorktreeInfo, base: &str) -> Option<PrRef> {
        let (manager, prs) = (self.ctx.worktrees.as_ref()?, self.ctx.prs.as_ref()?);
        let body = format!("Closes #{}\n\nOpened by sequant.", issue.number);
        match manager
            .create_pr(prs.as_ref(), &wt.path, &wt.branch, base, &issue.title, &body)
            .await
        {
            Ok(pr) => {
                println!(
                    "  {} merge request #{} {}",
                    style("✓").green(),
                    pr.number,
                    style(&pr.url).dim()
                );
                let info = PrInfo {
                    number: pr.number,
                    url: pr.url.clone(),
                };
                self.record_state("merge request info", |s| s.update_pr_info(issue.number, info));
                Some(pr)
            }
            Err(e) => {
                warn_degraded("merge request creation", &e);
                None
            }
        }
    }

    /// One merge request per chained issue, each based on its predecessor.
    async fn open_stacked_prs(&self, completed: &[(Issue, WorktreeInfo)]) {
        let Some(trunk) = self.ctx.worktrees.as_ref().map(|m| m.trunk().to_string()) else {
            return;
        };
        println!("\n{} opening stacked merge requests", style("⇡").cyan().bold());
        let mut base = self.settings.base_branch.clone().unwrap_or(trunk);
        for (issue, wt) in completed {
            self.open_pr(issue, wt, &base).await;
            base = wt.branch.clone();
        }
    }

    async fn post_comment(&self, record: &IssueRecord) {
        let phases = record
            .phases
            .iter()
            .map(|p| format!("{} {}", if p.success { "✓" } else { "✗" }, p.phase))
            .collect::<Vec<_>>()
            .join(", ");
        let body = format!(
            "sequant: **{}** after {} ({})",
            record.status,
            format_duration(record.total_duration.as_secs_f64()),
            phases
        );
        if let Err(e) = self.ctx.issues.comment(record.issue_number, &body).await {
            println!(
                "  {} could not comment on #{}: {:#}",
                style("!").yellow(),
                record.issue_number,
                e
            );
            tracing::warn!(issue = record.issue_number, error = %e, "issue comment failed");
        }
    }

    fn tracked(&self, number: u64) -> Option<IssueState> {
        let state = self.ctx.state.as_ref()?;
        match state.get_issue_state(number) {
            Ok(tracked) => tracked,
            Err(e) => {
                warn_degraded("state read", &e);
                None
            }
        }
    }

    /// Apply a state write; failures degrade to a warning.
    fn record_state<T>(
        &self,
        what: &str,
        f: impl FnOnce(&StateManager) -> Result<T, StateError>,
    ) -> Option<T> {
        if self.dry_run() {
            return None;
        }
        let state = self.ctx.state.as_ref()?;
        match f(state) {
            Ok(v) => Some(v),
            Err(e) => {
                warn_degraded(what, &e);
                None
            }
        }
    }

    fn start_log(&self) {
        if self.dry_run() {
            return;
        }
        let Some(dir) = self.ctx.log_dir.as_ref() else {
            return;
        };
        let config = RunConfig {
            mode: self.settings.mode,
            qa_gate: self.settings.qa_gate,
            base_branch: self.settings.base_branch.clone(),
            execution: self.settings.execution.clone(),
        };
        let start_commit = self.ctx.worktrees.as_ref().and_then(|m| m.head_sha());
        match RunLogWriter::start(dir, config, start_commit) {
            Ok(writer) => {
                tracing::info!(path = %writer.path().display(), run_id = %writer.log().run_id, "run log started");
                if let Ok(mut log) = self.log.lock() {
                    *log = Some(writer);
                }
                let shared = Arc::clone(&self.log);
                let handle = self.ctx.shutdown.register("finalize run log", move || {
                    let result = finalize_shared(&shared, None).map(|_| ());
                    async move { result }
                });
                if let Ok(mut guard) = self.log_guard.lock() {
                    *guard = Some(handle);
                }
            }
            Err(e) => warn_degraded("run log", &e),
        }
    }

    fn append_record(&self, record: IssueRecord) {
        let Ok(mut guard) = self.log.lock() else {
            return;
        };
        if let Some(writer) = guard.as_mut()
            && let Err(e) = writer.record_issue(record)
        {
            warn_degraded("run log write", &e);
        }
    }

    fn finish_log(&self) -> Option<PathBuf> {
        if let Some(handle) = self.log_guard.lock().ok().and_then(|mut g| g.take()) {
            handle.disarm();
        }
        let end_commit = self.ctx.worktrees.as_ref().and_then(|m| m.head_sha());
        match finalize_shared(&self.log, end_commit) {
            Ok(path) => path,
            Err(e) => {
                warn_degraded("run log finalize", &e);
                None
            }
        }
    }
}

fn finalize_shared(log: &SharedLog, end_commit: Option<String>) -> anyhow::Result<Option<PathBuf>> {
    let mut guard = log
        .lock()
        .map_err(|_| anyhow::anyhow!("run log lock poisoned"))?;
    match guard.as_mut() {
        Some(writer) if !writer.is_finalized() => Ok(Some(writer.finalize(end_commit)?)),
        Some(writer) => Ok(Some(writer.path().to_path_buf())),
        None => Ok(None),
    }
}

fn skipped_record(issue: &Issue, status: IssueStatus) -> IssueRecord {
    let now = Utc::now();
    IssueRecord {
        issue_number: issue.number,
        title: issue.title.clone(),
        outcome: IssueOutcome::Skipped,
        status,
        started_at: now,
        ended_at: now,
        phases: Vec::new(),
        total_duration: Duration::ZERO,
        loop_iterations: 0,
        branch: None,
        worktree: None,
        pr_url: None,
    }
}

fn warn_degraded(what: &str, err: &dyn std::fmt::Display) {
    println!(
        "  {} {} failed, continuing without it: {}",
        style("⚠").yellow(),
        what,
        err
    );
    tracing::warn!(subsystem = what, error = %err, "degraded");
}

fn join_phases(phases: &[Phase]) -> String {
    phases
        .iter()
        .map(Phase::as_str)
        .collect::<Vec<_>>()
        .join(" → ")
}

fn print_summary(outcome: &RunOutcome) {
    println!();
    println!("{}", style("═".repeat(60)).cyan());
    let headline = if outcome.cancelled {
        style("CANCELLED").yellow().bold()
    } else if outcome.failed.is_empty() {
        style("COMPLETE").green().bold()
    } else {
        style("FAILED").red().bold()
    };
    println!("Run {}", headline);
    println!("{}", style("═".repeat(60)).cyan());
    println!(
        "  passed: {}  failed: {}  skipped: {}",
        style(outcome.passed.len()).green().bold(),
        style(outcome.failed.len()).red().bold(),
        outcome.skipped.len()
    );
    if let Some(gated) = outcome.gated {
        println!("  waiting for QA gate: #{}", gated);
    }
    if let Some(path) = &outcome.log_path {
        println!("  log: {}", style(path.display()).dim());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Completion, list_runs, load_run};
    use crate::phase::executor::testing::{ScriptedRunner, fail, ok};
    use crate::phase::{
        AgentOutput, ExecutionConfig, FailurePolicy, PhaseInvocation, PhaseRunner, RetryPolicy,
    };
    use crate::tracker::GitTracker;
    use crate::tracker::git::tests::{commit_file, init_repo};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::{TempDir, tempdir};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeTracker {
        issues: HashMap<u64, Issue>,
        comments: Mutex<Vec<(u64, String)>>,
    }

    impl FakeTracker {
        fn with(issues: Vec<Issue>) -> Self {
            Self {
                issues: issues.into_iter().map(|i| (i.number, i)).collect(),
                comments: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IssueTracker for FakeTracker {
        async fn fetch_issue(&self, number: u64) -> anyhow::Result<Issue> {
            self.issues
                .get(&number)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("issue not found"))
        }

        async fn comment(&self, number: u64, body: &str) -> anyhow::Result<()> {
            self.comments.lock().unwrap().push((number, body.to_string()));
            Ok(())
        }
    }

    fn issue(number: u64, body: &str, labels: &[&str]) -> Issue {
        Issue {
            number,
            title: format!("Issue {number}"),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            body: body.to_string(),
        }
    }

    struct Harness {
        dir: TempDir,
        runner: Arc<ScriptedRunner>,
        tracker: Arc<FakeTracker>,
        shutdown: ShutdownCoordinator,
    }

    impl Harness {
        fn new(script: Vec<AgentOutput>, issues: Vec<Issue>) -> Self {
            Self {
                dir: tempdir().unwrap(),
                runner: Arc::new(ScriptedRunner::new(script)),
                tracker: Arc::new(FakeTracker::with(issues)),
                shutdown: ShutdownCoordinator::new(),
            }
        }

        fn state(&self) -> StateManager {
            StateManager::new(self.dir.path().join(".sequant/state.json"))
        }

        fn log_dir(&self) -> PathBuf {
            self.dir.path().join(".sequant/logs")
        }

        fn orchestrator(&self, settings: RunSettings) -> Orchestrator {
            let executor = PhaseExecutor::new(self.runner.clone(), self.shutdown.token())
                .with_policy(RetryPolicy {
                    retry_delay: Duration::ZERO,
                    ..Default::default()
                });
            let ctx = RunContext {
                executor,
                issues: self.tracker.clone(),
                state: Some(self.state()),
                worktrees: None,
                prs: None,
                log_dir: Some(self.log_dir()),
                shutdown: self.shutdown.clone(),
            };
            Orchestrator::new(ctx, settings).unwrap()
        }

        fn called(&self) -> Vec<(u64, Phase)> {
            self.runner
                .calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| (c.issue, c.phase))
                .collect()
        }

        fn status(&self, number: u64) -> IssueStatus {
            self.state().get_issue_state(number).unwrap().unwrap().status
        }
    }

    fn settings(mode: RunMode, policy: FailurePolicy, phases: &[Phase]) -> RunSettings {
        RunSettings {
            mode,
            execution: ExecutionConfig {
                phases: Some(phases.to_vec()),
                failure_policy: policy,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stop_on_failure_skips_remaining_issues() {
        let h = Harness::new(
            vec![ok(120, ""), fail(120, "boom")],
            vec![issue(1, "", &[]), issue(2, "", &[])],
        );
        let orch = h.orchestrator(settings(
            RunMode::Sequential,
            FailurePolicy::StopOnFailure,
            &[Phase::Spec, Phase::Exec],
        ));
        let outcome = orch.run(RunPlan::Issues(vec![1, 2])).await.unwrap();

        assert_eq!(outcome.failed, vec![1]);
        assert_eq!(outcome.skipped, vec![2]);
        assert_eq!(outcome.exit_code(), 1);
        // Genuine failure: exactly one exec invocation.
        assert_eq!(h.called(), vec![(1, Phase::Spec), (1, Phase::Exec)]);
        assert_eq!(h.status(1), IssueStatus::Blocked);
        assert!(h.state().get_issue_state(2).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rebuild_after_stopped_run_matches_live_state() {
        let h = Harness::new(
            vec![fail(120, "boom")],
            vec![issue(1, "", &[]), issue(2, "", &[])],
        );
        let orch = h.orchestrator(settings(
            RunMode::Sequential,
            FailurePolicy::StopOnFailure,
            &[Phase::Exec],
        ));
        orch.run(RunPlan::Issues(vec![1, 2])).await.unwrap();

        let live = h.state().load().unwrap();
        let rebuilt_mgr = StateManager::new(h.dir.path().join("rebuilt/state.json"));
        crate::state::rebuild_state_from_logs(&rebuilt_mgr, &h.log_dir()).unwrap();
        let rebuilt = rebuilt_mgr.load().unwrap();

        assert_eq!(
            rebuilt.issues.keys().collect::<Vec<_>>(),
            live.issues.keys().collect::<Vec<_>>()
        );
        assert_eq!(rebuilt.issue(1).unwrap().status, IssueStatus::Blocked);
        assert!(rebuilt.issue(2).is_none());
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_every_issue() {
        let h = Harness::new(
            vec![fail(120, "boom")],
            vec![issue(1, "", &[]), issue(2, "", &[])],
        );
        let orch = h.orchestrator(settings(
            RunMode::Sequential,
            FailurePolicy::ContinueOnFailure,
            &[Phase::Exec],
        ));
        let outcome = orch.run(RunPlan::Issues(vec![1, 2])).await.unwrap();

        assert_eq!(outcome.failed, vec![1]);
        assert_eq!(outcome.passed, vec![2]);
        assert_eq!(h.status(2), IssueStatus::ReadyForMerge);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_dependencies_reorder_issues() {
        let h = Harness::new(
            vec![],
            vec![issue(1, "Depends on #2", &[]), issue(2, "", &[])],
        );
        let orch = h.orchestrator(settings(
            RunMode::Sequential,
            FailurePolicy::default(),
            &[Phase::Exec],
        ));
        orch.run(RunPlan::Issues(vec![1, 2])).await.unwrap();
        assert_eq!(h.called(), vec![(2, Phase::Exec), (1, Phase::Exec)]);
    }

    #[tokio::test]
    async fn test_preflight_skips_done_issues_unless_forced() {
        let h = Harness::new(vec![], vec![issue(1, "", &[]), issue(2, "", &[])]);
        h.state().initialize_issue(1, "Issue 1").unwrap();
        h.state()
            .update_issue_status(1, IssueStatus::ReadyForMerge)
            .unwrap();

        let s = settings(RunMode::Sequential, FailurePolicy::default(), &[Phase::Exec]);
        let outcome = h
            .orchestrator(s.clone())
            .run(RunPlan::Issues(vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(outcome.skipped, vec![1]);
        assert_eq!(outcome.passed, vec![2]);
        assert_eq!(h.called(), vec![(2, Phase::Exec)]);

        let forced = RunSettings { force: true, ..s };
        let outcome = h
            .orchestrator(forced)
            .run(RunPlan::Issues(vec![1]))
            .await
            .unwrap();
        assert_eq!(outcome.passed, vec![1]);
    }

    #[tokio::test]
    async fn test_quality_loop_repairs_failed_qa() {
        let h = Harness::new(
            vec![
                ok(120, ""),
                ok(120, "### Verdict: AC_NOT_MET"),
                ok(120, "fixed"),
                ok(120, "**Verdict:** READY_FOR_MERGE"),
            ],
            vec![issue(1, "", &[])],
        );
        let mut s = settings(RunMode::Sequential, FailurePolicy::default(), &[Phase::Exec, Phase::Qa]);
        s.execution.quality_loop = true;
        let outcome = h.orchestrator(s).run(RunPlan::Issues(vec![1])).await.unwrap();

        assert_eq!(outcome.passed, vec![1]);
        assert_eq!(
            h.called(),
            vec![(1, Phase::Exec), (1, Phase::Qa), (1, Phase::Loop), (1, Phase::Qa)]
        );
        let log = load_run(&outcome.log_path.unwrap()).unwrap();
        assert_eq!(log.issues[0].loop_iterations, 1);
        assert_eq!(log.issues[0].phases.len(), 4);
    }

    #[tokio::test]
    async fn test_quality_loop_gives_up_after_cap() {
        let failing_qa = || ok(120, "Verdict: AC_NOT_MET");
        let h = Harness::new(
            vec![failing_qa(), ok(120, ""), failing_qa(), ok(120, ""), failing_qa()],
            vec![issue(1, "", &[])],
        );
        let mut s = settings(RunMode::Sequential, FailurePolicy::default(), &[Phase::Qa]);
        s.execution.quality_loop = true;
        s.execution.max_iterations = 2;
        let outcome = h.orchestrator(s).run(RunPlan::Issues(vec![1])).await.unwrap();

        assert_eq!(outcome.failed, vec![1]);
        assert_eq!(h.runner.call_count(), 5);
        assert_eq!(h.status(1), IssueStatus::Blocked);
    }

    #[tokio::test]
    async fn test_spec_recommendation_replaces_remaining_phases() {
        let h = Harness::new(
            vec![ok(120, "## Recommended Workflow\n**Phases:** spec → exec → test → qa\n")],
            vec![issue(1, "", &[])],
        );
        let s = RunSettings::default();
        h.orchestrator(s).run(RunPlan::Issues(vec![1])).await.unwrap();
        assert_eq!(
            h.called(),
            vec![(1, Phase::Spec), (1, Phase::Exec), (1, Phase::Test), (1, Phase::Qa)]
        );
    }

    #[tokio::test]
    async fn test_label_planning_skips_spec_for_bugs() {
        let h = Harness::new(vec![], vec![issue(1, "", &["bug"])]);
        h.orchestrator(RunSettings::default())
            .run(RunPlan::Issues(vec![1]))
            .await
            .unwrap();
        assert_eq!(h.called(), vec![(1, Phase::Exec), (1, Phase::Qa)]);
    }

    #[tokio::test]
    async fn test_chain_qa_gate_pauses_on_verification_failure() {
        let h = Harness::new(
            vec![ok(120, ""), ok(120, ""), ok(120, ""), ok(120, "Verdict: AC_NOT_MET")],
            vec![issue(1, "", &[]), issue(2, "", &[]), issue(3, "", &[])],
        );
        let mut s = settings(RunMode::Chain, FailurePolicy::default(), &[Phase::Exec, Phase::Qa]);
        s.qa_gate = true;
        let outcome = h.orchestrator(s).run(RunPlan::Issues(vec![1, 2, 3])).await.unwrap();

        assert_eq!(outcome.passed, vec![1]);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.gated, Some(2));
        assert_eq!(outcome.skipped, vec![3]);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(h.status(2), IssueStatus::WaitingForQaGate);

        let log = load_run(outcome.log_path.as_ref().unwrap()).unwrap();
        let summary = log.summary.unwrap();
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.gated, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(log.issues[1].outcome, IssueOutcome::Gated);
    }

    #[tokio::test]
    async fn test_chain_non_verification_failure_blocks() {
        let h = Harness::new(
            vec![fail(120, "compile error")],
            vec![issue(1, "", &[]), issue(2, "", &[])],
        );
        let mut s = settings(RunMode::Chain, FailurePolicy::default(), &[Phase::Exec, Phase::Qa]);
        s.qa_gate = true;
        let outcome = h.orchestrator(s).run(RunPlan::Issues(vec![1, 2])).await.unwrap();

        assert_eq!(outcome.gated, None);
        assert_eq!(outcome.failed, vec![1]);
        assert_eq!(outcome.skipped, vec![2]);
        assert_eq!(h.status(1), IssueStatus::Blocked);
    }

    #[tokio::test]
    async fn test_batch_failure_halts_later_batches() {
        let h = Harness::new(
            vec![fail(120, "boom")],
            vec![issue(1, "", &[]), issue(2, "", &[]), issue(3, "", &[])],
        );
        let s = settings(RunMode::Batch, FailurePolicy::StopOnFailure, &[Phase::Exec]);
        let outcome = h
            .orchestrator(s)
            .run(RunPlan::Batches(vec![vec![1], vec![2, 3]]))
            .await
            .unwrap();
        assert_eq!(outcome.failed, vec![1]);
        assert_eq!(outcome.skipped, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_batch_continue_runs_all_groups() {
        let h = Harness::new(
            vec![fail(120, "boom")],
            vec![issue(1, "", &[]), issue(2, "", &[]), issue(3, "", &[])],
        );
        let s = settings(RunMode::Batch, FailurePolicy::ContinueOnFailure, &[Phase::Exec]);
        let outcome = h
            .orchestrator(s)
            .run(RunPlan::Batches(vec![vec![1], vec![2, 3]]))
            .await
            .unwrap();
        assert_eq!(outcome.passed, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let h = Harness::new(vec![], vec![issue(1, "", &[])]);
        let mut s = RunSettings::default();
        s.execution.dry_run = true;
        let outcome = h.orchestrator(s).run(RunPlan::Issues(vec![1])).await.unwrap();

        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(h.runner.call_count(), 0);
        assert!(!h.state().path().exists());
        assert!(list_runs(&h.log_dir()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_log_is_complete_with_records() {
        let h = Harness::new(vec![], vec![issue(1, "", &[]), issue(2, "", &[])]);
        let s = settings(RunMode::Sequential, FailurePolicy::default(), &[Phase::Exec]);
        let outcome = h.orchestrator(s).run(RunPlan::Issues(vec![1, 2])).await.unwrap();

        let runs = list_runs(&h.log_dir()).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(Some(&runs[0]), outcome.log_path.as_ref());
        let log = load_run(&runs[0]).unwrap();
        assert_eq!(log.completion(), Completion::Complete);
        assert_eq!(log.summary.unwrap().passed, 2);
        assert!(h.shutdown.pending().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_everything() {
        let h = Harness::new(vec![], vec![issue(1, "", &[]), issue(2, "", &[])]);
        h.shutdown.trigger();
        let s = settings(RunMode::Sequential, FailurePolicy::default(), &[Phase::Exec]);
        let outcome = h.orchestrator(s).run(RunPlan::Issues(vec![1, 2])).await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.skipped, vec![1, 2]);
        assert_eq!(h.runner.call_count(), 0);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_unfetchable_issue_still_runs() {
        let h = Harness::new(vec![], vec![]);
        let s = settings(RunMode::Sequential, FailurePolicy::default(), &[Phase::Exec]);
        let outcome = h.orchestrator(s).run(RunPlan::Issues(vec![9])).await.unwrap();
        assert_eq!(outcome.passed, vec![9]);
        assert_eq!(
            h.state().get_issue_state(9).unwrap().unwrap().title,
            "Issue #9"
        );
    }

    #[tokio::test]
    async fn test_comments_posted_when_enabled() {
        let h = Harness::new(vec![], vec![issue(1, "", &[])]);
        let mut s = settings(RunMode::Sequential, FailurePolicy::default(), &[Phase::Exec]);
        s.comment_on_issues = true;
        h.orchestrator(s).run(RunPlan::Issues(vec![1])).await.unwrap();
        let comments = h.tracker.comments.lock().unwrap();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].1.contains("ready_for_merge"));
    }

    #[tokio::test]
    async fn test_invalid_configurations() {
        let h = Harness::new(vec![], vec![]);
        let executor = PhaseExecutor::new(h.runner.clone(), CancellationToken::new());
        let ctx = RunContext {
            executor,
            issues: h.tracker.clone(),
            state: None,
            worktrees: None,
            prs: None,
            log_dir: None,
            shutdown: ShutdownCoordinator::new(),
        };
        let gate_without_chain = RunSettings {
            qa_gate: true,
            ..Default::default()
        };
        assert!(matches!(
            Orchestrator::new(ctx, gate_without_chain),
            Err(OrchestratorError::InvalidConfig(_))
        ));

        let orch = h.orchestrator(settings(RunMode::Batch, FailurePolicy::default(), &[Phase::Exec]));
        assert!(matches!(
            orch.run(RunPlan::Issues(vec![1])).await,
            Err(OrchestratorError::InvalidConfig(_))
        ));
        let orch = h.orchestrator(RunSettings::default());
        assert!(matches!(
            orch.run(RunPlan::Issues(vec![])).await,
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }

    /// Writes one file per phase into the worktree, like a real agent would.
    struct FileWritingRunner;

    #[async_trait]
    impl PhaseRunner for FileWritingRunner {
        async fn run_phase(
            &self,
            invocation: &PhaseInvocation,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<AgentOutput> {
            if let Some(dir) = &invocation.working_dir {
                std::fs::write(
                    dir.join(format!("{}-{}.txt", invocation.phase, invocation.issue)),
                    "work",
                )?;
            }
            Ok(ok(120, ""))
        }
    }

    #[tokio::test]
    async fn test_chain_branches_from_previous_issue_and_checkpoints() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);
        commit_file(&repo, "README.md", "hello\n", "init");
        let trunk = GitTracker::open(&repo).unwrap().current_branch().unwrap();
        let worktrees = WorktreeManager::new(&repo, dir.path().join("worktrees"), trunk.clone())
            .with_dependency_install(false);

        let shutdown = ShutdownCoordinator::new();
        let state = StateManager::new(dir.path().join("state.json"));
        let ctx = RunContext {
            executor: PhaseExecutor::new(Arc::new(FileWritingRunner), shutdown.token()),
            issues: Arc::new(FakeTracker::with(vec![issue(1, "", &[]), issue(2, "", &[])])),
            state: Some(StateManager::new(state.path())),
            worktrees: Some(worktrees),
            prs: None,
            log_dir: None,
            shutdown: shutdown.clone(),
        };
        let s = settings(RunMode::Chain, FailurePolicy::default(), &[Phase::Exec]);
        let outcome = Orchestrator::new(ctx, s)
            .unwrap()
            .run(RunPlan::Issues(vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(outcome.passed, vec![1, 2]);

        let first = state.get_issue_state(1).unwrap().unwrap();
        let second = state.get_issue_state(2).unwrap().unwrap();
        assert_eq!(first.base_branch.as_deref(), Some(trunk.as_str()));
        assert_eq!(second.base_branch, first.branch);

        let first_wt = first.worktree.unwrap();
        let second_wt = second.worktree.unwrap();
        assert!(!GitTracker::open(&first_wt).unwrap().has_uncommitted_changes().unwrap());
        // Issue 1's checkpointed work is part of issue 2's base.
        assert!(second_wt.join("exec-1.txt").exists());
        assert!(shutdown.pending().is_empty());
    }
}
