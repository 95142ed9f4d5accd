//! `sequant run`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::super::RunArgs;
use super::print_warning;
use sequant::config::{Config, ExecutionOverrides};
use sequant::errors::OrchestratorError;
use sequant::github::GhCli;
use sequant::orchestrator::{
    Orchestrator, RunContext, RunMode, RunPlan, RunSettings, ShutdownCoordinator,
};
use sequant::phase::{Phase, PhaseExecutor};
use sequant::tracker::GitTracker;

pub async fn cmd_run(project_dir: PathBuf, verbose: bool, args: &RunArgs) -> Result<u8> {
    let config = Config::new(project_dir, verbose)?;
    for warning in config.settings.validate() {
        print_warning(warning);
    }

    let overrides = ExecutionOverrides {
        phases: args.phases.as_deref().map(parse_phases).transpose()?,
        stop_on_failure: args.stop_on_failure,
        quality_loop: args.quality_loop,
        max_iterations: args.max_iterations,
        timeout_secs: args.timeout,
        no_retry: args.no_retry,
        no_enhanced: args.no_enhanced,
        dry_run: args.dry_run,
    };
    let execution = config.execution_config(&overrides);
    if !execution.dry_run {
        config.ensure_directories()?;
    }

    let (mode, plan) = if args.chain {
        (RunMode::Chain, RunPlan::Issues(args.issues.clone()))
    } else if !args.batches.is_empty() {
        let batches = args
            .batches
            .iter()
            .map(|b| parse_batch(b))
            .collect::<Result<Vec<_>>>()?;
        (RunMode::Batch, RunPlan::Batches(batches))
    } else {
        (RunMode::Sequential, RunPlan::Issues(args.issues.clone()))
    };

    let settings = RunSettings {
        mode,
        execution,
        qa_gate: args.qa_gate,
        force: args.force,
        base_branch: args.base.clone(),
        create_pr: args.create_pr || config.settings.run.create_pr,
        comment_on_issues: config.settings.run.comment_on_issues,
    };

    let worktrees = match GitTracker::open(&config.project_dir) {
        Ok(_) => Some(config.worktree_manager()),
        Err(e) => {
            print_warning(format!("{}; phases run in the project directory", e));
            None
        }
    };

    let shutdown = ShutdownCoordinator::new();
    let gh = Arc::new(GhCli::new(&config.project_dir));
    let ctx = RunContext {
        executor: PhaseExecutor::new(Arc::new(config.agent_runner()), shutdown.token()),
        issues: gh.clone(),
        state: Some(config.state_manager()),
        worktrees,
        prs: Some(gh),
        log_dir: Some(config.log_dir.clone()),
        shutdown: shutdown.clone(),
    };
    let orchestrator = Orchestrator::new(ctx, settings)?;

    let signal = shutdown.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down...");
            signal.trigger();
        }
    });

    let result = orchestrator.run(plan).await;
    watcher.abort();
    let cleaned = shutdown.shutdown().await;
    if cleaned > 0 {
        tracing::info!(actions = cleaned, "cleanup actions ran");
    }

    let outcome = result.context("Run failed")?;
    Ok(outcome.exit_code())
}

fn parse_phases(raw: &str) -> Result<Vec<Phase>, OrchestratorError> {
    let phases = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| Phase::from_str(t).map_err(|e| OrchestratorError::InvalidConfig(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    if phases.is_empty() {
        return Err(OrchestratorError::InvalidConfig("--phases is empty".into()));
    }
    Ok(phases)
}

fn parse_batch(raw: &str) -> Result<Vec<u64>> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.trim_start_matches('#')
                .parse::<u64>()
                .with_context(|| format!("Invalid issue number '{}' in --batch", t))
        })
        .collect()
}
