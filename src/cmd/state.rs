//! `sequant state …` maintenance commands.

use anyhow::Result;
use chrono::Utc;
use console::style;
use std::path::Path;

use super::super::StateCommands;
use super::print_warning;
use sequant::config::Config;
use sequant::github::GhCli;
use sequant::state::{
    CleanupOptions, cleanup_stale_entries, discover_untracked_worktrees, reconcile_state,
    rebuild_state_from_logs,
};

pub async fn cmd_state(project_dir: &Path, command: &StateCommands) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let manager = config.state_manager();

    match command {
        StateCommands::Rebuild => {
            let report = rebuild_state_from_logs(&manager, &config.log_dir)?;
            for path in &report.incomplete_logs {
                print_warning(format!("incomplete run log replayed: {}", path.display()));
            }
            for path in &report.unreadable_logs {
                print_warning(format!("unreadable run log skipped: {}", path.display()));
            }
            println!(
                "{} rebuilt {} issue(s) from {} run log(s)",
                style("✓").green(),
                report.issues_rebuilt,
                report.logs_processed
            );
        }
        StateCommands::Discover => {
            let worktrees = config.worktree_manager().scan_issue_worktrees().await?;
            let report = discover_untracked_worktrees(&manager, &worktrees)?;
            for number in &report.added {
                println!("  {} tracking #{}", style("+").green(), number);
            }
            println!(
                "{} {} added, {} already tracked",
                style("✓").green(),
                report.added.len(),
                report.already_tracked
            );
        }
        StateCommands::Cleanup {
            dry_run,
            max_age_days,
        } => {
            let options = CleanupOptions {
                dry_run: *dry_run,
                max_age_days: i64::from(max_age_days.unwrap_or(config.settings.cleanup.max_age_days)),
                now: Utc::now(),
            };
            let report = cleanup_stale_entries(&manager, &options)?;
            let verb = if *dry_run { "would remove" } else { "removed" };
            for number in &report.orphaned {
                println!(
                    "  {} #{} worktree is gone, marked abandoned",
                    style("!").yellow(),
                    number
                );
            }
            for number in &report.removed {
                println!("  {} {} #{}", style("-").red(), verb, number);
            }
            if report.is_empty() {
                println!("{} nothing to clean up", style("✓").green());
            } else {
                println!(
                    "{} {} orphaned, {} {}",
                    style("✓").green(),
                    report.orphaned.len(),
                    verb,
                    report.removed.len()
                );
            }
        }
        StateCommands::Reconcile => {
            let gh = GhCli::new(&config.project_dir);
            let report = reconcile_state(&manager, &gh).await?;
            for number in &report.merged {
                println!("  {} #{} merged", style("✓").green(), number);
            }
            for number in &report.abandoned {
                println!("  {} #{} closed without merge, abandoned", style("!").yellow(), number);
            }
            println!(
                "{} checked {} merge request(s)",
                style("✓").green(),
                report.checked
            );
        }
    }
    Ok(())
}
