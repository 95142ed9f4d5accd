//! `sequant worktree …`.

use anyhow::Result;
use console::style;
use std::path::Path;

use super::super::WorktreeCommands;
use sequant::config::Config;
use sequant::tracker::STALE_THRESHOLD;

pub async fn cmd_worktree(project_dir: &Path, command: &WorktreeCommands) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let manager = config.worktree_manager();

    match command {
        WorktreeCommands::Freshness { issue } => {
            let fresh = manager.check_worktree_freshness(*issue).await?;
            println!(
                "#{}: {} ahead, {} behind {}",
                issue,
                fresh.ahead,
                fresh.behind,
                manager.trunk()
            );
            if fresh.is_stale() {
                println!(
                    "  {} more than {} commits behind; consider 'sequant worktree remove {}'",
                    style("⚠").yellow(),
                    STALE_THRESHOLD,
                    issue
                );
            }
        }
        WorktreeCommands::Remove { issue } => {
            let path = manager.remove_stale_worktree(*issue).await?;
            println!("{} removed {}", style("✓").green(), path.display());
        }
    }
    Ok(())
}
