//! `sequant logs`.

use anyhow::Result;
use console::style;
use std::path::Path;

use sequant::audit::{Completion, list_runs, load_run};
use sequant::config::Config;
use sequant::util::format_duration;

pub fn cmd_logs(project_dir: &Path, limit: usize) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let runs = list_runs(&config.log_dir)?;
    if runs.is_empty() {
        println!("No run logs in {}", config.log_dir.display());
        return Ok(());
    }

    println!();
    for path in runs.iter().take(limit) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let log = match load_run(path) {
            Ok(log) => log,
            Err(e) => {
                println!("{} {} {}", style("?").red(), name, style(format!("unreadable: {:#}", e)).dim());
                continue;
            }
        };

        let started = log.start_time.format("%Y-%m-%d %H:%M");
        match (log.completion(), &log.summary) {
            (Completion::Complete, Some(summary)) => println!(
                "{} {}  {}  {:<10} {} passed, {} failed, {} skipped{} ({})",
                style("✓").green(),
                name,
                started,
                log.config.mode,
                summary.passed,
                summary.failed,
                summary.skipped,
                if summary.gated > 0 {
                    format!(", {} waiting for QA gate", summary.gated)
                } else {
                    String::new()
                },
                format_duration(summary.total_duration.as_secs_f64())
            ),
            _ => println!(
                "{} {}  {}  {:<10} {} after {} issue(s)",
                style("!").yellow(),
                name,
                started,
                log.config.mode,
                style("INCOMPLETE").yellow().bold(),
                log.issues.len()
            ),
        }
    }
    if runs.len() > limit {
        println!("… {} older run(s)", runs.len() - limit);
    }
    println!();
    Ok(())
}
