//! `sequant status`.

use anyhow::Result;
use console::style;
use std::path::Path;

use sequant::config::Config;
use sequant::state::{IssueState, IssueStatus, PhaseStatus};

pub fn cmd_status(project_dir: &Path, issue: Option<u64>, json: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    let manager = config.state_manager();

    if let Some(number) = issue {
        let Some(state) = manager.get_issue_state(number)? else {
            println!("Issue #{} is not tracked.", number);
            return Ok(());
        };
        if json {
            println!("{}", serde_json::to_string_pretty(&state)?);
        } else {
            print_issue_detail(&state);
        }
        return Ok(());
    }

    let issues = manager.get_all_issue_states()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&issues)?);
        return Ok(());
    }
    if issues.is_empty() {
        println!();
        println!("No tracked issues. Run 'sequant run <issue>' to start one.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<7} {:<20} {:<16} {:<40} Last activity",
        "Issue", "Status", "Phase", "Branch"
    );
    println!(
        "{:<7} {:<20} {:<16} {:<40} -------------",
        "-----", "------", "-----", "------"
    );
    for state in &issues {
        println!(
            "{:<7} {:<20} {:<16} {:<40} {}",
            format!("#{}", state.number),
            styled_status(state.status),
            state
                .current_phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            state.branch.as_deref().unwrap_or("-"),
            state.last_activity.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    println!("{} tracked issue(s)", issues.len());
    Ok(())
}

fn styled_status(status: IssueStatus) -> String {
    let label = format!("{:<20}", status.as_str());
    let styled = match status {
        IssueStatus::ReadyForMerge | IssueStatus::Merged => style(label).green(),
        IssueStatus::Blocked => style(label).red(),
        IssueStatus::WaitingForQaGate | IssueStatus::InProgress => style(label).yellow(),
        IssueStatus::Abandoned => style(label).dim(),
        IssueStatus::NotStarted => style(label),
    };
    styled.to_string()
}

fn print_issue_detail(state: &IssueState) {
    println!();
    println!("{} #{} {}", style("Issue").bold(), state.number, state.title);
    println!("  status:   {}", styled_status(state.status).trim_end());
    if let Some(branch) = &state.branch {
        println!("  branch:   {}", branch);
    }
    if let Some(base) = &state.base_branch {
        println!("  base:     {}", base);
    }
    if let Some(path) = &state.worktree {
        println!("  worktree: {}", path.display());
    }
    if let Some(pr) = &state.pr {
        println!("  PR:       #{} {}", pr.number, style(&pr.url).dim());
    }
    if !state.phases.is_empty() {
        println!();
        for (phase, ps) in &state.phases {
            let marker = match ps.status {
                PhaseStatus::Completed => style("✓").green(),
                PhaseStatus::Failed => style("✗").red(),
                PhaseStatus::InProgress => style("⋯").yellow(),
                PhaseStatus::Skipped => style("↷").dim(),
                PhaseStatus::Pending => style("·").dim(),
            };
            match &ps.error {
                Some(err) => println!("  {} {:<16} {}", marker, phase.as_str(), style(err).dim()),
                None => println!("  {} {}", marker, phase),
            }
        }
    }
    println!();
}
