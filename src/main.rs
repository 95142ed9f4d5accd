use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "sequant")]
#[command(version, about = "Run GitHub issues through phased agent workflows in isolated worktrees")]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Format of diagnostic logs on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run issues through their phases
    Run(RunArgs),
    /// Show tracked issue state
    Status {
        /// Show one issue in detail
        #[arg(long)]
        issue: Option<u64>,
        /// Print the raw state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Maintain the state file
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Inspect or remove issue worktrees
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommands,
    },
    /// List run logs
    Logs {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Issue numbers
    #[arg(required_unless_present = "batches")]
    pub issues: Vec<u64>,

    /// Fixed phase list, e.g. "spec,exec,qa"
    #[arg(long)]
    pub phases: Option<String>,

    /// Halt the remaining issues after a failure
    #[arg(long)]
    pub stop_on_failure: bool,

    /// A group of issues run together, e.g. --batch "12 13" (repeatable)
    #[arg(long = "batch", value_name = "ISSUES", conflicts_with = "issues")]
    pub batches: Vec<String>,

    /// Branch each issue from the previous issue's branch
    #[arg(long, conflicts_with = "batches")]
    pub chain: bool,

    /// Pause the chain when verification fails
    #[arg(long, requires = "chain")]
    pub qa_gate: bool,

    #[arg(long)]
    pub quality_loop: bool,

    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Per-phase timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Disable the cold-start retry protocol
    #[arg(long)]
    pub no_retry: bool,

    /// Run the agent without enhanced capabilities
    #[arg(long)]
    pub no_enhanced: bool,

    /// Re-run issues that are already ready for merge or merged
    #[arg(long)]
    pub force: bool,

    /// Plan only; nothing is executed or written
    #[arg(long)]
    pub dry_run: bool,

    /// Base branch (chain: base of the first issue)
    #[arg(long)]
    pub base: Option<String>,

    /// Open a merge request for every issue that passes
    #[arg(long)]
    pub create_pr: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum StateCommands {
    /// Rebuild state from run logs
    Rebuild,
    /// Track issue worktrees missing from state
    Discover,
    /// Drop orphaned, abandoned and old merged entries
    Cleanup {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        max_age_days: Option<u32>,
    },
    /// Advance ready-for-merge issues whose merge request closed
    Reconcile,
}

#[derive(Subcommand, Debug, Clone)]
pub enum WorktreeCommands {
    /// Commits ahead of and behind trunk
    Freshness { issue: u64 },
    /// Remove the worktree and its local branch
    Remove { issue: u64 },
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "sequant=debug" } else { "sequant=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default.into());
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match dispatch(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<u8> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run(args) => return cmd::cmd_run(project_dir, cli.verbose, args).await,
        Commands::Status { issue, json } => cmd::cmd_status(&project_dir, *issue, *json)?,
        Commands::State { command } => cmd::cmd_state(&project_dir, command).await?,
        Commands::Worktree { command } => cmd::cmd_worktree(&project_dir, command).await?,
        Commands::Logs { limit } => cmd::cmd_logs(&project_dir, *limit)?,
    }
    Ok(0)
}
