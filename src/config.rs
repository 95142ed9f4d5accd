use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::phase::{AgentPhaseRunner, ExecutionConfig, FailurePolicy, Phase};
use crate::settings::SequantToml;
use crate::state::StateManager;
use crate::tracker::GitTracker;
use crate::worktree::WorktreeManager;

const DEFAULT_TRUNK: &str = "main";

/// Runtime configuration for a project.
///
/// Resolves project paths and holds the settings file after environment
/// overrides. Command-line flags are applied through [`ExecutionOverrides`].
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub sequant_dir: PathBuf,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    pub worktree_base: PathBuf,
    pub settings: SequantToml,
    pub verbose: bool,
}

/// Command-line adjustments to the execution settings.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOverrides {
    pub phases: Option<Vec<Phase>>,
    pub stop_on_failure: bool,
    pub quality_loop: bool,
    pub max_iterations: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub no_retry: bool,
    pub no_enhanced: bool,
    pub dry_run: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let sequant_dir = project_dir.join(".sequant");
        let settings = SequantToml::load_or_default(&sequant_dir)?.with_env_overrides();
        Ok(Self::from_settings(project_dir, settings, verbose))
    }

    pub fn from_settings(project_dir: PathBuf, settings: SequantToml, verbose: bool) -> Self {
        let sequant_dir = project_dir.join(".sequant");
        let state_file = sequant_dir.join("state.json");
        let log_dir = resolve(&project_dir, &settings.run.log_dir);
        let worktree_base = resolve(&project_dir, &settings.worktrees.base_dir);
        Self {
            project_dir,
            sequant_dir,
            state_file,
            log_dir,
            worktree_base,
            settings,
            verbose,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.sequant_dir)
            .context("Failed to create .sequant directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Execution settings for one run: file values, then flags.
    pub fn execution_config(&self, overrides: &ExecutionOverrides) -> ExecutionConfig {
        let run = &self.settings.run;
        let failure_policy = if overrides.stop_on_failure || run.stop_on_failure {
            FailurePolicy::StopOnFailure
        } else {
            FailurePolicy::ContinueOnFailure
        };
        ExecutionConfig {
            phases: overrides.phases.clone().or_else(|| self.settings.phases()),
            failure_policy,
            phase_timeout: overrides
                .timeout_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| self.settings.phase_timeout()),
            quality_loop: overrides.quality_loop || run.quality_loop,
            max_iterations: overrides.max_iterations.unwrap_or(run.max_iterations),
            enhanced: self.settings.agent.enhanced && !overrides.no_enhanced,
            retry: run.retry && !overrides.no_retry,
            dry_run: overrides.dry_run,
        }
    }

    pub fn agent_runner(&self) -> AgentPhaseRunner {
        let agent = &self.settings.agent;
        AgentPhaseRunner::new(
            agent.command.clone(),
            agent.args.clone(),
            agent.enhanced_args.clone(),
            self.project_dir.clone(),
        )
    }

    /// Configured trunk, else the branch checked out in the project.
    pub fn trunk(&self) -> String {
        if let Some(trunk) = &self.settings.worktrees.trunk {
            return trunk.clone();
        }
        GitTracker::open(&self.project_dir)
            .ok()
            .and_then(|t| t.current_branch())
            .unwrap_or_else(|| DEFAULT_TRUNK.to_string())
    }

    pub fn worktree_manager(&self) -> WorktreeManager {
        WorktreeManager::new(&self.project_dir, &self.worktree_base, self.trunk())
            .with_dependency_install(self.settings.worktrees.install_dependencies)
    }

    pub fn state_manager(&self) -> StateManager {
        StateManager::new(&self.state_file)
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
