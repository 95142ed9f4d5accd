//! `.sequant/settings.toml`.
//!
//! Every field has a default, so an absent or empty file is valid. Values
//! are layered file → environment → command line; this module covers the
//! first two.

use crate::phase::{Phase, parse_phase_list};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTINGS_FILE: &str = "settings.toml";

pub const ENV_AGENT_CMD: &str = "SEQUANT_AGENT_CMD";
pub const ENV_PHASE_TIMEOUT: &str = "SEQUANT_PHASE_TIMEOUT";
pub const ENV_NO_ENHANCED: &str = "SEQUANT_NO_ENHANCED";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequantToml {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub worktrees: WorktreesSection,
    #[serde(default)]
    pub cleanup: CleanupSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    /// Fixed phase list. Unset means the planner decides per issue.
    #[serde(default)]
    pub phases: Option<Vec<String>>,
    #[serde(default)]
    pub stop_on_failure: bool,
    #[serde(default)]
    pub quality_loop: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub retry: bool,
    #[serde(default)]
    pub create_pr: bool,
    #[serde(default)]
    pub comment_on_issues: bool,
    /// Run log directory, relative to the project root.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_phase_timeout() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".sequant/logs")
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            phases: None,
            stop_on_failure: false,
            quality_loop: false,
            max_iterations: default_max_iterations(),
            phase_timeout_secs: default_phase_timeout(),
            retry: true,
            create_pr: false,
            comment_on_issues: false,
            log_dir: default_log_dir(),
        }
    }
}

/// How the external phase agent is launched.
///
/// `{issue}` and `{phase}` in arguments are substituted per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Appended only while enhanced mode is on.
    #[serde(default)]
    pub enhanced_args: Vec<String>,
    #[serde(default = "default_true")]
    pub enhanced: bool,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--dangerously-skip-permissions".to_string(),
        "/{phase} {issue}".to_string(),
    ]
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            enhanced_args: Vec::new(),
            enhanced: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreesSection {
    /// Relative to the project root.
    #[serde(default = "default_worktree_base")]
    pub base_dir: PathBuf,
    /// Trunk branch. Unset means the branch checked out in the project.
    #[serde(default)]
    pub trunk: Option<String>,
    #[serde(default = "default_true")]
    pub install_dependencies: bool,
}

fn default_worktree_base() -> PathBuf {
    PathBuf::from("../worktrees")
}

impl Default for WorktreesSection {
    fn default() -> Self {
        Self {
            base_dir: default_worktree_base(),
            trunk: None,
            install_dependencies: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupSection {
    /// Merged issues older than this are dropped from state.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_max_age_days() -> u32 {
    7
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
        }
    }
}

impl SequantToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse settings.toml")
    }

    /// Load `.sequant/settings.toml`, or defaults when it does not exist.
    pub fn load_or_default(sequant_dir: &Path) -> Result<Self> {
        let path = sequant_dir.join(SETTINGS_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `SEQUANT_*` overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env(|key| std::env::var(key).ok());
        self
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cmd) = lookup(ENV_AGENT_CMD).filter(|c| !c.trim().is_empty()) {
            self.agent.command = cmd;
        }
        if let Some(raw) = lookup(ENV_PHASE_TIMEOUT) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.run.phase_timeout_secs = secs,
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring invalid {}", ENV_PHASE_TIMEOUT);
                }
            }
        }
        if let Some(raw) = lookup(ENV_NO_ENHANCED)
            && !matches!(raw.trim(), "" | "0" | "false")
        {
            self.agent.enhanced = false;
        }
    }

    /// Configured phase list with unknown names dropped.
    pub fn phases(&self) -> Option<Vec<Phase>> {
        self.run
            .phases
            .as_ref()
            .map(|names| parse_phase_list(&names.join(",")))
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.run.phase_timeout_secs)
    }

    /// Human-readable problems that do not stop a run.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(names) = &self.run.phases {
            for name in names {
                if Phase::parse_token(name).is_none() {
                    warnings.push(format!("Unknown phase '{}' in run.phases is ignored", name));
                }
            }
            if self.phases().is_some_and(|p| p.is_empty()) {
                warnings.push("run.phases has no valid phases".to_string());
            }
        }
        if self.run.phase_timeout_secs == 0 {
            warnings.push("run.phase_timeout_secs is 0: every phase will time out".to_string());
        }
        if self.run.quality_loop && self.run.max_iterations == 0 {
            warnings.push("run.max_iterations is 0: the quality loop never runs".to_string());
        }
        if self.agent.command.trim().is_empty() {
            warnings.push("agent.command is empty".to_string());
        }
        warnings
    }
}
