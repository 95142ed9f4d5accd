//! Typed error hierarchy for sequant.
//!
//! One enum per subsystem:
//! - `StateError`: state file load/save failures
//! - `WorktreeError`: git worktree and branch operations
//! - `PhaseError`: invoking the external phase agent
//! - `OrchestratorError`: run-level configuration and control flow

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the durable state tracker.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Unsupported state file version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Failed to parse state file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock state file {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Issue #{0} is not tracked")]
    UnknownIssue(u64),
}

/// Errors from worktree and branch management.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git {command} failed: {stderr}")]
    GitFailed { command: String, stderr: String },

    #[error("No worktree found for issue #{0}")]
    NotFound(u64),

    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("Unknown git reference '{0}'")]
    UnknownRef(String),

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single phase invocation.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Phase {phase} timed out after {secs}s")]
    TimedOut { phase: String, secs: u64 },

    #[error("Phase {phase} was cancelled")]
    Cancelled { phase: String },

    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),
}

/// Errors from the run orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to fetch issue #{number}: {message}")]
    IssueFetch { number: u64, message: String },

    #[error("Run cancelled by shutdown signal")]
    Cancelled,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
