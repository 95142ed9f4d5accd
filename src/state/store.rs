use super::{IssueState, IssueStatus, PhaseStatus, PrInfo, STATE_VERSION, WorkflowState};
use crate::errors::StateError;
use crate::phase::Phase;
use crate::util::write_json_atomic;
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Owner of the state file.
///
/// Every mutation is a read-modify-write of the whole document performed
/// while holding an exclusive lock on a sibling `.lock` file, so concurrent
/// CLI invocations against the same project serialize instead of racing.
/// Writes go to a temp file that is renamed over the original.
#[derive(Debug, Clone)]
pub struct StateManager {
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .state_file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".lock");
        self.state_file.with_file_name(name)
    }

    /// Read the current state. A missing file is an empty state.
    pub fn load(&self) -> Result<WorkflowState, StateError> {
        if !self.state_file.exists() {
            return Ok(WorkflowState::default());
        }
        let content = fs::read_to_string(&self.state_file).map_err(|source| StateError::Io {
            path: self.state_file.clone(),
            source,
        })?;
        parse_state(&self.state_file, &content)
    }

    /// Overwrite the state file with `state`.
    pub fn save(&self, state: &WorkflowState) -> Result<(), StateError> {
        let _lock = self.acquire_lock()?;
        self.write_unlocked(state)
    }

    /// Apply `f` to the current state and persist the result atomically.
    pub fn update<T>(&self, f: impl FnOnce(&mut WorkflowState) -> T) -> Result<T, StateError> {
        let _lock = self.acquire_lock()?;
        let mut state = self.load()?;
        let out = f(&mut state);
        self.write_unlocked(&state)?;
        Ok(out)
    }

    /// Like [`update`](Self::update) but the closure may reject the change.
    pub fn try_update<T>(
        &self,
        f: impl FnOnce(&mut WorkflowState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let _lock = self.acquire_lock()?;
        let mut state = self.load()?;
        let out = f(&mut state)?;
        self.write_unlocked(&state)?;
        Ok(out)
    }

    /// Start tracking an issue. An existing entry is kept as is.
    pub fn initialize_issue(&self, number: u64, title: &str) -> Result<IssueState, StateError> {
        self.update(|state| state.ensure_issue(number, title).clone())
    }

    pub fn update_issue_status(&self, number: u64, status: IssueStatus) -> Result<(), StateError> {
        self.try_update(|state| {
            let issue = state
                .issue_mut(number)
                .ok_or(StateError::UnknownIssue(number))?;
            issue.set_status(status);
            Ok(())
        })
    }

    pub fn update_phase_status(
        &self,
        number: u64,
        phase: Phase,
        status: PhaseStatus,
        error: Option<String>,
    ) -> Result<(), StateError> {
        self.try_update(|state| {
            let issue = state
                .issue_mut(number)
                .ok_or(StateError::UnknownIssue(number))?;
            issue.set_phase_status(phase, status, error);
            Ok(())
        })
    }

    pub fn update_worktree_info(
        &self,
        number: u64,
        worktree: &Path,
        branch: &str,
        base_branch: Option<&str>,
    ) -> Result<(), StateError> {
        self.try_update(|state| {
            let issue = state
                .issue_mut(number)
                .ok_or(StateError::UnknownIssue(number))?;
            issue.worktree = Some(worktree.to_path_buf());
            issue.branch = Some(branch.to_string());
            issue.base_branch = base_branch.map(str::to_string);
            issue.last_activity = Utc::now();
            Ok(())
        })
    }

    pub fn update_pr_info(&self, number: u64, pr: PrInfo) -> Result<(), StateError> {
        self.try_update(|state| {
            let issue = state
                .issue_mut(number)
                .ok_or(StateError::UnknownIssue(number))?;
            issue.pr = Some(pr);
            issue.last_activity = Utc::now();
            Ok(())
        })
    }

    pub fn get_issue_state(&self, number: u64) -> Result<Option<IssueState>, StateError> {
        Ok(self.load()?.issue(number).cloned())
    }

    /// All tracked issues, ordered by issue number.
    pub fn get_all_issue_states(&self) -> Result<Vec<IssueState>, StateError> {
        let state = self.load()?;
        let mut issues: Vec<IssueState> = state.issues.into_values().collect();
        issues.sort_by_key(|i| i.number);
        Ok(issues)
    }

    fn acquire_lock(&self) -> Result<File, StateError> {
        let lock_path = self.lock_path();
        ensure_parent_dir(&lock_path)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StateError::Lock {
                path: lock_path.clone(),
                source,
            })?;
        lock_file
            .lock_exclusive()
            .map_err(|source| StateError::Lock {
                path: lock_path,
                source,
            })?;
        Ok(lock_file)
    }

    fn write_unlocked(&self, state: &WorkflowState) -> Result<(), StateError> {
        let mut state = state.clone();
        state.version = STATE_VERSION;
        state.last_updated = Utc::now();
        write_json_atomic(&self.state_file, &state).map_err(|source| StateError::Io {
            path: self.state_file.clone(),
            source,
        })
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), StateError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| StateError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

fn parse_state(path: &Path, content: &str) -> Result<WorkflowState, StateError> {
    // Check the version before the full parse so an unknown schema is
    // reported as such instead of as a field mismatch.
    let raw: serde_json::Value = serde_json::from_str(content).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let found = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
    if found != u64::from(STATE_VERSION) {
        return Err(StateError::UnsupportedVersion {
            found: u32::try_from(found).unwrap_or(u32::MAX),
            expected: STATE_VERSION,
        });
    }
    serde_json::from_value(raw).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
