use crate::errors::WorktreeError;
use git2::{Oid, Repository, Signature, StatusOptions};
use std::path::Path;

/// Commits a worktree's HEAD is behind trunk before it counts as stale.
pub const STALE_THRESHOLD: usize = 5;

/// Position of a branch relative to trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub ahead: usize,
    pub behind: usize,
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        self.behind > STALE_THRESHOLD
    }
}

/// Read-mostly view of a repository or linked worktree through libgit2.
pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn open(dir: &Path) -> Result<Self, WorktreeError> {
        let repo =
            Repository::open(dir).map_err(|_| WorktreeError::NotARepository(dir.to_path_buf()))?;
        Ok(Self { repo })
    }

    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Current HEAD SHA (`None` for unborn branches).
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Name of the checked-out branch, if HEAD is on one.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if head.is_branch() {
            head.shorthand().map(str::to_string)
        } else {
            None
        }
    }

    fn resolve(&self, reference: &str) -> Result<Oid, WorktreeError> {
        self.repo
            .revparse_single(reference)
            .and_then(|obj| obj.peel_to_commit())
            .map(|c| c.id())
            .map_err(|_| WorktreeError::UnknownRef(reference.to_string()))
    }

    pub fn resolve_sha(&self, reference: &str) -> Result<String, WorktreeError> {
        self.resolve(reference).map(|oid| oid.to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.repo
            .find_branch(branch, git2::BranchType::Local)
            .is_ok()
    }

    /// Prefer the remote-tracking trunk when there is one.
    pub fn trunk_ref(&self, trunk: &str) -> String {
        let remote = format!("origin/{trunk}");
        if self.resolve(&remote).is_ok() {
            remote
        } else {
            trunk.to_string()
        }
    }

    /// Ahead/behind counts of `reference` against `trunk`, measured from
    /// their merge base.
    pub fn freshness(&self, reference: &str, trunk: &str) -> Result<Freshness, WorktreeError> {
        let local = self.resolve(reference)?;
        let upstream = self.resolve(&self.trunk_ref(trunk))?;
        let (ahead, behind) = self.repo.graph_ahead_behind(local, upstream)?;
        Ok(Freshness { ahead, behind })
    }

    /// Whether `ancestor` is already contained in `reference`.
    pub fn contains(&self, reference: &str, ancestor: &str) -> Result<bool, WorktreeError> {
        let tip = self.resolve(reference)?;
        let base = self.resolve(ancestor)?;
        if tip == base {
            return Ok(true);
        }
        Ok(self.repo.graph_descendant_of(tip, base)?)
    }

    /// Whether `file` differs between two commits.
    pub fn file_changed_between(
        &self,
        old_sha: &str,
        new_sha: &str,
        file: &Path,
    ) -> Result<bool, WorktreeError> {
        let old_tree = self.repo.find_commit(Oid::from_str(old_sha)?)?.tree()?;
        let new_tree = self.repo.find_commit(Oid::from_str(new_sha)?)?.tree()?;
        let diff = self
            .repo
            .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;
        Ok(diff.deltas().any(|delta| {
            delta.new_file().path() == Some(file) || delta.old_file().path() == Some(file)
        }))
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool, WorktreeError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        Ok(!self.repo.statuses(Some(&mut opts))?.is_empty())
    }

    /// Commit everything in the working directory. Returns the new SHA, or
    /// `None` when there was nothing to commit.
    pub fn checkpoint(&self, message: &str) -> Result<Option<String>, WorktreeError> {
        if !self.has_uncommitted_changes()? {
            return Ok(None);
        }
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("sequant", "sequant@localhost"))?;

        let parents: Vec<git2::Commit<'_>> = self.get_head_commit().into_iter().collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?;
        Ok(Some(commit_id.to_string()))
    }
}
