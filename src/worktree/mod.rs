//! Per-issue worktrees.
//!
//! Each issue gets its own linked worktree on a `feature/<issue>-<slug>`
//! branch under the worktree base directory. Mutating git operations go
//! through the git CLI; queries use [`GitTracker`].

pub mod deps;

pub use deps::PackageManager;

use crate::errors::WorktreeError;
use crate::github::{MergeRequests, PrRef, is_already_exists};
use crate::process::{CommandOutput, CommandSpec};
use crate::tracker::{Freshness, GitTracker};
use crate::util::slugify;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

const GIT_TIMEOUT: Duration = Duration::from_secs(300);
const SLUG_MAX_LEN: usize = 50;

static ISSUE_BRANCH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^feature/(\d+)(?:-|$)").expect("issue branch regex is valid")
});

/// Result of acquiring an issue's worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub issue: u64,
    pub path: PathBuf,
    pub branch: String,
    /// Branch the worktree was created from or rebased onto.
    pub base_branch: Option<String>,
    /// The worktree was already there and got reused.
    pub existed: bool,
    /// `None`: no rebase attempted. `Some(false)`: rebase conflicted and was aborted.
    pub rebased: Option<bool>,
}

/// An issue worktree found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueWorktree {
    pub issue: u64,
    pub path: PathBuf,
    pub branch: String,
    pub commits_ahead: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WorktreeEntry {
    path: PathBuf,
    branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_base: PathBuf,
    trunk: String,
    install_deps: bool,
}

impl WorktreeManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        worktree_base: impl Into<PathBuf>,
        trunk: impl Into<String>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_base: worktree_base.into(),
            trunk: trunk.into(),
            install_deps: true,
        }
    }

    pub fn with_dependency_install(mut self, enabled: bool) -> Self {
        self.install_deps = enabled;
        self
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn branch_name(issue: u64, title: &str) -> String {
        let slug = slugify(title, SLUG_MAX_LEN);
        if slug.is_empty() {
            format!("feature/{issue}")
        } else {
            format!("feature/{issue}-{slug}")
        }
    }

    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        self.worktree_base.join(branch)
    }

    /// HEAD of the main repository, for run logs.
    pub fn head_sha(&self) -> Option<String> {
        GitTracker::open(&self.repo_root).ok()?.head_sha()
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<CommandOutput, WorktreeError> {
        CommandSpec::git(cwd, args.iter().copied())
            .timeout(GIT_TIMEOUT)
            .run()
            .await
            .map_err(|e| WorktreeError::Other(e.into()))
    }

    async fn git_ok(&self, cwd: &Path, args: &[&str]) -> Result<String, WorktreeError> {
        let out = self.git(cwd, args).await?;
        if !out.success() {
            return Err(WorktreeError::GitFailed {
                command: args.join(" "),
                stderr: if out.timed_out {
                    "timed out".to_string()
                } else {
                    out.stderr.trim().to_string()
                },
            });
        }
        Ok(out.stdout)
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>, WorktreeError> {
        let stdout = self
            .git_ok(&self.repo_root, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&stdout))
    }

    /// All linked worktrees on `feature/<issue>-…` branches.
    pub async fn scan_issue_worktrees(&self) -> Result<Vec<IssueWorktree>, WorktreeError> {
        let tracker = GitTracker::open(&self.repo_root)?;
        let mut found = Vec::new();
        for entry in self.list_worktrees().await? {
            let Some(branch) = entry.branch else {
                continue;
            };
            let Some(issue) = issue_from_branch(&branch) else {
                continue;
            };
            let commits_ahead = tracker
                .freshness(&branch, &self.trunk)
                .map(|f| f.ahead)
                .unwrap_or(0);
            found.push(IssueWorktree {
                issue,
                path: entry.path,
                branch,
                commits_ahead,
            });
        }
        Ok(found)
    }

    pub async fn find_worktree(&self, issue: u64) -> Result<Option<IssueWorktree>, WorktreeError> {
        Ok(self
            .scan_issue_worktrees()
            .await?
            .into_iter()
            .find(|wt| wt.issue == issue))
    }

    /// Reuse or create the worktree for `issue`.
    ///
    /// With `base_branch` set (chain mode) an existing worktree that does not
    /// already contain the base is rebased onto it. A conflicting rebase is
    /// aborted and reported as `rebased: Some(false)`; the run carries on.
    /// If the abort itself fails the worktree is unusable and an error is
    /// returned.
    pub async fn ensure_worktree(
        &self,
        issue: u64,
        title: &str,
        base_branch: Option<&str>,
    ) -> Result<WorktreeInfo, WorktreeError> {
        if let Some(existing) = self.find_worktree(issue).await? {
            println!(
                "  {} reusing worktree {}",
                console::style("↺").cyan(),
                existing.path.display()
            );
            tracing::info!(issue, path = %existing.path.display(), "reusing worktree");
            let rebased = match base_branch {
                Some(base) => self.rebase_onto(issue, &existing.path, base).await?,
                None => None,
            };
            return Ok(WorktreeInfo {
                issue,
                path: existing.path,
                branch: existing.branch,
                base_branch: base_branch.map(str::to_string),
                existed: true,
                rebased,
            });
        }

        let tracker = GitTracker::open(&self.repo_root)?;
        let base = match base_branch {
            Some(b) => b.to_string(),
            None => tracker.trunk_ref(&self.trunk),
        };
        let branch = Self::branch_name(issue, title);
        let path = self.worktree_path(&branch);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorktreeError::Other(e.into()))?;
        }
        let path_str = path.to_string_lossy().into_owned();

        if tracker.branch_exists(&branch) {
            self.git_ok(&self.repo_root, &["worktree", "add", &path_str, &branch])
                .await?;
        } else {
            self.git_ok(
                &self.repo_root,
                &["worktree", "add", "-b", &branch, &path_str, &base],
            )
            .await?;
        }
        println!(
            "  {} created worktree {} ({} from {})",
            console::style("+").green(),
            path.display(),
            branch,
            base
        );
        tracing::info!(issue, branch = %branch, base = %base, "created worktree");

        if self.install_deps
            && let Some(pm) = PackageManager::detect(&path)
        {
            pm.install(&path).await;
        }

        Ok(WorktreeInfo {
            issue,
            path,
            branch,
            base_branch: Some(base),
            existed: false,
            rebased: None,
        })
    }

    async fn rebase_onto(
        &self,
        issue: u64,
        path: &Path,
        base: &str,
    ) -> Result<Option<bool>, WorktreeError> {
        let tracker = match GitTracker::open(path) {
            Ok(t) => t,
            Err(e) => {
                println!(
                    "  {} cannot inspect worktree for #{}, not rebasing: {}",
                    console::style("!").yellow(),
                    issue,
                    e
                );
                tracing::warn!(issue, error = %e, "cannot inspect worktree, skipping rebase");
                return Ok(Some(false));
            }
        };
        match tracker.contains("HEAD", base) {
            Ok(true) => return Ok(None),
            Ok(false) => {}
            Err(e) => {
                println!(
                    "  {} cannot rebase onto {}: {}",
                    console::style("!").yellow(),
                    base,
                    e
                );
                tracing::warn!(issue, base, error = %e, "rebase skipped");
                return Ok(Some(false));
            }
        }
        let before = tracker.head_sha();

        let rebased = match self.git(path, &["rebase", base]).await {
            Ok(out) if out.success() => true,
            Ok(out) => {
                tracing::warn!(issue, base, stderr = %out.stderr.trim(), "rebase conflict");
                self.abort_rebase(issue, path).await?;
                println!(
                    "  {} rebase onto {} conflicted, aborted; continuing on existing branch",
                    console::style("!").yellow(),
                    base
                );
                false
            }
            Err(e) => {
                println!(
                    "  {} rebase onto {} could not run: {}",
                    console::style("!").yellow(),
                    base,
                    e
                );
                tracing::warn!(issue, base, error = %e, "rebase could not run");
                false
            }
        };

        if rebased {
            tracing::info!(issue, base, "rebased worktree");
            if let Some(before) = before {
                self.reinstall_if_lockfile_changed(path, &before).await;
            }
        }
        Ok(Some(rebased))
    }

    /// A worktree left mid-rebase must not be handed to a phase.
    async fn abort_rebase(&self, issue: u64, path: &Path) -> Result<(), WorktreeError> {
        if let Err(e) = self.git_ok(path, &["rebase", "--abort"]).await {
            println!(
                "  {} could not abort rebase in {}: {}",
                console::style("✗").red(),
                path.display(),
                e
            );
            tracing::error!(issue, path = %path.display(), error = %e, "rebase abort failed");
            return Err(e);
        }
        Ok(())
    }

    /// Reinstall when this worktree's own lockfile differs between `before`
    /// and the current HEAD.
    async fn reinstall_if_lockfile_changed(&self, path: &Path, before: &str) {
        if !self.install_deps {
            return;
        }
        let Some(pm) = PackageManager::detect(path) else {
            return;
        };
        let changed = GitTracker::open(path).and_then(|t| {
            let after = t.resolve_sha("HEAD")?;
            t.file_changed_between(before, &after, Path::new(pm.lockfile()))
        });
        match changed {
            Ok(true) => {
                pm.install(path).await;
            }
            Ok(false) => {
                tracing::debug!(lockfile = pm.lockfile(), "lockfile unchanged by rebase");
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not compare lockfiles after rebase");
            }
        }
    }

    pub async fn check_worktree_freshness(&self, issue: u64) -> Result<Freshness, WorktreeError> {
        let wt = self
            .find_worktree(issue)
            .await?
            .ok_or(WorktreeError::NotFound(issue))?;
        GitTracker::open(&wt.path)?.freshness("HEAD", &self.trunk)
    }

    /// Remove the worktree and force-delete its local branch. A failed branch
    /// deletion is reported but does not fail the removal.
    pub async fn remove_stale_worktree(&self, issue: u64) -> Result<PathBuf, WorktreeError> {
        let wt = self
            .find_worktree(issue)
            .await?
            .ok_or(WorktreeError::NotFound(issue))?;
        let path_str = wt.path.to_string_lossy().into_owned();
        self.git_ok(&self.repo_root, &["worktree", "remove", "--force", &path_str])
            .await?;

        if let Err(e) = self
            .git_ok(&self.repo_root, &["branch", "-D", &wt.branch])
            .await
        {
            println!(
                "  {} worktree removed but branch {} was not deleted: {}",
                console::style("!").yellow(),
                wt.branch,
                e
            );
            tracing::warn!(issue, branch = %wt.branch, error = %e, "branch deletion failed");
        }
        tracing::info!(issue, path = %wt.path.display(), "removed worktree");
        Ok(wt.path)
    }

    /// Commit any uncommitted work so the next chained issue starts from it.
    pub fn checkpoint(&self, path: &Path, issue: u64) -> Result<Option<String>, WorktreeError> {
        GitTracker::open(path)?.checkpoint(&format!("checkpoint: #{issue} (sequant chain)"))
    }

    pub async fn push_branch(&self, path: &Path, branch: &str) -> Result<(), WorktreeError> {
        self.git_ok(path, &["push", "-u", "origin", branch]).await?;
        Ok(())
    }

    /// Open a merge request for `branch`, or return the one already open.
    pub async fn create_pr(
        &self,
        prs: &dyn MergeRequests,
        path: &Path,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PrRef, WorktreeError> {
        if let Some(existing) = prs.find_open(branch).await? {
            tracing::info!(branch, pr = existing.number, "merge request already open");
            return Ok(existing);
        }

        self.push_branch(path, branch).await?;
        match prs.create(branch, base, title, body).await {
            Ok(pr) => Ok(pr),
            Err(e) if is_already_exists(&e) => {
                tracing::warn!(branch, "merge request created concurrently, probing again");
                match prs.find_open(branch).await? {
                    Some(pr) => Ok(pr),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/")
            && let Some(entry) = current.as_mut()
        {
            entry.branch = Some(branch.to_string());
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

pub fn issue_from_branch(branch: &str) -> Option<u64> {
    ISSUE_BRANCH_REGEX
        .captures(branch)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::git::tests::{commit_file, init_repo};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    #[test]
    fn test_branch_name() {
        assert_eq!(
            WorktreeManager::branch_name(42, "Add Login Form!"),
            "feature/42-add-login-form"
        );
        assert_eq!(WorktreeManager::branch_name(7, "???"), "feature/7");
    }

    #[test]
    fn test_issue_from_branch() {
        assert_eq!(issue_from_branch("feature/42-add-login"), Some(42));
        assert_eq!(issue_from_branch("feature/7"), Some(7));
        assert_eq!(issue_from_branch("feature/7x"), None);
        assert_eq!(issue_from_branch("main"), None);
    }

    #[test]
    fn test_parse_worktree_list() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                   worktree /wt/feature/3-x\nHEAD def\nbranch refs/heads/feature/3-x\n\n\
                   worktree /wt/detached\nHEAD 123\ndetached\n";
        let entries = parse_worktree_list(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].branch.as_deref(), Some("feature/3-x"));
        assert_eq!(entries[2].branch, None);
    }

    struct Fixture {
        _dir: TempDir,
        repo: PathBuf,
        manager: WorktreeManager,
        trunk: String,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);
        commit_file(&repo, "README.md", "hello\n", "init");
        let trunk = GitTracker::open(&repo).unwrap().current_branch().unwrap();
        let manager = WorktreeManager::new(&repo, dir.path().join("worktrees"), trunk.clone())
            .with_dependency_install(false);
        Fixture {
            _dir: dir,
            repo,
            manager,
            trunk,
        }
    }

    #[tokio::test]
    async fn test_ensure_creates_then_reuses() {
        let fx = fixture();
        let first = fx.manager.ensure_worktree(5, "Add thing", None).await.unwrap();
        assert!(!first.existed);
        assert_eq!(first.branch, "feature/5-add-thing");
        assert!(first.path.join("README.md").exists());

        let second = fx.manager.ensure_worktree(5, "Add thing", None).await.unwrap();
        assert!(second.existed);
        assert_eq!(second.rebased, None);
        assert_eq!(
            second.path.canonicalize().unwrap(),
            first.path.canonicalize().unwrap()
        );

        let scanned = fx.manager.scan_issue_worktrees().await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].issue, 5);
    }

    #[tokio::test]
    async fn test_freshness_and_remove() {
        let fx = fixture();
        fx.manager.ensure_worktree(6, "Stale", None).await.unwrap();
        for i in 0..6 {
            commit_file(&fx.repo, "trunk.txt", &i.to_string(), "trunk");
        }
        let fresh = fx.manager.check_worktree_freshness(6).await.unwrap();
        assert_eq!(fresh.behind, 6);
        assert!(fresh.is_stale());

        let removed = fx.manager.remove_stale_worktree(6).await.unwrap();
        assert!(!removed.exists());
        assert!(!GitTracker::open(&fx.repo).unwrap().branch_exists("feature/6-stale"));
        assert!(matches!(
            fx.manager.check_worktree_freshness(6).await,
            Err(WorktreeError::NotFound(6))
        ));
    }

    #[tokio::test]
    async fn test_chain_rebase_conflict_is_aborted() {
        let fx = fixture();
        let wt = fx.manager.ensure_worktree(8, "Conflict", None).await.unwrap();
        commit_file(&wt.path, "README.md", "from worktree\n", "wt change");
        commit_file(&fx.repo, "README.md", "from trunk\n", "trunk change");

        let again = fx
            .manager
            .ensure_worktree(8, "Conflict", Some(fx.trunk.as_str()))
            .await
            .unwrap();
        assert!(again.existed);
        assert_eq!(again.rebased, Some(false));
        let content = std::fs::read_to_string(wt.path.join("README.md")).unwrap();
        assert_eq!(content, "from worktree\n");
        let repo = git2::Repository::open(&wt.path).unwrap();
        assert_eq!(repo.state(), git2::RepositoryState::Clean);
    }

    #[tokio::test]
    async fn test_failed_rebase_abort_is_an_error() {
        let fx = fixture();
        let wt = fx.manager.ensure_worktree(10, "No rebase", None).await.unwrap();
        // Nothing in progress, so git refuses to abort.
        let result = fx.manager.abort_rebase(10, &wt.path).await;
        assert!(matches!(result, Err(WorktreeError::GitFailed { .. })));
    }

    #[tokio::test]
    async fn test_chain_rebase_succeeds() {
        let fx = fixture();
        let wt = fx.manager.ensure_worktree(9, "Clean", None).await.unwrap();
        commit_file(&wt.path, "feature.txt", "x\n", "wt change");
        commit_file(&fx.repo, "other.txt", "y\n", "trunk change");

        let again = fx
            .manager
            .ensure_worktree(9, "Clean", Some(fx.trunk.as_str()))
            .await
            .unwrap();
        assert_eq!(again.rebased, Some(true));
        assert!(wt.path.join("other.txt").exists());

        // Already contains the base: nothing to do.
        let third = fx
            .manager
            .ensure_worktree(9, "Clean", Some(fx.trunk.as_str()))
            .await
            .unwrap();
        assert_eq!(third.rebased, None);
    }

    #[derive(Default)]
    struct FakePrs {
        open: Mutex<Option<PrRef>>,
        create_error: Option<&'static str>,
        created: Mutex<u32>,
        lookups: Mutex<u32>,
    }

    #[async_trait]
    impl MergeRequests for FakePrs {
        async fn find_open(&self, _branch: &str) -> anyhow::Result<Option<PrRef>> {
            let mut lookups = self.lookups.lock().unwrap();
            *lookups += 1;
            // The racing creator shows up on the second lookup.
            if *lookups > 1 && self.create_error.is_some() {
                return Ok(Some(PrRef {
                    number: 77,
                    url: "u".into(),
                }));
            }
            Ok(self.open.lock().unwrap().clone())
        }
        async fn create(
            &self,
            _branch: &str,
            _base: &str,
            _title: &str,
            _body: &str,
        ) -> anyhow::Result<PrRef> {
            *self.created.lock().unwrap() += 1;
            if let Some(msg) = self.create_error {
                anyhow::bail!("{msg}");
            }
            Ok(PrRef {
                number: 1,
                url: "u".into(),
            })
        }
        async fn state(&self, _number: u64) -> anyhow::Result<crate::github::PrState> {
            Ok(crate::github::PrState::Open)
        }
    }

    #[tokio::test]
    async fn test_create_pr_returns_existing_without_pushing() {
        let fx = fixture();
        let prs = FakePrs {
            open: Mutex::new(Some(PrRef {
                number: 3,
                url: "u".into(),
            })),
            ..Default::default()
        };
        // No remote configured: a push would fail, so success proves no push.
        let pr = fx
            .manager
            .create_pr(&prs, &fx.repo, "feature/1-x", &fx.trunk, "t", "b")
            .await
            .unwrap();
        assert_eq!(pr.number, 3);
        assert_eq!(*prs.created.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_pr_push_failure_is_error() {
        let fx = fixture();
        let prs = FakePrs::default();
        let err = fx
            .manager
            .create_pr(&prs, &fx.repo, "feature/1-x", &fx.trunk, "t", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::GitFailed { .. }));
        assert_eq!(*prs.created.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_pr_already_exists_race_looks_up_again() {
        let dir = tempdir().unwrap();
        // Bare remote so the push succeeds.
        let remote = dir.path().join("remote.git");
        git2::Repository::init_bare(&remote).unwrap();
        let fx = fixture();
        git2::Repository::open(&fx.repo)
            .unwrap()
            .remote("origin", remote.to_str().unwrap())
            .unwrap();

        let prs = FakePrs {
            create_error: Some("a pull request for branch already exists"),
            ..Default::default()
        };
        let pr = fx
            .manager
            .create_pr(&prs, &fx.repo, &fx.trunk, &fx.trunk, "t", "b")
            .await
            .unwrap();
        assert_eq!(pr.number, 77);
        assert_eq!(*prs.created.lock().unwrap(), 1);
        assert_eq!(*prs.lookups.lock().unwrap(), 2);
    }
}
