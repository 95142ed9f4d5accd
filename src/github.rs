//! Issue tracker and merge-request seams, implemented over the `gh` CLI.
//!
//! The orchestrator only reads a few issue fields and opens/queries merge
//! requests; everything else about the tracker is out of its hands.

use crate::process::CommandSpec;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const GH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub labels: Vec<String>,
    pub body: String,
}

impl Issue {
    pub fn has_label(&self, wanted: &[&str]) -> bool {
        self.labels
            .iter()
            .any(|l| wanted.iter().any(|w| l.eq_ignore_ascii_case(w)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRef {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch_issue(&self, number: u64) -> Result<Issue>;

    /// Post a comment. Callers treat failures as warnings.
    async fn comment(&self, number: u64, body: &str) -> Result<()>;
}

#[async_trait]
pub trait MergeRequests: Send + Sync {
    /// Open merge request whose head is `branch`, if any.
    async fn find_open(&self, branch: &str) -> Result<Option<PrRef>>;

    async fn create(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<PrRef>;

    async fn state(&self, number: u64) -> Result<PrState>;
}

/// `gh` CLI client, run from the repository root.
#[derive(Debug, Clone)]
pub struct GhCli {
    cwd: PathBuf,
}

impl GhCli {
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
        }
    }

    async fn gh<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        let spec = CommandSpec::new("gh")
            .current_dir(&self.cwd)
            .args(args)
            .timeout(GH_TIMEOUT);
        let output = spec.run().await?;
        if output.timed_out {
            anyhow::bail!("{} timed out", spec.display());
        }
        if !output.success() {
            anyhow::bail!("{} failed: {}", spec.display(), output.stderr.trim());
        }
        Ok(output.stdout)
    }
}

#[derive(Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Deserialize)]
struct GhPr {
    number: u64,
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct GhPrState {
    state: String,
}

#[async_trait]
impl IssueTracker for GhCli {
    async fn fetch_issue(&self, number: u64) -> Result<Issue> {
        let n = number.to_string();
        let stdout = self
            .gh(["issue", "view", n.as_str(), "--json", "number,title,body,labels"])
            .await?;
        parse_issue(&stdout).with_context(|| format!("Failed to parse issue #{number}"))
    }

    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        let n = number.to_string();
        self.gh(["issue", "comment", n.as_str(), "--body", body])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MergeRequests for GhCli {
    async fn find_open(&self, branch: &str) -> Result<Option<PrRef>> {
        let stdout = self
            .gh([
                "pr", "list", "--head", branch, "--state", "open", "--json", "number,url",
            ])
            .await?;
        let prs: Vec<GhPr> = serde_json::from_str(stdout.trim())
            .with_context(|| format!("Failed to parse pr list for {branch}"))?;
        Ok(prs.into_iter().next().map(|p| PrRef {
            number: p.number,
            url: p.url,
        }))
    }

    async fn create(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<PrRef> {
        let stdout = self
            .gh([
                "pr", "create", "--head", branch, "--base", base, "--title", title, "--body", body,
            ])
            .await?;
        let url = stdout
            .lines()
            .map(str::trim)
            .rfind(|l| l.starts_with("http"))
            .unwrap_or_else(|| stdout.trim())
            .to_string();
        let number = pr_number_from_url(&url)
            .with_context(|| format!("Could not read PR number from gh output: {url}"))?;
        Ok(PrRef { number, url })
    }

    async fn state(&self, number: u64) -> Result<PrState> {
        let n = number.to_string();
        let stdout = self.gh(["pr", "view", n.as_str(), "--json", "state"]).await?;
        let parsed: GhPrState = serde_json::from_str(stdout.trim())
            .with_context(|| format!("Failed to parse state of PR #{number}"))?;
        parse_pr_state(&parsed.state)
    }
}

fn parse_issue(json: &str) -> Result<Issue> {
    let raw: GhIssue = serde_json::from_str(json.trim())?;
    Ok(Issue {
        number: raw.number,
        title: raw.title,
        labels: raw.labels.into_iter().map(|l| l.name).collect(),
        body: raw.body.unwrap_or_default(),
    })
}

/// `https://github.com/owner/repo/pull/123` → `123`.
fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
}

fn parse_pr_state(raw: &str) -> Result<PrState> {
    match raw.to_ascii_uppercase().as_str() {
        "OPEN" => Ok(PrState::Open),
        "MERGED" => Ok(PrState::Merged),
        "CLOSED" => Ok(PrState::Closed),
        other => anyhow::bail!("Unknown PR state '{other}'"),
    }
}

/// Whether a creation error means a request for the branch already exists.
pub fn is_already_exists(err: &anyhow::Error) -> bool {
    format!("{err:#}").to_lowercase().contains("already exists")
}
