use super::{IssueRecord, RunConfig, RunLog};
use crate::util::write_json_atomic;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

/// Writer for one run's log file.
///
/// The file is written when the run starts and rewritten after every issue,
/// so a crash leaves a parseable log that readers report as incomplete.
pub struct RunLogWriter {
    path: PathBuf,
    log: RunLog,
    finalized: bool,
}

impl RunLogWriter {
    pub fn start(log_dir: &Path, config: RunConfig, start_commit: Option<String>) -> Result<Self> {
        let log = RunLog::new(config, start_commit);
        let filename = format!(
            "run-{}-{}.json",
            log.start_time.format("%Y%m%dT%H%M%S"),
            &log.run_id.simple().to_string()[..8]
        );
        let writer = Self {
            path: log_dir.join(filename),
            log,
            finalized: false,
        };
        writer.save()?;
        tracing::debug!(path = %writer.path.display(), run_id = %writer.log.run_id, "run log started");
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// Append one issue record and persist.
    pub fn record_issue(&mut self, record: IssueRecord) -> Result<()> {
        if self.finalized {
            anyhow::bail!("record_issue called after the run log was finalized");
        }
        self.log.issues.push(record);
        self.save()
    }

    /// Close the log. Allowed exactly once.
    pub fn finalize(&mut self, end_commit: Option<String>) -> Result<PathBuf> {
        if self.finalized {
            anyhow::bail!("run log {} already finalized", self.path.display());
        }
        self.log.end_time = Some(Utc::now());
        self.log.end_commit = end_commit;
        self.log.summary = Some(self.log.compute_summary());
        self.save()?;
        self.finalized = true;
        Ok(self.path.clone())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.log)
            .with_context(|| format!("Failed to write run log {}", self.path.display()))
    }
}

/// Run log files in `log_dir`, most recent first.
pub fn list_runs(log_dir: &Path) -> Result<Vec<PathBuf>> {
    if !log_dir.exists() {
        return Ok(Vec::new());
    }

    let mut runs: Vec<PathBuf> = fs::read_dir(log_dir)
        .with_context(|| format!("Failed to read log directory {}", log_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|e| e == "json")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("run-"))
        })
        .collect();

    runs.sort();
    runs.reverse();
    Ok(runs)
}

pub fn load_run(path: &Path) -> Result<RunLog> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read run log {}", path.display()))?;
    let log: RunLog = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse run log {}", path.display()))?;
    Ok(log)
}
