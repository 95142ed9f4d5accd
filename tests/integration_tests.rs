//! Integration tests for the sequant binary.
//!
//! These run the CLI against throwaway project directories. Nothing here
//! needs `gh`, an agent binary or network access.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

use sequant::audit::{RunConfig, RunLogWriter};
use sequant::orchestrator::RunMode;
use sequant::phase::ExecutionConfig;

fn sequant() -> Command {
    cargo_bin_cmd!("sequant")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn run_config() -> RunConfig {
    RunConfig {
        mode: RunMode::Chain,
        qa_gate: false,
        base_branch: None,
        execution: ExecutionConfig::default(),
    }
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        sequant()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("status"));
    }

    #[test]
    fn test_version() {
        sequant().arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_issues() {
        let dir = create_temp_project();
        sequant()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .failure();
    }

    #[test]
    fn test_qa_gate_requires_chain() {
        let dir = create_temp_project();
        sequant()
            .current_dir(dir.path())
            .args(["run", "12", "--qa-gate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--chain"));
    }

    #[test]
    fn test_chain_conflicts_with_batch() {
        let dir = create_temp_project();
        sequant()
            .current_dir(dir.path())
            .args(["run", "--batch", "1 2", "--chain"])
            .assert()
            .failure();
    }

    #[test]
    fn test_unknown_phase_is_rejected() {
        let dir = create_temp_project();
        sequant()
            .current_dir(dir.path())
            .args(["run", "12", "--phases", "exec,deploy"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("deploy"));

        assert!(!dir.path().join(".sequant/state.json").exists());
    }
}

// =============================================================================
// Status
// =============================================================================

mod status {
    use super::*;

    #[test]
    fn test_status_empty_project() {
        let dir = create_temp_project();
        sequant()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No tracked issues"));
    }

    #[test]
    fn test_status_json_empty() {
        let dir = create_temp_project();
        sequant()
            .current_dir(dir.path())
            .args(["status", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn test_status_lists_tracked_issue() {
        let dir = create_temp_project();
        let state = r#"{
  "version": 1,
  "lastUpdated": "2026-01-05T10:00:00Z",
  "issues": {
    "42": {
      "number": 42,
      "title": "Add login",
      "status": "ready_for_merge",
      "phases": {},
      "branch": "feature/42-add-login",
      "lastActivity": "2026-01-05T10:00:00Z"
    }
  }
}"#;
        fs::create_dir_all(dir.path().join(".sequant")).unwrap();
        fs::write(dir.path().join(".sequant/state.json"), state).unwrap();

        sequant()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("#42"))
            .stdout(predicate::str::contains("ready_for_merge"))
            .stdout(predicate::str::contains("feature/42-add-login"));

        sequant()
            .current_dir(dir.path())
            .args(["status", "--issue", "7"])
            .assert()
            .success()
            .stdout(predicate::str::contains("not tracked"));
    }

    #[test]
    fn test_status_rejects_newer_state_version() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".sequant")).unwrap();
        fs::write(
            dir.path().join(".sequant/state.json"),
            r#"{"version": 99, "lastUpdated": "2026-01-05T10:00:00Z", "issues": {}}"#,
        )
        .unwrap();

        sequant()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Error"));
    }
}

// =============================================================================
// State maintenance
// =============================================================================

mod state_commands {
    use super::*;

    #[test]
    fn test_cleanup_empty_project() {
        let dir = create_temp_project();
        sequant()
            .current_dir(dir.path())
            .args(["state", "cleanup", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("nothing to clean up"));
    }

    #[test]
    fn test_rebuild_without_logs() {
        let dir = create_temp_project();
        sequant()
            .current_dir(dir.path())
            .args(["state", "rebuild"])
            .assert()
            .success()
            .stdout(predicate::str::contains("rebuilt 0 issue(s)"));
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();
        sequant()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["state", "rebuild"])
            .assert()
            .success();
    }
}

// =============================================================================
// Run logs
// =============================================================================

mod logs {
    use super::*;

    #[test]
    fn test_logs_empty() {
        let dir = create_temp_project();
        sequant()
            .current_dir(dir.path())
            .arg("logs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No run logs"));
    }

    #[test]
    fn test_logs_marks_incomplete_run() {
        let dir = create_temp_project();
        let log_dir = dir.path().join(".sequant/logs");
        fs::create_dir_all(&log_dir).unwrap();
        let _writer = RunLogWriter::start(&log_dir, run_config(), None).unwrap();

        sequant()
            .current_dir(dir.path())
            .arg("logs")
            .assert()
            .success()
            .stdout(predicate::str::contains("INCOMPLETE"))
            .stdout(predicate::str::contains("chain"));
    }

    #[test]
    fn test_logs_complete_run() {
        let dir = create_temp_project();
        let log_dir = dir.path().join(".sequant/logs");
        fs::create_dir_all(&log_dir).unwrap();
        let mut writer = RunLogWriter::start(&log_dir, run_config(), None).unwrap();
        writer.finalize(None).unwrap();

        sequant()
            .current_dir(dir.path())
            .arg("logs")
            .assert()
            .success()
            .stdout(predicate::str::contains("0 passed, 0 failed, 0 skipped"))
            .stdout(predicate::str::contains("INCOMPLETE").not());
    }

    #[test]
    fn test_logs_reports_unreadable_file() {
        let dir = create_temp_project();
        let log_dir = dir.path().join(".sequant/logs");
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(log_dir.join("run-broken.json"), "{ not json").unwrap();

        sequant()
            .current_dir(dir.path())
            .arg("logs")
            .assert()
            .success()
            .stdout(predicate::str::contains("unreadable"));
    }
}
