//! Dependency installation for fresh or rebased worktrees.

use crate::process::CommandSpec;
use std::path::Path;
use std::time::Duration;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
    Bun,
    Cargo,
}

impl PackageManager {
    /// Detection order when several lockfiles are present.
    pub const ALL: [PackageManager; 5] = [
        PackageManager::Npm,
        PackageManager::Pnpm,
        PackageManager::Yarn,
        PackageManager::Bun,
        PackageManager::Cargo,
    ];

    pub fn lockfile(&self) -> &'static str {
        match self {
            PackageManager::Npm => "package-lock.json",
            PackageManager::Pnpm => "pnpm-lock.yaml",
            PackageManager::Yarn => "yarn.lock",
            PackageManager::Bun => "bun.lockb",
            PackageManager::Cargo => "Cargo.lock",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Bun => "bun",
            PackageManager::Cargo => "cargo",
        }
    }

    pub fn detect(dir: &Path) -> Option<PackageManager> {
        Self::ALL
            .into_iter()
            .find(|pm| dir.join(pm.lockfile()).is_file())
    }

    pub fn install_command(&self, dir: &Path) -> CommandSpec {
        let args: &[&str] = match self {
            PackageManager::Npm => &["ci"],
            PackageManager::Pnpm => &["install", "--frozen-lockfile"],
            PackageManager::Yarn => &["install", "--frozen-lockfile"],
            PackageManager::Bun => &["install", "--frozen-lockfile"],
            PackageManager::Cargo => &["fetch"],
        };
        CommandSpec::new(self.name())
            .current_dir(dir)
            .args(args.iter().copied())
            .timeout(INSTALL_TIMEOUT)
    }

    /// Install dependencies in `dir`. Failures are reported and swallowed.
    pub async fn install(&self, dir: &Path) -> bool {
        println!(
            "  {} installing dependencies with {}",
            console::style("⋯").dim(),
            self.name()
        );
        let spec = self.install_command(dir);
        match spec.run().await {
            Ok(out) if out.success() => {
                tracing::info!(manager = self.name(), dir = %dir.display(), "dependencies installed");
                true
            }
            Ok(out) => {
                let reason = if out.timed_out {
                    "timed out".to_string()
                } else {
                    out.stderr.lines().last().unwrap_or("").trim().to_string()
                };
                warn_install_failed(self, dir, &reason);
                false
            }
            Err(e) => {
                warn_install_failed(self, dir, &e.to_string());
                false
            }
        }
    }
}

fn warn_install_failed(pm: &PackageManager, dir: &Path, reason: &str) {
    println!(
        "  {} {} install failed, continuing: {}",
        console::style("!").yellow(),
        pm.name(),
        reason
    );
    tracing::warn!(manager = pm.name(), dir = %dir.display(), reason, "dependency install failed");
}
