//! Cleanup on shutdown.
//!
//! A [`ShutdownCoordinator`] is created per run and handed to whatever needs
//! to clean up after itself. Actions run newest first when the coordinator
//! shuts down, including when a signal interrupts an issue half way.

use anyhow::Result;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Registered {
    id: u64,
    name: String,
    action: CleanupAction,
}

#[derive(Default)]
struct Inner {
    actions: Mutex<Vec<Registered>>,
    next_id: AtomicU64,
}

/// Owns the run's cancellation token and its pending cleanup actions.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    inner: Arc<Inner>,
}

/// Handle to a registered action. Dropping it leaves the action armed.
#[must_use = "dropping the handle keeps the action registered"]
pub struct CleanupHandle {
    id: u64,
    name: String,
    inner: Arc<Inner>,
}

impl CleanupHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the action without running it. Returns `false` if it already
    /// ran or was disarmed.
    pub fn disarm(self) -> bool {
        let Ok(mut actions) = self.inner.actions.lock() else {
            return false;
        };
        let before = actions.len();
        actions.retain(|a| a.id != self.id);
        let removed = actions.len() != before;
        if removed {
            tracing::debug!(action = %self.name, "cleanup action disarmed");
        }
        removed
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by phase runs and the orchestrator loop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal cancellation without running cleanup yet.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("shutdown requested");
            self.token.cancel();
        }
    }

    pub fn pending(&self) -> Vec<String> {
        self.inner
            .actions
            .lock()
            .map(|a| a.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F) -> CleanupHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: CleanupAction = Box::new(move || Box::pin(action()));
        if let Ok(mut actions) = self.inner.actions.lock() {
            actions.push(Registered {
                id,
                name: name.clone(),
                action: boxed,
            });
        }
        tracing::debug!(action = %name, "cleanup action registered");
        CleanupHandle {
            id,
            name,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Cancel the token and run every remaining action, newest first.
    ///
    /// Each action is awaited to completion. Failures are reported and do not
    /// stop later actions. Returns the number of actions that ran.
    pub async fn shutdown(&self) -> usize {
        self.trigger();
        let pending: Vec<Registered> = match self.inner.actions.lock() {
            Ok(mut actions) => actions.drain(..).collect(),
            Err(_) => return 0,
        };

        let count = pending.len();
        for registered in pending.into_iter().rev() {
            tracing::info!(action = %registered.name, "running cleanup action");
            if let Err(e) = (registered.action)().await {
                println!(
                    "  {} cleanup '{}' failed: {:#}",
                    console::style("!").yellow(),
                    registered.name,
                    e
                );
                tracing::warn!(action = %registered.name, error = %e, "cleanup action failed");
            }
        }
        count
    }
}
