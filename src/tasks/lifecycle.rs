//! Spawning helpers for long-running service tasks.
//!
//! Every task is tracked by one [`TaskTracker`] and shares the root
//! [`CancellationToken`]. A task that fails cancels the root token, which
//! shuts the whole service down.

use std::future::Future;

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

/// Spawn a task that observes `app_token` itself and runs its own shutdown
/// logic before returning.
pub fn spawn_managed_task<F>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_future: F,
) where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting background task");

    tracker.spawn(async move {
        match task_future.await {
            Ok(()) => info!(task = task_name, "Background task completed"),
            Err(e) => {
                error!(task = task_name, error = ?e, "Background task failed, shutting down");
                app_token.cancel();
            }
        }
    });
}

/// Spawn a task that can be dropped as soon as `app_token` is cancelled.
pub fn spawn_cancellable_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_builder: F,
) where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting cancellable background task");

    let task_token = app_token.clone();
    tracker.spawn(async move {
        tokio::select! {
            result = task_builder(task_token.clone()) => match result {
                Ok(()) => info!(task = task_name, "Background task completed"),
                Err(e) => {
                    error!(task = task_name, error = ?e, "Background task failed, shutting down");
                    task_token.cancel();
                }
            },
            () = app_token.cancelled() => {
                info!(task = task_name, "Background task cancelled");
            }
        }
    });
}
