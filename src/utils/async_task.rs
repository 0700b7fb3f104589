use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;

use crate::Result;

/// Spawns a named background task whose failure is logged instead of lost.
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
    handles: Option<&mut Vec<JoinHandle<()>>>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        match task_fn().await {
            Ok(()) => debug!("spawned task: {name} finished"),
            Err(e) => error!("spawned task: {name} stopped or encountered an error: {:?}", e),
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}
