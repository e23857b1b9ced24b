use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Run bookkeeping off the request path. Failures and overruns are logged, never retried.
pub fn spawn_detached<F>(label: &'static str, timeout: Duration, task: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(task = label, error = %err, "background task failed"),
            Err(_) => warn!(
                task = label,
                timeout_ms = timeout.as_millis() as u64,
                "background task timed out"
            ),
        }
    })
}
