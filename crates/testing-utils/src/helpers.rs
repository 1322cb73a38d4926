//! Polling helpers for asynchronous assertions

use std::future::Future;
use std::time::Duration;

/// Polls `condition` until it returns true or `timeout` elapses.
/// Returns whether the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
