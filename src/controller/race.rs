//! Race a cancellable task against a timer
//!
//! The task runs on its own tokio task and reports through a oneshot slot
//! used at most once. Whichever side loses is cancelled explicitly through a
//! `CancellationToken`, so no watch or poll keeps running after a timeout.

use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq)]
pub enum RaceOutcome<T> {
    /// The task finished first
    Completed(T),
    /// The timer fired first; the task was cancelled
    TimedOut,
    /// The task ended without reporting (it panicked)
    Abandoned,
}

/// Run `task` with a cancellation token, giving up after `timeout`
///
/// The token handed to `task` fires when the timer wins or when the caller
/// drops the returned future. Long-running loops inside `task` should select
/// on `token.cancelled()` at their suspension points.
pub async fn race_with_timeout<T, F, Fut>(timeout: Duration, task: F) -> RaceOutcome<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();
    let (tx, rx) = oneshot::channel();

    let work = task(token.child_token());
    let stop = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            result = work => {
                // Receiver gone means the timer already won
                let _ = tx.send(result);
            }
        }
    });

    let outcome = tokio::select! {
        result = rx => match result {
            Ok(value) => RaceOutcome::Completed(value),
            Err(_) => RaceOutcome::Abandoned,
        },
        _ = tokio::time::sleep(timeout) => RaceOutcome::TimedOut,
    };

    token.cancel();
    outcome
}
