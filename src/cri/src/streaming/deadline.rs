//! Timer-versus-completion race shared by stream collection and
//! port-forward pair monitoring.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How a raced wait ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The awaited work finished first.
    Completed(T),
    /// The timer fired first.
    TimedOut,
    /// The owning session went away first.
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }
}

/// Run `work` until it completes, `timeout` elapses or `cancel` fires.
///
/// Completion wins ties so a wait that finishes on the timer's tick still
/// counts as finished.
pub async fn with_deadline<F>(
    timeout: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Outcome<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        out = work => Outcome::Completed(out),
        _ = cancel.cancelled() => Outcome::Cancelled,
        _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_completion_before_timeout() {
        let cancel = CancellationToken::new();
        let outcome = with_deadline(Duration::from_secs(5), &cancel, async { 7 }).await;
        assert_eq!(outcome, Outcome::Completed(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires() {
        let cancel = CancellationToken::new();
        let outcome = with_deadline(
            Duration::from_secs(5),
            &cancel,
            std::future::pending::<()>(),
        )
        .await;
        assert_eq!(outcome, Outcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_fires() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let outcome = with_deadline(
            Duration::from_secs(30),
            &cancel,
            std::future::pending::<()>(),
        )
        .await;
        assert_eq!(outcome, Outcome::Cancelled);
    }
}
