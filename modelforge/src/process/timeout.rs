//! Bounded awaiting.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Result of a timed operation.
#[derive(Debug)]
pub enum TimedResult<T, E> {
    /// Operation completed successfully.
    Ok(T),
    /// Operation failed with an error.
    Err(E),
    /// Operation timed out.
    Timeout,
}

impl<T, E> TimedResult<T, E> {
    /// Returns true if the operation timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Converts to a standard Result, treating timeout as an error.
    ///
    /// # Errors
    ///
    /// Returns the wrapped error, or `timeout_error` on timeout.
    pub fn into_result(self, timeout_error: E) -> Result<T, E> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err(e) => Err(e),
            Self::Timeout => Err(timeout_error),
        }
    }
}

/// Runs a fallible future with a timeout.
pub async fn run_with_timeout<T, E, F>(duration: Duration, future: F) -> TimedResult<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout(duration, future).await {
        Ok(Ok(value)) => TimedResult::Ok(value),
        Ok(Err(error)) => TimedResult::Err(error),
        Err(_) => TimedResult::Timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_budget() {
        let result: TimedResult<u8, String> = run_with_timeout(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.into_result("late".into()), Ok(7));
    }

    #[tokio::test]
    async fn test_error_passes_through() {
        let result: TimedResult<u8, String> =
            run_with_timeout(Duration::from_secs(1), async { Err("boom".to_string()) }).await;
        assert!(!result.is_timeout());
        assert_eq!(result.into_result("late".into()), Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_times_out() {
        let result: TimedResult<(), String> = run_with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(result.is_timeout());
    }
}
