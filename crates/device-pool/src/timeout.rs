//! Bounded waits for backend calls that may never resolve.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// The deadline passed before the future completed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation timed out after {}ms", .after.as_millis())]
pub struct Elapsed {
    /// The bound that was exceeded.
    pub after: Duration,
}

impl Elapsed {
    /// The bound in whole milliseconds, saturating at `u64::MAX`.
    #[must_use]
    pub fn millis(&self) -> u64 {
        u64::try_from(self.after.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Run `future` for at most `duration`.
///
/// On timeout the future is dropped, which only stops waiting for it: the
/// backend has no way to cancel the underlying call.
pub async fn timeout<F>(duration: Duration, future: F) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Elapsed { after: duration })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_bound() {
        let result = timeout(Duration::from_millis(100), async { "drained" }).await;
        assert_eq!(result, Ok("drained"));
    }

    #[tokio::test(start_paused = true)]
    async fn never_resolving_future_times_out() {
        let start = tokio::time::Instant::now();
        let result = timeout(Duration::from_secs(5), std::future::pending::<()>()).await;

        assert_eq!(
            result,
            Err(Elapsed {
                after: Duration::from_secs(5)
            })
        );
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn elapsed_reports_millis() {
        let elapsed = Elapsed {
            after: Duration::from_millis(5000),
        };
        assert_eq!(elapsed.millis(), 5000);
        assert_eq!(elapsed.to_string(), "operation timed out after 5000ms");
    }
}
