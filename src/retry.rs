//! Transient-failure recovery for remote service calls
//!
//! Remote services occasionally fail with rate limiting, expired credentials,
//! or brief connectivity loss. Those failures are recovered locally by one
//! session refresh and a single retry; anything that fails twice escalates to
//! the caller, which maps it to the fatal error kind for the resource at
//! hand.
//!
//! # Example
//!
//! ```ignore
//! use kubescaler::retry::with_refresh;
//!
//! let stack = with_refresh(
//!     "describe_stack",
//!     || service.refresh_session(),
//!     || service.describe_stack(&name),
//! )
//! .await?;
//! ```

use std::future::Future;

use tracing::warn;

use crate::Result;

/// Run a remote operation, refreshing the session once on transient failure
///
/// Non-transient errors propagate untouched. A transient failure triggers
/// `refresh` followed by exactly one more attempt; the second failure is
/// returned to the caller for escalation.
pub async fn with_refresh<T, F, Fut, R, RFut>(
    operation: &str,
    refresh: R,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<()>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) if e.is_transient() => {
            warn!(
                operation = %operation,
                error = %e,
                "transient remote failure, refreshing session and retrying once"
            );
            refresh().await?;
            op().await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_without_touching_the_session() {
        let refreshes = Arc::new(AtomicU32::new(0));
        let r = refreshes.clone();

        let result = with_refresh(
            "op",
            move || {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            || async { Ok(7u32) },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_failure_refreshes_and_retries_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let refreshes = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let r = refreshes.clone();

        let result = with_refresh(
            "op",
            move || {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            move || {
                let a = a.clone();
                async move {
                    if a.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::transient("Throttling: Rate exceeded"))
                    } else {
                        Ok("recovered")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_transient_failure_escalates() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result: Result<u32> = with_refresh(
            "op",
            || async { Ok(()) },
            move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(Error::transient("still throttled"))
                }
            },
        )
        .await;

        let err = result.expect_err("second failure must escalate");
        assert!(err.is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 2, "exactly one retry");
    }

    #[tokio::test]
    async fn fatal_failure_skips_the_refresh_path() {
        let refreshes = Arc::new(AtomicU32::new(0));
        let r = refreshes.clone();

        let result: Result<u32> = with_refresh(
            "op",
            move || {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            || async { Err(Error::cluster_activation("status FAILED")) },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(refreshes.load(Ordering::SeqCst), 0, "no refresh for fatal errors");
    }
}
