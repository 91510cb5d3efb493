//! Optimistic-concurrency retry for resource updates
//!
//! Several pods can race to mutate the same CachedImage's reference set.
//! Updates go through read-modify-write with the resource version acting
//! as the concurrency token; on a 409 the caller's closure re-fetches and
//! re-applies. Conflicts are retried immediately (the conflicting writer
//! has already finished) and bounded, so a persistently hot resource
//! falls back to the controller's requeue instead of looping here.

use std::future::Future;

use tracing::{debug, warn};

use crate::Error;

/// Default number of attempts for conflict-retried updates
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;

/// Execute a read-modify-write operation, retrying on update conflicts.
///
/// The closure must perform the full cycle (fetch current state, apply
/// the mutation, submit) so that every retry observes the latest
/// resource version. Errors other than conflicts are returned
/// immediately; once `max_attempts` is exhausted the last conflict is
/// returned for the caller's error policy to requeue.
pub async fn retry_on_conflict<T, F, Fut>(
    max_attempts: u32,
    operation: &str,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1u32;

    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                debug!(
                    operation = %operation,
                    attempt = attempt,
                    "update conflict, re-fetching and retrying"
                );
                attempt += 1;
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    operation = %operation,
                    attempts = attempt,
                    "update conflict persisted through retries"
                );
                return Err(e);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn conflict() -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    #[tokio::test]
    async fn succeeds_immediately() {
        let result: Result<i32, Error> =
            retry_on_conflict(3, "op", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, Error> = retry_on_conflict(5, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, Error> = retry_on_conflict(3, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_conflict_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, Error> = retry_on_conflict(5, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::registry("boom"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
