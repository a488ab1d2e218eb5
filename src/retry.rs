use crate::errors::{AppError, Capability};
use crate::rate_governor::RateGovernor;
use failsafe::backoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Longest single backoff a policy may ask for.
pub const MAX_BACKOFF_MS: u64 = 300_000;

/// Bounded retry with exponential, jittered backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Delays to sleep between attempts; one fewer than `max_attempts`.
    pub fn schedule(&self) -> Vec<Duration> {
        let retries = self.max_attempts.saturating_sub(1) as usize;
        if retries == 0 {
            return Vec::new();
        }

        // failsafe backoffs step in whole seconds; drive it in milliseconds
        // by feeding one unit per millisecond and reading each unit back as one.
        let initial = self.initial_backoff_ms.clamp(1, MAX_BACKOFF_MS);
        let max = self.max_backoff_ms.clamp(initial, MAX_BACKOFF_MS);
        backoff::equal_jittered(Duration::from_secs(initial), Duration::from_secs(max))
            .take(retries)
            .map(|units| Duration::from_millis(units.as_secs()))
            .collect()
    }
}

/// A call that failed after `attempts` tries.
#[derive(Debug, Clone)]
pub struct CallError {
    pub error: AppError,
    pub attempts: u32,
}

impl CallError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.error.root(), AppError::Cancelled)
    }
}

/// Sleeps unless cancelled first.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<(), AppError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Runs `op` under the governor with a per-attempt timeout, retrying transient
/// failures (timeouts included) per `policy`. Non-retryable errors return at once.
pub async fn governed_call<T, F, Fut>(
    capability: Capability,
    governor: &RateGovernor,
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<(T, u32), CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut delays = policy.schedule().into_iter();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            outcome = async {
                let _permit = governor.acquire(capability).await?;
                match tokio::time::timeout(timeout, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::Transient {
                        capability,
                        message: format!("timed out after {}ms", timeout.as_millis()),
                    }),
                }
            } => outcome,
        };

        let error = match result {
            Ok(value) => return Ok((value, attempts)),
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(CallError { error, attempts });
        }

        let Some(delay) = delays.next() else {
            tracing::warn!(
                capability = %capability,
                attempts,
                "Retries exhausted: {}",
                error
            );
            return Err(CallError { error, attempts });
        };

        tracing::info!(
            capability = %capability,
            attempt = attempts,
            backoff_ms = delay.as_millis() as u64,
            "Transient failure, retrying: {}",
            error
        );

        if let Err(cancelled) = pause(delay, cancel).await {
            return Err(CallError {
                error: cancelled,
                attempts,
            });
        }
    }
}

/// Retries a storage operation on database errors, without a governor.
pub async fn retry_storage<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<(T, u32), CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut delays = policy.schedule().into_iter();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok((value, attempts)),
            Err(error) => {
                let retryable = matches!(error.root(), AppError::DatabaseError(_));
                match delays.next() {
                    Some(delay) if retryable => {
                        tracing::warn!(attempt = attempts, "Storage write failed, retrying: {}", error);
                        tokio::time::sleep(delay).await;
                    }
                    _ => return Err(CallError { error, attempts }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_governor::CapabilityLimits;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn governor() -> RateGovernor {
        RateGovernor::new(&CapabilityLimits::new(2, None), &CapabilityLimits::new(2, None))
    }

    fn transient() -> AppError {
        AppError::Transient {
            capability: Capability::Research,
            message: "503".to_string(),
        }
    }

    #[test]
    fn test_schedule_length_and_bounds() {
        let policy = RetryPolicy::new(4, 10, 40);
        let delays = policy.schedule();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(40)));
        assert!(RetryPolicy::new(1, 10, 40).schedule().is_empty());
    }

    #[test]
    fn test_sub_second_and_zero_backoffs_schedule() {
        for policy in [
            RetryPolicy::new(3, 200, 2_000),
            RetryPolicy::new(3, 1, 2),
            RetryPolicy::new(2, 0, 0),
            RetryPolicy::new(0, 0, 0),
        ] {
            let delays = policy.schedule();
            assert_eq!(delays.len(), policy.max_attempts.saturating_sub(1) as usize);
            let ceiling = Duration::from_millis(policy.max_backoff_ms.max(1));
            assert!(delays.iter().all(|d| *d <= ceiling), "{:?}: {:?}", policy, delays);
        }
    }

    #[test]
    fn test_schedule_grows_in_milliseconds() {
        let delays = RetryPolicy::new(4, 200, 2_000).schedule();
        // equal jitter keeps at least half of each exponential step
        assert!(delays[0] >= Duration::from_millis(100) && delays[0] <= Duration::from_millis(200));
        assert!(delays[1] >= Duration::from_millis(200) && delays[1] <= Duration::from_millis(400));
        assert!(delays[2] >= Duration::from_millis(400) && delays[2] <= Duration::from_millis(800));
    }

    #[test]
    fn test_oversized_backoff_is_clamped() {
        let delays = RetryPolicy::new(3, u64::MAX, u64::MAX).schedule();
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(MAX_BACKOFF_MS)));
    }

    #[test]
    fn test_default_policies_schedule() {
        let run = crate::config::RunConfig::default();
        for policy in [&run.research_retry, &run.extraction_retry, &run.storage_retry] {
            assert_eq!(policy.schedule().len(), policy.max_attempts as usize - 1);
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = governed_call(
            Capability::Research,
            &governor(),
            &RetryPolicy::new(3, 1, 2),
            Duration::from_secs(1),
            &CancellationToken::new(),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(transient())
                } else {
                    Ok("done")
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, ("done", 2));
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = governed_call(
            Capability::Research,
            &governor(),
            &RetryPolicy::new(5, 1, 2),
            Duration::from_secs(1),
            &CancellationToken::new(),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::Permanent {
                    capability: Capability::Research,
                    message: "invalid key".to_string(),
                })
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retries() {
        let err = governed_call(
            Capability::Extraction,
            &governor(),
            &RetryPolicy::new(3, 1, 2),
            Duration::from_millis(10),
            &CancellationToken::new(),
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, AppError>(())
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.error.is_retryable());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = governed_call(
            Capability::Research,
            &governor(),
            &RetryPolicy::new(10, 10_000, 10_000),
            Duration::from_secs(1),
            &cancel,
            || async { Err::<(), _>(transient()) },
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
