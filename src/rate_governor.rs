use crate::errors::{AppError, Capability};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Limits applied to one external capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityLimits {
    /// Maximum calls in flight at once.
    pub max_in_flight: usize,
    /// Requests-per-hour ceiling, enforced as a minimum spacing between call starts.
    /// `None` disables spacing.
    #[serde(default)]
    pub requests_per_hour: Option<u32>,
}

impl CapabilityLimits {
    pub fn new(max_in_flight: usize, requests_per_hour: Option<u32>) -> Self {
        Self {
            max_in_flight,
            requests_per_hour,
        }
    }

    /// Spacing implied by the hourly ceiling.
    pub fn min_interval(&self) -> Option<Duration> {
        self.requests_per_hour
            .filter(|rph| *rph > 0)
            .map(|rph| Duration::from_micros(3_600_000_000 / u64::from(rph)))
    }
}

/// Gate for a single capability: a FIFO semaphore bounding in-flight calls plus
/// an optional GCRA limiter (burst of one) spacing successive starts.
struct CapabilityGate {
    in_flight: Arc<Semaphore>,
    spacing: Option<DefaultDirectRateLimiter>,
}

impl CapabilityGate {
    fn new(limits: &CapabilityLimits) -> Self {
        let spacing = limits
            .min_interval()
            .and_then(Quota::with_period)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));

        Self {
            in_flight: Arc::new(Semaphore::new(limits.max_in_flight.max(1))),
            spacing,
        }
    }
}

/// Scoped permit for one external call. The in-flight slot is returned when the
/// permit is dropped, on every exit path including task cancellation.
#[derive(Debug)]
pub struct Permit {
    capability: Capability,
    acquired_at: Instant,
    _slot: OwnedSemaphorePermit,
}

impl Permit {
    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Batch-scoped throttle shared by reference among concurrently running contact pipelines.
pub struct RateGovernor {
    research: CapabilityGate,
    extraction: CapabilityGate,
}

impl RateGovernor {
    pub fn new(research: &CapabilityLimits, extraction: &CapabilityLimits) -> Self {
        Self {
            research: CapabilityGate::new(research),
            extraction: CapabilityGate::new(extraction),
        }
    }

    fn gate(&self, capability: Capability) -> &CapabilityGate {
        match capability {
            Capability::Research => &self.research,
            Capability::Extraction => &self.extraction,
        }
    }

    /// Suspends until both an in-flight slot and a spacing token are available.
    pub async fn acquire(&self, capability: Capability) -> Result<Permit, AppError> {
        let gate = self.gate(capability);
        let waited = Instant::now();

        let slot = gate
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError(format!("{} gate closed", capability)))?;

        if let Some(spacing) = &gate.spacing {
            spacing.until_ready().await;
        }

        let wait = waited.elapsed();
        if wait > Duration::from_millis(500) {
            tracing::debug!(capability = %capability, waited_ms = wait.as_millis() as u64, "Rate governor delayed call");
        }

        Ok(Permit {
            capability,
            acquired_at: Instant::now(),
            _slot: slot,
        })
    }

    /// Free in-flight slots for a capability.
    pub fn available(&self, capability: Capability) -> usize {
        self.gate(capability).in_flight.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn governor(max_in_flight: usize, rph: Option<u32>) -> Arc<RateGovernor> {
        Arc::new(RateGovernor::new(
            &CapabilityLimits::new(max_in_flight, rph),
            &CapabilityLimits::new(1, None),
        ))
    }

    #[tokio::test]
    async fn test_in_flight_bound_is_respected() {
        let governor = governor(2, None);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let governor = governor.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = governor.acquire(Capability::Research).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(governor.available(Capability::Research), 2);
    }

    #[tokio::test]
    async fn test_permit_released_when_task_aborted() {
        let governor = governor(1, None);
        let held = governor.clone();
        let task = tokio::spawn(async move {
            let _permit = held.acquire(Capability::Research).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(governor.available(Capability::Research), 0);

        task.abort();
        let _ = task.await;
        assert_eq!(governor.available(Capability::Research), 1);
    }

    #[tokio::test]
    async fn test_spacing_between_calls() {
        // 36_000 per hour = one every 100ms
        let governor = governor(4, Some(36_000));
        let start = Instant::now();
        for _ in 0..3 {
            let _permit = governor.acquire(Capability::Research).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[tokio::test]
    async fn test_capabilities_are_independent() {
        let governor = governor(1, None);
        let _research = governor.acquire(Capability::Research).await.unwrap();
        let extraction = tokio::time::timeout(
            Duration::from_millis(100),
            governor.acquire(Capability::Extraction),
        )
        .await;
        assert!(extraction.is_ok());
    }

    #[test]
    fn test_min_interval() {
        assert_eq!(
            CapabilityLimits::new(1, Some(3600)).min_interval(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(CapabilityLimits::new(1, None).min_interval(), None);
        assert_eq!(CapabilityLimits::new(1, Some(0)).min_interval(), None);
    }
}
