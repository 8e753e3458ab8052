use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::debug;

use super::AnalysisError;

/// Shared admission state for remote analysis calls: a counting semaphore
/// bounding concurrent requests, plus a pause deadline honored before each
/// acquisition. Rate-limit responses extend the deadline; calls already in
/// flight are unaffected.
pub struct RateGate {
    permits: Semaphore,
    paused_until: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Semaphore::new(max_concurrency.max(1)),
            paused_until: Mutex::new(None),
        }
    }

    /// Waits out any active pause, then takes a call permit. Re-checks the
    /// deadline after sleeping since another caller may have extended it.
    pub async fn admit(&self) -> Result<SemaphorePermit<'_>, AnalysisError> {
        loop {
            let deadline = *self.paused_until.lock().await;
            match deadline {
                Some(until) if until > Instant::now() => tokio::time::sleep_until(until).await,
                _ => break,
            }
        }
        self.permits.acquire().await.map_err(|_| AnalysisError::Fatal {
            reason: "analysis admission gate closed".into(),
        })
    }

    /// Suspends new admissions for `retry_after`. Overlapping suspensions
    /// keep the furthest deadline.
    pub async fn suspend(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut paused = self.paused_until.lock().await;
        match *paused {
            Some(existing) if existing >= until => {}
            _ => {
                *paused = Some(until);
                debug!(
                    pause_ms = retry_after.as_millis() as u64,
                    "analysis submissions suspended"
                );
            }
        }
    }
}
