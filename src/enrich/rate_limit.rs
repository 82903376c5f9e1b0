//! Global minimum-interval limiter shared by every enrichment worker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::import::StopSignal;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("stop requested while waiting for a request slot")]
    Cancelled,
}

/// Spaces requests at least `min_interval` apart across all callers.
///
/// Callers reserve the next free slot under a lock and then sleep outside
/// it, so concurrent workers queue up in order instead of racing. A server
/// asking us to slow down (429 with Retry-After) pushes every later slot
/// back.
#[derive(Debug)]
pub struct IntervalLimiter {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl IntervalLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Claim the next slot and return when it starts.
    pub async fn reserve(&self) -> Instant {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.min_interval);
        slot
    }

    /// Wait for a slot, giving up if a stop is requested first.
    pub async fn acquire(&self, stop: &StopSignal) -> Result<(), RateLimitError> {
        if stop.is_stopped() {
            return Err(RateLimitError::Cancelled);
        }
        let slot = self.reserve().await;
        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!("Rate limiting: waiting {:?}", wait);
            tokio::select! {
                _ = tokio::time::sleep_until(slot) => {}
                _ = stop.cancelled() => return Err(RateLimitError::Cancelled),
            }
        }
        Ok(())
    }

    /// Hold off all requests for at least `delay` from now.
    pub async fn defer(&self, delay: Duration) {
        let mut next = self.next_slot.lock().await;
        let until = Instant::now() + delay;
        if next.map_or(true, |at| at < until) {
            *next = Some(until);
            warn!("Rate limited by server, pausing requests for {:?}", delay);
        }
    }
}

/// Parse a Retry-After header: delta seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok().or(Some(Duration::ZERO))
}
