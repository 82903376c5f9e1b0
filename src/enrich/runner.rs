//! Bounded-concurrency driver for enrichment passes.

use std::future::Future;

use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use tracing::{debug, warn};

use super::{EnrichConfig, EnrichError};
use crate::import::{backoff_delay, Pacer, StopSignal};

/// How one unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The row was written.
    Updated,
    /// The lookup succeeded but nothing changed.
    Unchanged,
    /// Nothing usable came back.
    Skipped(String),
}

/// Per-unit retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl From<&EnrichConfig> for RetryPolicy {
    fn from(config: &EnrichConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently, or retries run out.
    /// A server-supplied Retry-After wins over the computed delay.
    pub async fn run<T, F, Fut>(
        &self,
        pacer: &dyn Pacer,
        stop: &StopSignal,
        label: &str,
        mut op: F,
    ) -> Result<T, EnrichError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EnrichError>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    if stop.is_stopped() {
                        return Err(EnrichError::Cancelled);
                    }
                    retries += 1;
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| backoff_delay(retries, self.base_ms, self.max_ms));
                    warn!(
                        "{}: {} (retry {}/{} in {:?})",
                        label, e, retries, self.max_retries, delay
                    );
                    pacer.pause(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Totals for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub selected: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Units not attempted because a stop was requested.
    pub cancelled: u64,
}

impl PassSummary {
    fn record(&mut self, result: Option<Result<UnitOutcome, EnrichError>>) {
        match result {
            None | Some(Err(EnrichError::Cancelled)) => self.cancelled += 1,
            Some(Ok(UnitOutcome::Updated)) => self.updated += 1,
            Some(Ok(UnitOutcome::Unchanged)) => self.unchanged += 1,
            Some(Ok(UnitOutcome::Skipped(_))) => self.skipped += 1,
            Some(Err(_)) => self.failed += 1,
        }
    }
}

/// Works a list of units through at most `concurrency` workers at a time.
///
/// Stop requests are checked before each unit starts; units already in
/// flight finish.
pub struct PassRunner {
    concurrency: usize,
    stop: StopSignal,
    progress: Option<ProgressBar>,
}

impl PassRunner {
    pub fn new(concurrency: usize, stop: StopSignal) -> Self {
        Self {
            concurrency: concurrency.max(1),
            stop,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stop(&self) -> &StopSignal {
        &self.stop
    }

    pub async fn run<U, L, F, Fut>(&self, units: Vec<U>, label: L, work: F) -> PassSummary
    where
        L: Fn(&U) -> String,
        F: Fn(U) -> Fut,
        Fut: Future<Output = Result<UnitOutcome, EnrichError>>,
    {
        let mut summary = PassSummary {
            selected: units.len() as u64,
            ..Default::default()
        };
        if let Some(pb) = &self.progress {
            pb.set_length(summary.selected);
        }

        let stop = &self.stop;
        let label = &label;
        let work = &work;
        let mut results = stream::iter(units)
            .map(|unit| async move {
                if stop.is_stopped() {
                    return None;
                }
                let name = label(&unit);
                let result = work(unit).await;
                match &result {
                    Ok(UnitOutcome::Skipped(reason)) => debug!("{}: skipped ({})", name, reason),
                    Err(EnrichError::Cancelled) | Ok(_) => {}
                    Err(e) => warn!("{}: {}", name, e),
                }
                Some(result)
            })
            .buffer_unordered(self.concurrency);

        while let Some(result) = results.next().await {
            summary.record(result);
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
        }

        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingPacer {
        pauses: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Pacer for RecordingPacer {
        async fn pause(&self, duration: Duration) {
            self.pauses.lock().unwrap().push(duration);
        }
    }

    fn unavailable() -> EnrichError {
        EnrichError::Status {
            status: 503,
            url: "https://geo.invalid".to_string(),
            retry_after: None,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_ms: 100,
            max_ms: 250,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let pacer = RecordingPacer::default();
        let calls = &AtomicUsize::new(0);
        let result = policy()
            .run(&pacer, &StopSignal::default(), "unit", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(
            *pacer.pauses.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_retry_gives_up_and_skips_permanent_errors() {
        let pacer = RecordingPacer::default();
        let calls = &AtomicUsize::new(0);
        let result: Result<(), _> = policy()
            .run(&pacer, &StopSignal::default(), "unit", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(pacer.pauses.lock().unwrap()[2], Duration::from_millis(250));

        let calls = &AtomicUsize::new(0);
        let result: Result<(), _> = policy()
            .run(&pacer, &StopSignal::default(), "unit", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EnrichError::Status {
                    status: 404,
                    url: "https://geo.invalid".to_string(),
                    retry_after: None,
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_after_overrides_backoff() {
        let pacer = RecordingPacer::default();
        let calls = &AtomicUsize::new(0);
        policy()
            .run(&pacer, &StopSignal::default(), "unit", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EnrichError::Status {
                        status: 429,
                        url: "https://geo.invalid".to_string(),
                        retry_after: Some(Duration::from_secs(9)),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(*pacer.pauses.lock().unwrap(), vec![Duration::from_secs(9)]);
    }

    #[tokio::test]
    async fn test_pass_respects_concurrency_bound() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let runner = PassRunner::new(3, StopSignal::default());

        let summary = runner
            .run(
                (0..12).collect(),
                |i: &i32| format!("unit {i}"),
                |i| {
                    let active = &active;
                    let peak = &peak;
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        match i % 4 {
                            0 => Ok(UnitOutcome::Updated),
                            1 => Ok(UnitOutcome::Unchanged),
                            2 => Ok(UnitOutcome::Skipped("no match".to_string())),
                            _ => Err(unavailable()),
                        }
                    }
                },
            )
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(
            summary,
            PassSummary {
                selected: 12,
                updated: 3,
                unchanged: 3,
                skipped: 3,
                failed: 3,
                cancelled: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_stopped_pass_attempts_nothing() {
        let stop = StopSignal::default();
        stop.request_stop();
        let runner = PassRunner::new(2, stop);
        let summary = runner
            .run(
                vec![1, 2, 3],
                |i: &i32| i.to_string(),
                |_| async { Ok(UnitOutcome::Updated) },
            )
            .await;
        assert_eq!(summary.cancelled, 3);
        assert_eq!(summary.updated, 0);
    }
}
