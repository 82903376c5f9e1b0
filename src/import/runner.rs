//! Batch runner: drives a source through normalization, dimension
//! resolution and the upsert sink, one transaction per batch.
//!
//! The runner is an explicit state machine:
//!
//! ```text
//! Idle -> SelectingWork -> ProcessingBatch -> Checkpointing -> SelectingWork ... -> Done
//!                               |                                  ^
//!                               +---------> ErrorBackoff ----------+
//! ```
//!
//! The checkpoint only advances after a batch commits. A batch that fails
//! as a whole is rolled back and retried at the same position after an
//! escalating delay; a record that fails on its own is rolled back to its
//! savepoint, logged, and counted, and the rest of the batch proceeds.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::AsyncConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::control::{backoff_delay, Pacer, StopSignal, TokioPacer};
use super::enricher::{NoEnrichment, RecordEnricher};
use super::error::ImportError;
use super::normalize::RecordNormalizer;
use super::plan::{PartitionMode, WorkBatch, WorkPlan};
use super::progress::{Checkpoint, CheckpointBackend, ErrorEntry, ProgressStore};
use super::resolver::DimensionResolver;
use super::sink::{IdempotencyKey, UpsertSink};
use super::source::{RawRow, SourceReader};
use crate::models::CanonicalRecord;
use crate::repository::dimension::recount;
use crate::repository::models::NewListing;
use crate::repository::{now_rfc3339, DbContext, SqliteConn};

/// Runner settings (the `[import]` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Records per transaction.
    pub batch_size: usize,
    /// Pause between batches, in milliseconds.
    pub pause_ms: u64,
    /// First retry delay after a failed batch.
    pub backoff_base_ms: u64,
    /// Longest retry delay.
    pub backoff_max_ms: u64,
    /// Consecutive failed batches before giving up (0 = never).
    pub max_consecutive_failures: u32,
    /// Recent errors kept in the checkpoint.
    pub max_error_log: usize,
    pub partition: PartitionMode,
    /// Restrict the run to these states (abbreviations or names).
    pub states: Vec<String>,
    pub idempotency_key: IdempotencyKey,
    pub checkpoint: CheckpointBackend,
    /// Move the checkpoint aside once the run completes.
    pub archive_on_complete: bool,
    /// Stop after this many records in this invocation.
    #[serde(skip)]
    pub max_records: Option<u64>,
    /// Normalize and count without writing anything.
    #[serde(skip)]
    pub dry_run: bool,
    /// Discard any existing checkpoint before starting.
    #[serde(skip)]
    pub restart: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pause_ms: 250,
            backoff_base_ms: 5_000,
            backoff_max_ms: 300_000,
            max_consecutive_failures: 5,
            max_error_log: 500,
            partition: PartitionMode::None,
            states: Vec::new(),
            idempotency_key: IdempotencyKey::Slug,
            checkpoint: CheckpointBackend::File,
            archive_on_complete: false,
            max_records: None,
            dry_run: false,
            restart: false,
        }
    }
}

/// Runner states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    SelectingWork,
    ProcessingBatch,
    Checkpointing,
    ErrorBackoff,
    Done,
}

/// Progress notifications for a UI or log.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Started {
        source: String,
        total: u64,
        position: u64,
        partitions: usize,
    },
    BatchCommitted {
        position: u64,
        total: u64,
        partition: Option<String>,
        imported: u64,
        skipped: u64,
        errors: u64,
        records_per_minute: f64,
    },
    BackingOff {
        position: u64,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Finished(RunSummary),
}

/// What one committed batch did.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub imported: u64,
    pub skipped: u64,
    pub errors: Vec<ErrorEntry>,
    touched_states: BTreeSet<i32>,
    touched_cities: BTreeSet<i32>,
}

impl BatchOutcome {
    fn fail(&mut self, offset: u64, key: Option<String>, error: &ImportError) {
        tracing::debug!("Record at offset {} failed: {}", offset, error);
        let mut entry = ErrorEntry::new(error.to_string()).at(offset);
        if let Some(key) = key {
            entry = entry.with_key(key);
        }
        self.errors.push(entry);
    }

    fn record(&mut self, written: RecordWrite) {
        if written.inserted {
            self.imported += 1;
        } else {
            self.skipped += 1;
        }
        self.touched_states.insert(written.state_id);
        self.touched_cities.insert(written.city_id);
    }

    pub fn processed(&self) -> u64 {
        self.imported + self.skipped + self.errors.len() as u64
    }
}

/// Totals for one invocation of [`BatchRunner::run`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub imported: u64,
    pub skipped: u64,
    pub errors: u64,
    pub batches: u64,
    /// Plan position reached.
    pub position: u64,
    /// Plan size.
    pub total: u64,
    /// The work order was exhausted.
    pub completed: bool,
    /// A stop request or record limit ended the run early.
    pub stopped: bool,
    /// The checkpoint was already marked done; nothing was processed.
    pub already_done: bool,
    pub dry_run: bool,
    pub elapsed: Duration,
    pub checkpoint: Checkpoint,
}

struct RecordWrite {
    inserted: bool,
    state_id: i32,
    city_id: i32,
}

/// A record after the pure part of the pipeline.
struct Prepared {
    offset: u64,
    label: Option<String>,
    record: Result<CanonicalRecord, ImportError>,
}

/// Everything a run owns: the store handle, the dimension cache and the
/// per-record pipeline stages.
pub struct RunContext {
    pub db: DbContext,
    pub resolver: DimensionResolver,
    pub sink: UpsertSink,
    pub normalizer: RecordNormalizer,
    pub enricher: Arc<dyn RecordEnricher>,
}

impl RunContext {
    pub fn new(db: DbContext, normalizer: RecordNormalizer, key: IdempotencyKey) -> Self {
        Self {
            db,
            resolver: DimensionResolver::new(),
            sink: UpsertSink::new(key),
            normalizer,
            enricher: Arc::new(NoEnrichment),
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn RecordEnricher>) -> Self {
        self.enricher = enricher;
        self
    }
}

pub struct BatchRunner {
    config: RunnerConfig,
    ctx: RunContext,
    source: Box<dyn SourceReader>,
    progress: Box<dyn ProgressStore>,
    pacer: Arc<dyn Pacer>,
    stop: StopSignal,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl BatchRunner {
    pub fn new(
        config: RunnerConfig,
        ctx: RunContext,
        source: Box<dyn SourceReader>,
        progress: Box<dyn ProgressStore>,
    ) -> Self {
        let stop = StopSignal::default();
        Self {
            config,
            ctx,
            source,
            progress,
            pacer: Arc::new(TokioPacer::new(stop.clone())),
            stop,
            events: None,
        }
    }

    /// Use a stop signal shared with the caller. Also rewires the default
    /// pacer so pauses end early on a stop request.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.pacer = Arc::new(TokioPacer::new(stop.clone()));
        self.stop = stop;
        self
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Run until the work order is exhausted, a stop is requested, the
    /// record limit is reached, or batch retries are exhausted.
    pub async fn run(&mut self) -> Result<RunSummary, ImportError> {
        let started = Instant::now();
        let plan = WorkPlan::build(
            self.source.as_ref(),
            self.config.partition,
            &self.config.states,
            self.ctx.normalizer.lookup(),
        )?;
        for (partition, size) in plan.partition_sizes() {
            let label = if partition.is_empty() {
                "(no state)"
            } else {
                partition.as_str()
            };
            tracing::debug!("Partition {}: {} records", label, size);
        }

        let mut summary = RunSummary {
            total: plan.len(),
            dry_run: self.config.dry_run,
            ..Default::default()
        };
        let mut checkpoint = Checkpoint::default();
        let mut pending: Option<(WorkBatch, Vec<RawRow>)> = None;
        let mut committed: Option<(WorkBatch, BatchOutcome, Duration)> = None;
        let mut last_error: Option<ImportError> = None;
        let mut failures = 0u32;
        let mut processed_this_run = 0u64;
        let mut state = RunState::Idle;

        loop {
            state = match state {
                RunState::Idle => {
                    if self.config.restart && !self.config.dry_run && self.progress.clear().await? {
                        tracing::info!("Discarded checkpoint {}", self.progress.location());
                    }
                    if !self.config.restart {
                        checkpoint = self.progress.load().await?;
                    }

                    if checkpoint.done {
                        tracing::info!(
                            "Checkpoint {} is marked done; nothing to do",
                            self.progress.location()
                        );
                        summary.already_done = true;
                        RunState::Done
                    } else {
                        let source = self.source.describe();
                        self.check_resumable(&checkpoint, &plan)?;
                        if checkpoint.position > 0 {
                            tracing::info!(
                                "Resuming {} at position {} of {}",
                                source,
                                checkpoint.position,
                                plan.len()
                            );
                        }
                        checkpoint.source = Some(source.clone());
                        checkpoint.total_records = Some(plan.len());
                        checkpoint.plan = Some(plan.fingerprint());

                        self.emit(RunEvent::Started {
                            source,
                            total: plan.len(),
                            position: checkpoint.position,
                            partitions: plan.partition_sizes().len(),
                        })
                        .await;
                        RunState::SelectingWork
                    }
                }

                RunState::SelectingWork => {
                    let budget = match self.config.max_records {
                        Some(max) => max.saturating_sub(processed_this_run),
                        None => u64::MAX,
                    };
                    let size = (self.config.batch_size.max(1) as u64).min(budget) as usize;

                    if self.stop.is_stopped() {
                        summary.stopped = true;
                        RunState::Done
                    } else if size == 0 {
                        tracing::info!("Record limit reached");
                        summary.stopped = true;
                        RunState::Done
                    } else {
                        match plan.next_batch(checkpoint.position, size) {
                            None => {
                                summary.completed = true;
                                RunState::Done
                            }
                            Some(batch) => match self.source.read_at(&batch.offsets) {
                                Ok(rows) => {
                                    pending = Some((batch, rows));
                                    RunState::ProcessingBatch
                                }
                                Err(e) => {
                                    last_error = Some(e.into());
                                    RunState::ErrorBackoff
                                }
                            },
                        }
                    }
                }

                RunState::ProcessingBatch => match pending.take() {
                    None => RunState::SelectingWork,
                    Some((batch, rows)) => {
                        let batch_started = Instant::now();
                        match self.process_batch(&batch, rows).await {
                            Ok(outcome) => {
                                committed = Some((batch, outcome, batch_started.elapsed()));
                                RunState::Checkpointing
                            }
                            Err(e) => {
                                last_error = Some(e);
                                RunState::ErrorBackoff
                            }
                        }
                    }
                },

                RunState::Checkpointing => match committed.take() {
                    None => RunState::SelectingWork,
                    Some((batch, outcome, elapsed)) => {
                        let minutes = elapsed.as_secs_f64().max(0.001) / 60.0;
                        checkpoint.update_rate(batch.len() as f64 / minutes);
                        checkpoint.position = batch.end();
                        checkpoint.partition = batch.partition.clone();
                        checkpoint.total_imported += outcome.imported;
                        checkpoint.total_skipped += outcome.skipped;
                        checkpoint.total_errors += outcome.errors.len() as u64;
                        checkpoint.push_errors(outcome.errors.iter().cloned(), self.config.max_error_log);
                        checkpoint.last_update = Utc::now();

                        if !self.config.dry_run {
                            self.progress.save(&checkpoint).await?;
                        }
                        failures = 0;

                        processed_this_run += batch.len() as u64;
                        summary.batches += 1;
                        summary.imported += outcome.imported;
                        summary.skipped += outcome.skipped;
                        summary.errors += outcome.errors.len() as u64;

                        self.log_batch(&checkpoint, &outcome, plan.len());
                        self.emit(RunEvent::BatchCommitted {
                            position: checkpoint.position,
                            total: plan.len(),
                            partition: batch.partition,
                            imported: outcome.imported,
                            skipped: outcome.skipped,
                            errors: outcome.errors.len() as u64,
                            records_per_minute: checkpoint.records_per_minute,
                        })
                        .await;

                        if self.stop.is_stopped() {
                            summary.stopped = true;
                            RunState::Done
                        } else {
                            self.pacer
                                .pause(Duration::from_millis(self.config.pause_ms))
                                .await;
                            RunState::SelectingWork
                        }
                    }
                },

                RunState::ErrorBackoff => {
                    failures += 1;
                    let error = last_error
                        .take()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".to_string());

                    let cap = self.config.max_consecutive_failures;
                    if cap > 0 && failures >= cap {
                        tracing::error!(
                            "Batch at position {} failed {} times in a row, giving up: {}",
                            checkpoint.position,
                            failures,
                            error
                        );
                        return Err(ImportError::RetriesExhausted {
                            attempts: failures,
                            position: checkpoint.position,
                            last_error: error,
                        });
                    }

                    let delay = backoff_delay(
                        failures,
                        self.config.backoff_base_ms,
                        self.config.backoff_max_ms,
                    );
                    tracing::warn!(
                        "Batch at position {} failed (attempt {}): {}; retrying in {:?}",
                        checkpoint.position,
                        failures,
                        error,
                        delay
                    );
                    self.emit(RunEvent::BackingOff {
                        position: checkpoint.position,
                        attempt: failures,
                        delay,
                        error,
                    })
                    .await;
                    self.pacer.pause(delay).await;
                    RunState::SelectingWork
                }

                RunState::Done => break,
            };
        }

        if summary.completed && !self.config.dry_run {
            self.finish(&mut checkpoint).await?;
        }

        summary.position = checkpoint.position;
        summary.elapsed = started.elapsed();
        summary.checkpoint = checkpoint;
        self.emit(RunEvent::Finished(summary.clone())).await;
        Ok(summary)
    }

    /// Refuse to continue a checkpoint whose positions index a different
    /// work order than `plan`.
    fn check_resumable(&self, checkpoint: &Checkpoint, plan: &WorkPlan) -> Result<(), ImportError> {
        if checkpoint.position == 0 {
            return Ok(());
        }
        let changed = |message: String| ImportError::PlanChanged {
            location: self.progress.location(),
            message,
        };
        let current = plan.fingerprint();

        match &checkpoint.plan {
            Some(previous) if !current.can_resume(previous) => {
                return Err(changed(format!("was {previous}, now {current}")));
            }
            Some(_) => {}
            None => {
                if let Some(previous) = checkpoint.total_records {
                    if previous != current.len {
                        return Err(changed(format!(
                            "was {previous} records, now {}",
                            current.len
                        )));
                    }
                }
            }
        }

        if checkpoint.position > current.len {
            return Err(changed(format!(
                "position {} is past the end ({} records)",
                checkpoint.position, current.len
            )));
        }

        if let Some(expected) = checkpoint.partition.as_deref() {
            let found = plan.partition_at(checkpoint.position - 1);
            if found != Some(expected) {
                return Err(changed(format!(
                    "last committed partition was {expected}, plan has {}",
                    found.unwrap_or("none")
                )));
            }
        }
        Ok(())
    }

    /// Final recount, completion flag and optional archive.
    async fn finish(&mut self, checkpoint: &mut Checkpoint) -> Result<(), ImportError> {
        self.ctx.db.dimensions().recount_all().await?;
        checkpoint.done = true;
        checkpoint.last_update = Utc::now();
        self.progress.save(checkpoint).await?;
        tracing::info!(
            "Import complete: {} imported, {} skipped, {} errors",
            checkpoint.total_imported,
            checkpoint.total_skipped,
            checkpoint.total_errors
        );
        if self.config.archive_on_complete {
            self.progress.archive().await?;
        }
        Ok(())
    }

    fn log_batch(&self, checkpoint: &Checkpoint, outcome: &BatchOutcome, total: u64) {
        let eta = checkpoint
            .eta_minutes()
            .map(|m| format!("{m:.1} min"))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!(
            "Position {}/{}: +{} imported, {} skipped, {} errors ({:.0} records/min, ETA {})",
            checkpoint.position,
            total,
            outcome.imported,
            outcome.skipped,
            outcome.errors.len(),
            checkpoint.records_per_minute,
            eta
        );
    }

    /// Normalize a batch, then write it in one transaction.
    async fn process_batch(
        &mut self,
        batch: &WorkBatch,
        rows: Vec<RawRow>,
    ) -> Result<BatchOutcome, ImportError> {
        let normalizer = &self.ctx.normalizer;
        let prepared: Vec<Prepared> = batch
            .offsets
            .iter()
            .zip(rows)
            .map(|(&offset, row)| {
                let label = row.as_ref().ok().map(|r| r.label());
                let record = row
                    .map_err(ImportError::from)
                    .and_then(|raw| normalizer.normalize(&raw).map_err(ImportError::from));
                Prepared {
                    offset,
                    label,
                    record,
                }
            })
            .collect();

        if self.config.dry_run {
            let mut outcome = BatchOutcome::default();
            for item in prepared {
                match item.record {
                    Ok(_) => outcome.imported += 1,
                    Err(e) => outcome.fail(item.offset, item.label, &e),
                }
            }
            return Ok(outcome);
        }

        let now = now_rfc3339();
        let mut conn = self.ctx.db.connect().await?;
        let mark = self.ctx.resolver.mark();

        let RunContext {
            resolver,
            sink,
            enricher,
            ..
        } = &mut self.ctx;
        let sink = *sink;
        let enricher = enricher.clone();

        let result = conn
            .transaction::<_, ImportError, _>(|conn| {
                async move {
                    write_batch(conn, resolver, sink, enricher.as_ref(), prepared, &now).await
                }
                .scope_boxed()
            })
            .await;

        match result {
            Ok(outcome) => {
                self.ctx.resolver.commit();
                Ok(outcome)
            }
            Err(e) => {
                self.ctx.resolver.rollback_to(mark);
                Err(e)
            }
        }
    }
}

/// Write every prepared record, each under its own savepoint, then
/// recompute the counts of the dimensions the batch touched.
async fn write_batch(
    conn: &mut SqliteConn,
    resolver: &mut DimensionResolver,
    sink: UpsertSink,
    enricher: &dyn RecordEnricher,
    prepared: Vec<Prepared>,
    now: &str,
) -> Result<BatchOutcome, ImportError> {
    let mut outcome = BatchOutcome::default();

    for item in prepared {
        let record = match item.record {
            Ok(record) => record,
            Err(e) => {
                outcome.fail(item.offset, item.label, &e);
                continue;
            }
        };

        let offset = item.offset;
        let mark = resolver.mark();
        let result = conn
            .transaction::<_, ImportError, _>(|conn| {
                let resolver = &mut *resolver;
                let record = &record;
                async move { write_record(conn, resolver, sink, enricher, record, offset, now).await }
                    .scope_boxed()
            })
            .await;

        match result {
            Ok(written) => outcome.record(written),
            Err(e) if e.is_record_level() => {
                resolver.rollback_to(mark);
                outcome.fail(offset, Some(record.natural_key()), &e);
            }
            Err(e) => return Err(e),
        }
    }

    let states: Vec<i32> = outcome.touched_states.iter().copied().collect();
    let cities: Vec<i32> = outcome.touched_cities.iter().copied().collect();
    recount(conn, &states, &cities).await?;

    Ok(outcome)
}

async fn write_record(
    conn: &mut SqliteConn,
    resolver: &mut DimensionResolver,
    sink: UpsertSink,
    enricher: &dyn RecordEnricher,
    record: &CanonicalRecord,
    offset: u64,
    now: &str,
) -> Result<RecordWrite, ImportError> {
    let state_id = resolver.resolve_state(conn, &record.state).await?;
    let city_id = resolver
        .resolve_city(conn, state_id, &record.city, &record.city_slug)
        .await?;

    let mut listing = NewListing::from_canonical(record, state_id, city_id, offset, now);
    let seo = enricher.enrich(record);
    listing.seo_title = seo.title;
    listing.seo_description = seo.description;

    let upsert = sink.upsert(conn, &listing).await?;
    Ok(RecordWrite {
        inserted: upsert.inserted,
        state_id,
        city_id,
    })
}
