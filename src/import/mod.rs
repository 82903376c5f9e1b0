//! Listing import pipeline.
//!
//! A run reads a [`SourceReader`] in batches, turns every row into a
//! [`CanonicalRecord`](crate::models::CanonicalRecord) with the
//! [`RecordNormalizer`], resolves its state and city through the
//! [`DimensionResolver`], and writes it through the [`UpsertSink`]. The
//! [`BatchRunner`] owns the loop, and a [`ProgressStore`] makes it
//! resumable.

pub mod control;
pub mod enricher;
pub mod error;
pub mod lookups;
pub mod normalize;
pub mod plan;
pub mod progress;
pub mod resolver;
pub mod runner;
pub mod sink;
pub mod slug;
pub mod source;

pub use control::{backoff_delay, InstanceLock, Pacer, StopSignal, TokioPacer};
pub use enricher::{NoEnrichment, RecordEnricher, SeoFields};
pub use error::ImportError;
pub use lookups::StateLookup;
pub use normalize::{NormalizeError, NormalizerDefaults, RecordNormalizer, ScoringConfig};
pub use plan::{PartitionMode, WorkBatch, WorkPlan};
pub use progress::{
    Checkpoint, CheckpointBackend, DbProgressStore, ErrorEntry, FileProgressStore, ProgressStore,
};
pub use resolver::DimensionResolver;
pub use runner::{BatchRunner, RunContext, RunEvent, RunState, RunSummary, RunnerConfig};
pub use sink::{IdempotencyKey, UpsertOutcome, UpsertSink};
pub use source::{open_source, ColumnMapping, InMemorySource, SourceError, SourceReader};
