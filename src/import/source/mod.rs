//! Source readers.
//!
//! A source is a finite, re-readable sequence of raw records addressed by
//! offset. Readers index the file once on open so that any batch can be
//! read again later without scanning from the start, which is what makes
//! resuming from a checkpoint cheap.

mod csv_source;
mod jsonl_source;
mod mapping;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use csv_source::CsvSource;
pub use jsonl_source::JsonlSource;
pub use mapping::{ColumnMapping, Field, FieldIndex};

use crate::models::SourceRecord;

/// One row as read: either a record or the reason the row is unreadable.
pub type RawRow = Result<SourceRecord, SourceError>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported source format '{0}' (expected csv, tsv, jsonl or ndjson)")]
    UnsupportedFormat(String),

    #[error("{}: no column for required field '{field}' (tried: {candidates})", path.display())]
    MissingColumn {
        path: PathBuf,
        field: &'static str,
        candidates: String,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("line {line}: {message}")]
    MalformedLine { line: u64, message: String },

    #[error("source changed: expected {expected} records at offset {offset}, found {found}")]
    Truncated {
        offset: u64,
        expected: usize,
        found: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Whether this error concerns a single row rather than the whole source.
    pub fn is_row_level(&self) -> bool {
        matches!(self, Self::Csv(_) | Self::MalformedLine { .. })
    }
}

/// Random-access reader over a tabular dataset.
pub trait SourceReader: Send + Sync {
    /// Human-readable name for logs.
    fn describe(&self) -> String;

    /// Total number of records.
    fn count(&self) -> u64;

    /// Up to `limit` rows starting at `offset`. Past the end yields an empty vec.
    fn slice(&self, offset: u64, limit: usize) -> Result<Vec<RawRow>, SourceError>;

    /// Rows at arbitrary ascending offsets, read as contiguous runs.
    fn read_at(&self, offsets: &[u64]) -> Result<Vec<RawRow>, SourceError> {
        let mut rows = Vec::with_capacity(offsets.len());
        let mut i = 0;
        while i < offsets.len() {
            let start = offsets[i];
            let mut len = 1;
            while i + len < offsets.len() && offsets[i + len] == start + len as u64 {
                len += 1;
            }

            let chunk = self.slice(start, len)?;
            if chunk.len() != len {
                return Err(SourceError::Truncated {
                    offset: start,
                    expected: len,
                    found: chunk.len(),
                });
            }
            rows.extend(chunk);
            i += len;
        }
        Ok(rows)
    }
}

/// Open a source file, choosing the reader by extension.
pub fn open_source(
    path: &Path,
    mapping: &ColumnMapping,
) -> Result<Box<dyn SourceReader>, SourceError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "csv" => Ok(Box::new(CsvSource::open(path, mapping, b',')?)),
        "tsv" | "tab" => Ok(Box::new(CsvSource::open(path, mapping, b'\t')?)),
        "jsonl" | "ndjson" => Ok(Box::new(JsonlSource::open(path, mapping)?)),
        _ => Err(SourceError::UnsupportedFormat(ext)),
    }
}

/// Records held in memory, for programmatic imports and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    name: String,
    records: Vec<SourceRecord>,
}

impl InMemorySource {
    pub fn new(name: &str, records: Vec<SourceRecord>) -> Self {
        Self {
            name: name.to_string(),
            records,
        }
    }
}

impl SourceReader for InMemorySource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn count(&self) -> u64 {
        self.records.len() as u64
    }

    fn slice(&self, offset: u64, limit: usize) -> Result<Vec<RawRow>, SourceError> {
        Ok(self
            .records
            .iter()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .map(Ok)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(rows: Vec<RawRow>) -> Vec<String> {
        rows.into_iter()
            .map(|r| r.unwrap().name.unwrap_or_default())
            .collect()
    }

    fn source() -> InMemorySource {
        InMemorySource::new(
            "memory",
            (0..6)
                .map(|i| SourceRecord::new(&format!("L{i}"), "Denver", "CO"))
                .collect(),
        )
    }

    #[test]
    fn test_in_memory_slice() {
        let src = source();
        assert_eq!(src.count(), 6);
        assert_eq!(names(src.slice(4, 10).unwrap()), vec!["L4", "L5"]);
        assert!(src.slice(6, 3).unwrap().is_empty());
    }

    #[test]
    fn test_read_at_runs() {
        let src = source();
        assert_eq!(
            names(src.read_at(&[0, 1, 3, 5]).unwrap()),
            vec!["L0", "L1", "L3", "L5"]
        );
    }

    #[test]
    fn test_read_at_past_end_is_truncation() {
        let src = source();
        let err = src.read_at(&[5, 6]).unwrap_err();
        assert!(matches!(err, SourceError::Truncated { offset: 5, .. }));
        assert!(!err.is_row_level());
    }

    #[test]
    fn test_open_source_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let mapping = ColumnMapping::default();

        let xlsx = dir.path().join("listings.xlsx");
        std::fs::write(&xlsx, b"").unwrap();
        assert!(matches!(
            open_source(&xlsx, &mapping),
            Err(SourceError::UnsupportedFormat(ext)) if ext == "xlsx"
        ));

        let missing = dir.path().join("missing.csv");
        assert!(matches!(
            open_source(&missing, &mapping),
            Err(SourceError::Unavailable { .. })
        ));
    }
}
