//! JSON Lines reader with a byte-offset index.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::mapping::header_key;
use super::{ColumnMapping, Field, RawRow, SourceError, SourceReader};
use crate::models::SourceRecord;

/// One JSON object per line; blank lines are ignored.
pub struct JsonlSource {
    path: PathBuf,
    mapping: ColumnMapping,
    /// (byte offset, 1-based line number) of each non-blank line.
    lines: Vec<(u64, u64)>,
}

impl JsonlSource {
    pub fn open(path: &Path, mapping: &ColumnMapping) -> Result<Self, SourceError> {
        let mut reader = BufReader::new(open_file(path)?);
        let mut lines = Vec::new();
        let mut buf = Vec::new();
        let mut offset = 0u64;
        let mut line_no = 0u64;

        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            if !buf.iter().all(u8::is_ascii_whitespace) {
                lines.push((offset, line_no));
            }
            offset += read as u64;
        }

        Ok(Self {
            path: path.to_path_buf(),
            mapping: mapping.clone(),
            lines,
        })
    }

    fn parse_line(&self, line: &str, line_no: u64) -> RawRow {
        let value: Value =
            serde_json::from_str(line).map_err(|e| SourceError::MalformedLine {
                line: line_no,
                message: e.to_string(),
            })?;
        let Value::Object(object) = value else {
            return Err(SourceError::MalformedLine {
                line: line_no,
                message: "expected a JSON object".to_string(),
            });
        };

        let by_key: HashMap<String, &Value> =
            object.iter().map(|(k, v)| (header_key(k), v)).collect();

        let mut record = SourceRecord::default();
        for field in Field::ALL {
            let found = self
                .mapping
                .candidates(field)
                .iter()
                .find_map(|candidate| by_key.get(&header_key(candidate)));
            if let Some(text) = found.and_then(|v| value_text(v)) {
                field.assign(&mut record, &text);
            }
        }
        Ok(record)
    }
}

fn open_file(path: &Path) -> Result<File, SourceError> {
    File::open(path).map_err(|source| SourceError::Unavailable {
        path: path.to_path_buf(),
        source,
    })
}

/// Flatten a JSON value into the free-text form the normalizer expects.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_text).collect();
            Some(parts.join(", "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .filter_map(|(k, v)| value_text(v).map(|t| format!("{k}: {t}")))
                .collect();
            Some(parts.join("; "))
        }
    }
}

impl SourceReader for JsonlSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn count(&self) -> u64 {
        self.lines.len() as u64
    }

    fn slice(&self, offset: u64, limit: usize) -> Result<Vec<RawRow>, SourceError> {
        let start = offset as usize;
        if start >= self.lines.len() || limit == 0 {
            return Ok(Vec::new());
        }
        let end = (start + limit).min(self.lines.len());

        let mut file = open_file(&self.path)?;
        file.seek(SeekFrom::Start(self.lines[start].0))?;
        let mut reader = BufReader::new(file);

        let mut rows = Vec::with_capacity(end - start);
        let mut buf = Vec::new();
        for &(_, line_no) in &self.lines[start..end] {
            // Skip blank lines between indexed ones.
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf)? == 0 {
                    return Ok(rows);
                }
                if !buf.iter().all(u8::is_ascii_whitespace) {
                    break;
                }
            }
            let line = String::from_utf8_lossy(&buf);
            rows.push(self.parse_line(line.trim(), line_no));
        }
        Ok(rows)
    }
}
