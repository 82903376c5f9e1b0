//! CSV/TSV reader with a positional index.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::{ByteRecord, Position, ReaderBuilder};

use super::{ColumnMapping, FieldIndex, RawRow, SourceError, SourceReader};

/// CSV file indexed by record start position.
///
/// Opening scans the file once and remembers where every record begins;
/// `slice` then seeks straight to the requested offset.
pub struct CsvSource {
    path: PathBuf,
    delimiter: u8,
    fields: FieldIndex,
    positions: Vec<Position>,
}

impl CsvSource {
    pub fn open(path: &Path, mapping: &ColumnMapping, delimiter: u8) -> Result<Self, SourceError> {
        let file = open_file(path)?;
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(file);

        let headers = reader.headers()?.clone();
        let fields = FieldIndex::from_headers(headers.iter(), mapping, path)?;

        let mut positions = Vec::new();
        let mut record = ByteRecord::new();
        loop {
            let position = reader.position().clone();
            if !reader.read_byte_record(&mut record)? {
                break;
            }
            positions.push(position);
        }

        tracing::debug!(
            "Indexed {} records in {}",
            positions.len(),
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            delimiter,
            fields,
            positions,
        })
    }
}

fn open_file(path: &Path) -> Result<File, SourceError> {
    File::open(path).map_err(|source| SourceError::Unavailable {
        path: path.to_path_buf(),
        source,
    })
}

impl SourceReader for CsvSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn count(&self) -> u64 {
        self.positions.len() as u64
    }

    fn slice(&self, offset: u64, limit: usize) -> Result<Vec<RawRow>, SourceError> {
        let start = offset as usize;
        if start >= self.positions.len() || limit == 0 {
            return Ok(Vec::new());
        }
        let end = (start + limit).min(self.positions.len());

        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .has_headers(false)
            .from_reader(open_file(&self.path)?);
        reader.seek(self.positions[start].clone())?;

        let mut rows = Vec::with_capacity(end - start);
        let mut record = ByteRecord::new();
        for _ in start..end {
            match reader.read_byte_record(&mut record) {
                Ok(true) => rows.push(Ok(self
                    .fields
                    .extract(|i| record.get(i).map(String::from_utf8_lossy)))),
                Ok(false) => break,
                Err(e) => rows.push(Err(SourceError::Csv(e))),
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_open_and_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "listings.csv",
            "Name,Address,City,State,Rating\n\
             Suds,1 Main St,Denver,CO,4.5\n\
             \"Wash, Dry & Fold\",2 Elm St,Denver,CO,4.0\n\
             Bubbles,3 Oak St,Boulder,CO,\n",
        );

        let source = CsvSource::open(&path, &ColumnMapping::default(), b',').unwrap();
        assert_eq!(source.count(), 3);

        let rows = source.slice(1, 5).unwrap();
        assert_eq!(rows.len(), 2);
        let second = rows[0].as_ref().unwrap();
        assert_eq!(second.name.as_deref(), Some("Wash, Dry & Fold"));
        assert_eq!(second.rating.as_deref(), Some("4.0"));
        let third = rows[1].as_ref().unwrap();
        assert_eq!(third.city.as_deref(), Some("Boulder"));
        assert_eq!(third.rating, None);

        assert!(source.slice(3, 5).unwrap().is_empty());
    }

    #[test]
    fn test_slice_is_repeatable_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::from("name,city,state\n");
        for i in 0..50 {
            body.push_str(&format!("Laundry {i},Denver,CO\n"));
        }
        let path = write_csv(dir.path(), "many.csv", &body);
        let source = CsvSource::open(&path, &ColumnMapping::default(), b',').unwrap();

        let late = source.slice(40, 1).unwrap();
        let early = source.slice(2, 1).unwrap();
        let late_again = source.slice(40, 1).unwrap();
        assert_eq!(
            late[0].as_ref().unwrap().name.as_deref(),
            Some("Laundry 40")
        );
        assert_eq!(
            early[0].as_ref().unwrap().name.as_deref(),
            Some("Laundry 2")
        );
        assert_eq!(late[0].as_ref().unwrap(), late_again[0].as_ref().unwrap());
    }

    #[test]
    fn test_tsv_and_short_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "listings.tsv",
            "name\tcity\tstate\tphone\nSuds\tDenver\tCO\n",
        );
        let source = CsvSource::open(&path, &ColumnMapping::default(), b'\t').unwrap();
        let rows = source.slice(0, 1).unwrap();
        let record = rows[0].as_ref().unwrap();
        assert_eq!(record.state.as_deref(), Some("CO"));
        assert_eq!(record.phone, None);
    }

    #[test]
    fn test_missing_required_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "bad.csv", "name,city\nSuds,Denver\n");
        assert!(matches!(
            CsvSource::open(&path, &ColumnMapping::default(), b','),
            Err(SourceError::MissingColumn { .. })
        ));
    }
}
