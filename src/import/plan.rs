//! Work order for a run.
//!
//! The plan maps checkpoint positions to source offsets. Without
//! partitioning or filtering it is simply the source order. Partitioning
//! by state groups records per state (alphabetically, source order within
//! a state) so that a run can be watched, stopped and resumed state by
//! state. The plan is a pure function of the source contents and the
//! configuration, so a resumed run rebuilds exactly the same order.

use serde::{Deserialize, Serialize};

use super::lookups::StateLookup;
use super::source::{SourceError, SourceReader};

/// Records read per slice while scanning for partition keys.
const SCAN_CHUNK: usize = 1_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionMode {
    /// Source order.
    #[default]
    None,
    /// Grouped by normalized state abbreviation.
    State,
}

impl std::str::FromStr for PartitionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "state" => Ok(Self::State),
            other => Err(format!("unknown partition mode '{other}' (expected none or state)")),
        }
    }
}

/// A contiguous range of the work order, handed to one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkBatch {
    /// Plan position of the first record.
    pub position: u64,
    /// Source offsets, ascending within the batch.
    pub offsets: Vec<u64>,
    pub partition: Option<String>,
}

impl WorkBatch {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Plan position just past this batch.
    pub fn end(&self) -> u64 {
        self.position + self.offsets.len() as u64
    }
}

#[derive(Debug, Clone)]
enum Order {
    Sequential(u64),
    Indexed {
        entries: Vec<(u64, String)>,
        partitioned: bool,
    },
}

/// What a work order was built from, stored in the checkpoint so a resumed
/// run can tell whether its positions still mean the same records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFingerprint {
    pub partition: PartitionMode,
    /// Normalized state filter, sorted. Empty means every state.
    #[serde(default)]
    pub states: Vec<String>,
    pub len: u64,
}

impl PlanFingerprint {
    /// Whether positions recorded against `previous` are valid in this plan.
    ///
    /// An unfiltered source-order plan may grow, since appended records do
    /// not move earlier positions. Anything else must match exactly.
    pub fn can_resume(&self, previous: &PlanFingerprint) -> bool {
        if self.partition != previous.partition || self.states != previous.states {
            return false;
        }
        if self.partition == PartitionMode::None && self.states.is_empty() {
            self.len >= previous.len
        } else {
            self.len == previous.len
        }
    }
}

impl std::fmt::Display for PlanFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.partition {
            PartitionMode::None => "none",
            PartitionMode::State => "state",
        };
        write!(f, "partition={mode}")?;
        if !self.states.is_empty() {
            write!(f, " states={}", self.states.join(","))?;
        }
        write!(f, " records={}", self.len)
    }
}

#[derive(Debug, Clone)]
pub struct WorkPlan {
    order: Order,
    mode: PartitionMode,
    states: Vec<String>,
}

impl WorkPlan {
    /// Every record in source order.
    pub fn sequential(count: u64) -> Self {
        Self {
            order: Order::Sequential(count),
            mode: PartitionMode::None,
            states: Vec::new(),
        }
    }

    /// Build the plan for a source. Scans the source only when partitioning
    /// or filtering needs each record's state.
    pub fn build(
        reader: &dyn SourceReader,
        mode: PartitionMode,
        states: &[String],
        lookup: &StateLookup,
    ) -> Result<Self, SourceError> {
        if mode == PartitionMode::None && states.is_empty() {
            return Ok(Self::sequential(reader.count()));
        }

        let mut wanted: Vec<String> = states
            .iter()
            .map(|s| lookup.resolve(s).abbreviation)
            .collect();
        wanted.sort();
        wanted.dedup();

        let total = reader.count();
        let mut entries = Vec::new();
        let mut offset = 0u64;
        while offset < total {
            let rows = reader.slice(offset, SCAN_CHUNK)?;
            if rows.is_empty() {
                break;
            }
            for (i, row) in rows.iter().enumerate() {
                // Unreadable rows and rows without a state keep an empty key
                // so they still get processed and counted as errors.
                let key = match row {
                    Ok(record) => record
                        .state
                        .as_deref()
                        .filter(|s| !s.trim().is_empty())
                        .map(|s| lookup.resolve(s).abbreviation)
                        .unwrap_or_default(),
                    Err(_) => String::new(),
                };
                if wanted.is_empty() || wanted.contains(&key) {
                    entries.push((offset + i as u64, key));
                }
            }
            offset += rows.len() as u64;
        }

        let partitioned = mode == PartitionMode::State;
        if partitioned {
            entries.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        }

        Ok(Self {
            order: Order::Indexed {
                entries,
                partitioned,
            },
            mode,
            states: wanted,
        })
    }

    /// Number of records in the work order.
    pub fn len(&self) -> u64 {
        match &self.order {
            Order::Sequential(count) => *count,
            Order::Indexed { entries, .. } => entries.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The batch starting at `position`, at most `size` records, never
    /// spanning two partitions.
    pub fn next_batch(&self, position: u64, size: usize) -> Option<WorkBatch> {
        if position >= self.len() || size == 0 {
            return None;
        }

        match &self.order {
            Order::Sequential(count) => {
                let end = (position + size as u64).min(*count);
                Some(WorkBatch {
                    position,
                    offsets: (position..end).collect(),
                    partition: None,
                })
            }
            Order::Indexed {
                entries,
                partitioned,
            } => {
                let start = position as usize;
                let first_key = &entries[start].1;
                let batch: Vec<u64> = entries[start..]
                    .iter()
                    .take(size)
                    .take_while(|(_, key)| !*partitioned || key == first_key)
                    .map(|(offset, _)| *offset)
                    .collect();
                Some(WorkBatch {
                    position,
                    offsets: batch,
                    partition: partitioned.then(|| first_key.clone()),
                })
            }
        }
    }

    pub fn fingerprint(&self) -> PlanFingerprint {
        PlanFingerprint {
            partition: self.mode,
            states: self.states.clone(),
            len: self.len(),
        }
    }

    /// Partition key of the record at `position`, when partitioned.
    pub fn partition_at(&self, position: u64) -> Option<&str> {
        match &self.order {
            Order::Indexed {
                entries,
                partitioned: true,
            } => entries.get(position as usize).map(|(_, key)| key.as_str()),
            _ => None,
        }
    }

    /// Record count per partition key, in plan order.
    pub fn partition_sizes(&self) -> Vec<(String, u64)> {
        let Order::Indexed {
            entries,
            partitioned: true,
        } = &self.order
        else {
            return Vec::new();
        };

        let mut sizes: Vec<(String, u64)> = Vec::new();
        for (_, key) in entries {
            match sizes.last_mut() {
                Some((last, n)) if last == key => *n += 1,
                _ => sizes.push((key.clone(), 1)),
            }
        }
        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::source::InMemorySource;
    use crate::models::SourceRecord;

    fn source() -> InMemorySource {
        InMemorySource::new(
            "memory",
            vec![
                SourceRecord::new("a", "Austin", "TX"),
                SourceRecord::new("b", "Denver", "CO"),
                SourceRecord::new("c", "Dallas", "texas"),
                SourceRecord::new("d", "Boulder", "co"),
                SourceRecord {
                    state: None,
                    ..SourceRecord::new("e", "Nowhere", "")
                },
                SourceRecord::new("f", "Houston", "TX"),
            ],
        )
    }

    #[test]
    fn test_sequential_batches() {
        let plan = WorkPlan::build(&source(), PartitionMode::None, &[], StateLookup::us()).unwrap();
        assert_eq!(plan.len(), 6);

        let batch = plan.next_batch(4, 4).unwrap();
        assert_eq!(batch.offsets, vec![4, 5]);
        assert_eq!(batch.partition, None);
        assert_eq!(batch.end(), 6);
        assert!(plan.next_batch(6, 4).is_none());
    }

    #[test]
    fn test_partitioned_batches_stay_within_state() {
        let plan =
            WorkPlan::build(&source(), PartitionMode::State, &[], StateLookup::us()).unwrap();
        assert_eq!(
            plan.partition_sizes(),
            vec![
                (String::new(), 1),
                ("CO".to_string(), 2),
                ("TX".to_string(), 3)
            ]
        );

        let first = plan.next_batch(0, 10).unwrap();
        assert_eq!(first.offsets, vec![4]);
        assert_eq!(first.partition.as_deref(), Some(""));

        let co = plan.next_batch(1, 10).unwrap();
        assert_eq!(co.offsets, vec![1, 3]);
        assert_eq!(co.partition.as_deref(), Some("CO"));

        let tx = plan.next_batch(co.end(), 2).unwrap();
        assert_eq!(tx.offsets, vec![0, 2]);
        let tx_rest = plan.next_batch(tx.end(), 2).unwrap();
        assert_eq!(tx_rest.offsets, vec![5]);
    }

    #[test]
    fn test_state_filter() {
        let plan = WorkPlan::build(
            &source(),
            PartitionMode::State,
            &["Texas".to_string()],
            StateLookup::us(),
        )
        .unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.next_batch(0, 10).unwrap().offsets, vec![0, 2, 5]);

        let unpartitioned = WorkPlan::build(
            &source(),
            PartitionMode::None,
            &["CO".to_string()],
            StateLookup::us(),
        )
        .unwrap();
        assert_eq!(unpartitioned.next_batch(0, 10).unwrap().offsets, vec![1, 3]);
        assert!(unpartitioned.partition_sizes().is_empty());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = WorkPlan::build(&source(), PartitionMode::State, &[], StateLookup::us()).unwrap();
        let b = WorkPlan::build(&source(), PartitionMode::State, &[], StateLookup::us()).unwrap();
        for position in 0..6 {
            assert_eq!(a.next_batch(position, 2), b.next_batch(position, 2));
        }
    }

    #[test]
    fn test_fingerprint_tracks_filter_and_mode() {
        let co = WorkPlan::build(
            &source(),
            PartitionMode::None,
            &["co".to_string(), "Colorado".to_string()],
            StateLookup::us(),
        )
        .unwrap()
        .fingerprint();
        assert_eq!(co.states, vec!["CO"]);
        assert_eq!(co.len, 2);

        let tx = WorkPlan::build(
            &source(),
            PartitionMode::None,
            &["TX".to_string()],
            StateLookup::us(),
        )
        .unwrap()
        .fingerprint();
        assert!(!tx.can_resume(&co));

        let partitioned =
            WorkPlan::build(&source(), PartitionMode::State, &[], StateLookup::us()).unwrap();
        let sequential = WorkPlan::sequential(6).fingerprint();
        assert_eq!(sequential.len, partitioned.len());
        assert!(!partitioned.fingerprint().can_resume(&sequential));
        assert_eq!(partitioned.partition_at(1), Some("CO"));
        assert_eq!(WorkPlan::sequential(6).partition_at(1), None);
    }

    #[test]
    fn test_unfiltered_source_order_may_grow() {
        let before = WorkPlan::sequential(4).fingerprint();
        assert!(WorkPlan::sequential(6).fingerprint().can_resume(&before));
        assert!(!WorkPlan::sequential(3).fingerprint().can_resume(&before));

        let grouped = PlanFingerprint {
            partition: PartitionMode::State,
            states: Vec::new(),
            len: 4,
        };
        let grown = PlanFingerprint { len: 6, ..grouped.clone() };
        assert!(!grown.can_resume(&grouped));
    }

    #[test]
    fn test_partition_mode_from_str() {
        assert_eq!("State".parse::<PartitionMode>(), Ok(PartitionMode::State));
        assert!("county".parse::<PartitionMode>().is_err());
    }
}
