// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Sequence bookkeeping.
//!
//! A task's life is an ordered chain of sequences. Each sequence owns the
//! records between its start and end offsets and becomes exactly one
//! transactional publish. Only the last sequence may be open (its end not
//! yet final); every earlier sequence's end equals its successor's start,
//! for every partition they share.
//!
//! The chain is persisted to `sequences.json` in the task's persist
//! directory, synchronously, on every change: it is how a restarted task
//! knows which publishes are still owed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use strata_types::{partition_keyed_map, PartitionKey, SequenceNumber};

pub const SEQUENCES_FILE: &str = "sequences.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "P: PartitionKey, S: Serialize",
    deserialize = "P: PartitionKey, S: Deserialize<'de>"
))]
pub struct SequenceMetadata<P: Ord, S> {
    pub sequence_id: i32,
    pub sequence_name: String,
    #[serde(with = "partition_keyed_map")]
    pub start_offsets: BTreeMap<P, S>,
    #[serde(with = "partition_keyed_map")]
    pub end_offsets: BTreeMap<P, S>,
    /// Partitions this sequence is still accepting records for. Emptied when
    /// the sequence is queued for publish.
    pub assignments: BTreeSet<P>,
    /// A checkpointed sequence's bounds are final; records route to its
    /// successor.
    pub checkpointed: bool,
}

impl<P: PartitionKey, S: SequenceNumber> SequenceMetadata<P, S> {
    pub fn new(
        sequence_id: i32,
        base_sequence_name: &str,
        start_offsets: BTreeMap<P, S>,
        end_offsets: BTreeMap<P, S>,
        checkpointed: bool,
    ) -> Self {
        let assignments = start_offsets.keys().cloned().collect();
        SequenceMetadata {
            sequence_id,
            sequence_name: format!("{base_sequence_name}_{sequence_id}"),
            start_offsets,
            end_offsets,
            assignments,
            checkpointed,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.checkpointed
    }

    /// Whether a record at `sequence` on `partition` belongs to this
    /// sequence: the partition is still assigned here and the position lies
    /// in `[start, end)`, where an absent or `NO_END` end is unbounded.
    pub fn can_handle(&self, partition: &P, sequence: &S) -> bool {
        if !self.assignments.contains(partition) {
            return false;
        }
        let Some(start) = self.start_offsets.get(partition) else {
            return false;
        };
        if sequence < start {
            return false;
        }
        match self.end_offsets.get(partition) {
            None => true,
            Some(end) if end.is_no_end() => true,
            Some(end) => sequence < end,
        }
    }
}

/// Writes the chain to `dir/sequences.json` via a temp file and an atomic
/// rename, so a crash never leaves a torn file.
pub fn save_sequences<P: PartitionKey, S: SequenceNumber>(
    dir: &Path,
    sequences: &[SequenceMetadata<P, S>],
) -> Result<(), anyhow::Error> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating persist directory {}", dir.display()))?;
    let buf = serde_json::to_vec_pretty(sequences).context("encoding sequences")?;
    let tmp_path = dir.join(format!("{SEQUENCES_FILE}-tmp"));
    fs::write(&tmp_path, buf)
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    let final_path = dir.join(SEQUENCES_FILE);
    fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("renaming into {}", final_path.display()))?;
    Ok(())
}

/// Reads the chain back, or `None` if no file exists (a fresh task).
pub fn load_sequences<P: PartitionKey, S: SequenceNumber>(
    dir: &Path,
) -> Result<Option<Vec<SequenceMetadata<P, S>>>, anyhow::Error> {
    let path = dir.join(SEQUENCES_FILE);
    let buf = match fs::read(&path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let sequences =
        serde_json::from_slice(&buf).with_context(|| format!("decoding {}", path.display()))?;
    Ok(Some(sequences))
}

#[cfg(test)]
mod tests {
    use strata_types::BrokerOffset;

    use super::*;

    fn seq(
        id: i32,
        start: &[(i32, i64)],
        end: &[(i32, i64)],
        checkpointed: bool,
    ) -> SequenceMetadata<i32, BrokerOffset> {
        SequenceMetadata::new(
            id,
            "events_a1b2",
            start.iter().map(|(p, o)| (*p, BrokerOffset(*o))).collect(),
            end.iter().map(|(p, o)| (*p, BrokerOffset(*o))).collect(),
            checkpointed,
        )
    }

    #[test]
    fn sequence_names_derive_from_base_and_id() {
        let s = seq(3, &[(0, 10)], &[], false);
        assert_eq!(s.sequence_name, "events_a1b2_3");
        assert_eq!(s.assignments, [0].into_iter().collect());
    }

    #[test]
    fn can_handle_respects_bounds_and_assignment() {
        let mut s = seq(0, &[(0, 10), (1, 0)], &[(0, 20)], false);
        assert!(s.can_handle(&0, &BrokerOffset(10)));
        assert!(s.can_handle(&0, &BrokerOffset(19)));
        assert!(!s.can_handle(&0, &BrokerOffset(20)));
        assert!(!s.can_handle(&0, &BrokerOffset(9)));
        // No end recorded for partition 1: unbounded.
        assert!(s.can_handle(&1, &BrokerOffset(1_000_000)));
        // Unassigned partitions are never handled, bounds notwithstanding.
        s.assignments.remove(&0);
        assert!(!s.can_handle(&0, &BrokerOffset(10)));
        // Unknown partition.
        assert!(!s.can_handle(&7, &BrokerOffset(0)));
    }

    #[test]
    fn no_end_sentinel_is_unbounded() {
        let s = seq(0, &[(0, 0)], &[(0, i64::MAX)], false);
        assert!(s.can_handle(&0, &BrokerOffset(i64::MAX - 1)));
    }

    #[test]
    fn chain_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let chain = vec![
            seq(0, &[(0, 0)], &[(0, 5)], true),
            seq(1, &[(0, 5)], &[(0, i64::MAX)], false),
        ];
        save_sequences(dir.path(), &chain).unwrap();
        let restored: Vec<SequenceMetadata<i32, BrokerOffset>> =
            load_sequences(dir.path()).unwrap().unwrap();
        assert_eq!(restored, chain);

        // The chain invariant survives the round trip.
        assert_eq!(
            restored[0].end_offsets.get(&0),
            restored[1].start_offsets.get(&0)
        );
    }

    #[test]
    fn missing_file_reads_as_fresh_task() {
        let dir = tempfile::tempdir().unwrap();
        let restored =
            load_sequences::<i32, BrokerOffset>(dir.path()).unwrap();
        assert!(restored.is_none());
    }
}
