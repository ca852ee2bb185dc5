// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scripted collaborators for exercising the runner and supervisor without
//! a stream broker, a segment store, or a metadata database.
//!
//! Everything here is `Clone` over shared interior state, so a test can keep
//! a handle for scripting and inspection while the component under test owns
//! its copy.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::TimeZone;
use chrono::Utc;

use strata_stream_client::{RecordSupplier, SupplierError};
use strata_types::{
    DataSourceMetadata, SequenceNumber, StreamFlavor, StreamPartition, StreamRecord,
};

use crate::actions::{
    ActionError, CheckpointAction, MetadataActionClient, ResetMetadataAction,
    SegmentTransactionalInsert,
};
use crate::driver::{
    AddResult, DriverError, ParsedRow, RowParser, SegmentDriver, SegmentIdentifier,
};
use crate::task::TaskAnnouncer;

// ----------------------------------------------------------------------
// Record supplier
// ----------------------------------------------------------------------

struct SupplierState<F: StreamFlavor> {
    batches: VecDeque<Vec<StreamRecord<F::PartitionId, F::Sequence>>>,
    assignment: BTreeSet<StreamPartition<F::PartitionId>>,
    seeks: Vec<(StreamPartition<F::PartitionId>, F::Sequence)>,
    earliest: BTreeMap<StreamPartition<F::PartitionId>, F::Sequence>,
    latest: BTreeMap<StreamPartition<F::PartitionId>, F::Sequence>,
    partition_ids: BTreeMap<String, BTreeSet<F::PartitionId>>,
    closed: bool,
}

/// A record supplier that replays scripted batches.
pub struct MockRecordSupplier<F: StreamFlavor> {
    state: Arc<Mutex<SupplierState<F>>>,
}

impl<F: StreamFlavor> Clone for MockRecordSupplier<F> {
    fn clone(&self) -> Self {
        MockRecordSupplier {
            state: Arc::clone(&self.state),
        }
    }
}

impl<F: StreamFlavor> Default for MockRecordSupplier<F> {
    fn default() -> Self {
        MockRecordSupplier {
            state: Arc::new(Mutex::new(SupplierState {
                batches: VecDeque::new(),
                assignment: BTreeSet::new(),
                seeks: Vec::new(),
                earliest: BTreeMap::new(),
                latest: BTreeMap::new(),
                partition_ids: BTreeMap::new(),
                closed: false,
            })),
        }
    }
}

impl<F: StreamFlavor> MockRecordSupplier<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one batch for a future poll.
    pub fn push_batch(&self, batch: Vec<StreamRecord<F::PartitionId, F::Sequence>>) {
        self.state
            .lock()
            .unwrap()
            .batches
            .push_back(batch);
    }

    pub fn set_earliest(&self, partition: StreamPartition<F::PartitionId>, seq: F::Sequence) {
        self.state.lock().unwrap().earliest.insert(partition, seq);
    }

    pub fn set_latest(&self, partition: StreamPartition<F::PartitionId>, seq: F::Sequence) {
        self.state.lock().unwrap().latest.insert(partition, seq);
    }

    pub fn set_partition_ids(&self, stream: &str, ids: BTreeSet<F::PartitionId>) {
        self.state
            .lock()
            .unwrap()
            .partition_ids
            .insert(stream.to_owned(), ids);
    }

    pub fn seeks(&self) -> Vec<(StreamPartition<F::PartitionId>, F::Sequence)> {
        self.state.lock().unwrap().seeks.clone()
    }

    pub fn current_assignment(&self) -> BTreeSet<StreamPartition<F::PartitionId>> {
        self.state.lock().unwrap().assignment.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl<F: StreamFlavor> RecordSupplier<F> for MockRecordSupplier<F> {
    fn assign(
        &mut self,
        partitions: BTreeSet<StreamPartition<F::PartitionId>>,
    ) -> Result<(), SupplierError> {
        self.state.lock().unwrap().assignment = partitions;
        Ok(())
    }

    fn assignment(&self) -> BTreeSet<StreamPartition<F::PartitionId>> {
        self.state.lock().unwrap().assignment.clone()
    }

    fn seek(
        &mut self,
        partition: &StreamPartition<F::PartitionId>,
        sequence: &F::Sequence,
    ) -> Result<(), SupplierError> {
        self.state
            .lock()
            .unwrap()
            .seeks
            .push((partition.clone(), sequence.clone()));
        Ok(())
    }

    fn seek_to_earliest(
        &mut self,
        _partitions: &BTreeSet<StreamPartition<F::PartitionId>>,
    ) -> Result<(), SupplierError> {
        Ok(())
    }

    fn seek_to_latest(
        &mut self,
        _partitions: &BTreeSet<StreamPartition<F::PartitionId>>,
    ) -> Result<(), SupplierError> {
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Vec<StreamRecord<F::PartitionId, F::Sequence>> {
        let batch = {
            let mut state = self.state.lock().unwrap();
            let assignment = state.assignment.clone();
            match state.batches.pop_front() {
                Some(batch) => Some(
                    batch
                        .into_iter()
                        .filter(|r| assignment.contains(&r.stream_partition()))
                        .collect::<Vec<_>>(),
                ),
                None => None,
            }
        };
        match batch {
            Some(records) => records,
            None => {
                // Nothing scripted; behave like a quiet stream.
                std::thread::sleep(timeout.min(Duration::from_millis(20)));
                Vec::new()
            }
        }
    }

    fn earliest_sequence_number(
        &mut self,
        partition: &StreamPartition<F::PartitionId>,
    ) -> Result<F::Sequence, SupplierError> {
        let state = self.state.lock().unwrap();
        // Partitions without a scripted bound probe as closed-and-empty,
        // which the runner treats as "anything is available".
        Ok(state
            .earliest
            .get(partition)
            .cloned()
            .unwrap_or_else(F::Sequence::end_of_shard))
    }

    fn latest_sequence_number(
        &mut self,
        partition: &StreamPartition<F::PartitionId>,
    ) -> Result<F::Sequence, SupplierError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .latest
            .get(partition)
            .cloned()
            .unwrap_or_else(F::Sequence::end_of_shard))
    }

    fn partition_ids(&mut self, stream: &str) -> Result<BTreeSet<F::PartitionId>, SupplierError> {
        self.state
            .lock()
            .unwrap()
            .partition_ids
            .get(stream)
            .cloned()
            .ok_or_else(|| SupplierError::StreamNotFound {
                stream: stream.to_owned(),
            })
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

// ----------------------------------------------------------------------
// Segment driver
// ----------------------------------------------------------------------

struct DriverState {
    restored_metadata: Option<serde_json::Value>,
    added: Vec<(String, ParsedRow)>,
    persisted: Option<serde_json::Value>,
    pushed_sequences: Vec<String>,
    handoffs: Vec<SegmentIdentifier>,
    rows_since_push: usize,
    push_every: Option<usize>,
    hang_handoff: bool,
    closed: bool,
}

/// A segment driver that records everything and fabricates segment ids.
pub struct MockSegmentDriver {
    state: Arc<Mutex<DriverState>>,
}

impl Clone for MockSegmentDriver {
    fn clone(&self) -> Self {
        MockSegmentDriver {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MockSegmentDriver {
    fn default() -> Self {
        MockSegmentDriver {
            state: Arc::new(Mutex::new(DriverState {
                restored_metadata: None,
                added: Vec::new(),
                persisted: None,
                pushed_sequences: Vec::new(),
                handoffs: Vec::new(),
                rows_since_push: 0,
                push_every: None,
                hang_handoff: false,
                closed: false,
            })),
        }
    }
}

impl MockSegmentDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `start` report commit metadata from a prior incarnation.
    pub fn restore_metadata(&self, metadata: serde_json::Value) {
        self.state.lock().unwrap().restored_metadata = Some(metadata);
    }

    /// Signals `push_required` after every `n` added rows.
    pub fn push_every(&self, n: usize) {
        self.state.lock().unwrap().push_every = Some(n);
    }

    /// Makes handoff watchers never resolve, to exercise the timeout alert.
    pub fn hang_handoff(&self) {
        self.state.lock().unwrap().hang_handoff = true;
    }

    pub fn added(&self) -> Vec<(String, ParsedRow)> {
        self.state.lock().unwrap().added.clone()
    }

    pub fn pushed_sequences(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed_sequences.clone()
    }

    pub fn persisted(&self) -> Option<serde_json::Value> {
        self.state.lock().unwrap().persisted.clone()
    }

    pub fn handoffs(&self) -> Vec<SegmentIdentifier> {
        self.state.lock().unwrap().handoffs.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl SegmentDriver for MockSegmentDriver {
    async fn start(&mut self) -> Result<Option<serde_json::Value>, DriverError> {
        Ok(self.state.lock().unwrap().restored_metadata.clone())
    }

    fn add(
        &mut self,
        sequence_name: &str,
        row: ParsedRow,
        _skip_segment_lineage_check: bool,
    ) -> Result<AddResult, DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DriverError::Closed);
        }
        state.added.push((sequence_name.to_owned(), row));
        state.rows_since_push += 1;
        let push_required = match state.push_every {
            Some(n) if state.rows_since_push >= n => {
                state.rows_since_push = 0;
                true
            }
            _ => false,
        };
        Ok(AddResult { push_required })
    }

    async fn persist(&mut self, commit_metadata: serde_json::Value) -> Result<(), DriverError> {
        self.state.lock().unwrap().persisted = Some(commit_metadata);
        Ok(())
    }

    async fn push_segments(
        &mut self,
        sequence_names: Vec<String>,
    ) -> Result<Vec<SegmentIdentifier>, DriverError> {
        let mut state = self.state.lock().unwrap();
        let mut segments = Vec::new();
        for name in sequence_names {
            // One fabricated segment per sequence that saw rows; sequences
            // with no rows publish metadata-only.
            if state.added.iter().any(|(seq, _)| *seq == name) {
                segments.push(SegmentIdentifier(format!("segment-{name}")));
            }
            state.pushed_sequences.push(name);
        }
        Ok(segments)
    }

    async fn await_handoff(
        &mut self,
        segments: Vec<SegmentIdentifier>,
    ) -> Result<(), DriverError> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            if !state.hang_handoff {
                state.handoffs.extend(segments.clone());
            }
            state.hang_handoff
        };
        if hang {
            // Far beyond any test's handoff timeout.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

// ----------------------------------------------------------------------
// Metadata store
// ----------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    metadata: HashMap<String, DataSourceMetadata>,
    published: Vec<SegmentTransactionalInsert>,
    checkpoints: Vec<CheckpointAction>,
    resets: Vec<ResetMetadataAction>,
    fail_inserts: bool,
}

/// An in-memory metadata store with the real compare-and-swap semantics of
/// the transactional insert.
#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_metadata(&self, datasource: &str, metadata: DataSourceMetadata) {
        self.state
            .lock()
            .unwrap()
            .metadata
            .insert(datasource.to_owned(), metadata);
    }

    pub fn metadata(&self, datasource: &str) -> Option<DataSourceMetadata> {
        self.state.lock().unwrap().metadata.get(datasource).cloned()
    }

    pub fn published(&self) -> Vec<SegmentTransactionalInsert> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn checkpoints(&self) -> Vec<CheckpointAction> {
        self.state.lock().unwrap().checkpoints.clone()
    }

    pub fn resets(&self) -> Vec<ResetMetadataAction> {
        self.state.lock().unwrap().resets.clone()
    }

    /// Makes every subsequent insert report a transport failure.
    pub fn fail_inserts(&self) {
        self.state.lock().unwrap().fail_inserts = true;
    }
}

#[async_trait]
impl MetadataActionClient for InMemoryMetadataStore {
    async fn segment_transactional_insert(
        &self,
        insert: SegmentTransactionalInsert,
    ) -> Result<bool, ActionError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_inserts {
            return Err(ActionError::Other(anyhow::anyhow!(
                "metadata store unavailable"
            )));
        }
        match (&insert.start_metadata, &insert.end_metadata) {
            (None, _) => {
                state.published.push(insert);
                Ok(true)
            }
            (Some(start), Some(end)) => {
                let stored = state.metadata.get(&insert.datasource);
                // First publish for a datasource is unconditional; after
                // that the stored commit must agree with the expected start.
                let accepted = match stored {
                    None => true,
                    Some(stored) => stored.matches(start),
                };
                if !accepted {
                    return Ok(false);
                }
                let merged = match stored {
                    Some(stored) => stored.plus(end),
                    None => end.clone(),
                };
                state.metadata.insert(insert.datasource.clone(), merged);
                state.published.push(insert);
                Ok(true)
            }
            (Some(_), None) => Err(ActionError::Other(anyhow::anyhow!(
                "transactional insert without end metadata"
            ))),
        }
    }

    async fn checkpoint(&self, action: CheckpointAction) -> Result<bool, ActionError> {
        self.state.lock().unwrap().checkpoints.push(action);
        Ok(true)
    }

    async fn reset_metadata(&self, action: ResetMetadataAction) -> Result<bool, ActionError> {
        let mut state = self.state.lock().unwrap();
        match &action.metadata {
            None => {
                state.metadata.remove(&action.datasource);
            }
            Some(subset) => {
                if let Some(stored) = state.metadata.get(&action.datasource) {
                    let reduced = stored.minus(subset);
                    state.metadata.insert(action.datasource.clone(), reduced);
                }
            }
        }
        state.resets.push(action);
        Ok(true)
    }

    async fn retrieve_metadata(
        &self,
        datasource: &str,
    ) -> Result<Option<DataSourceMetadata>, ActionError> {
        Ok(self.state.lock().unwrap().metadata.get(datasource).cloned())
    }
}

// ----------------------------------------------------------------------
// Announcer and parser
// ----------------------------------------------------------------------

/// Records announcements; `announced` is true between announce and
/// unannounce.
#[derive(Clone, Default)]
pub struct RecordingAnnouncer {
    announced: Arc<AtomicBool>,
    ever_announced: Arc<AtomicBool>,
}

impl RecordingAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_announced(&self) -> bool {
        self.announced.load(Ordering::SeqCst)
    }

    pub fn was_announced(&self) -> bool {
        self.ever_announced.load(Ordering::SeqCst)
    }
}

impl TaskAnnouncer for RecordingAnnouncer {
    fn announce(&self, _task_id: &str) {
        self.announced.store(true, Ordering::SeqCst);
        self.ever_announced.store(true, Ordering::SeqCst);
    }

    fn unannounce(&self, _task_id: &str) {
        self.announced.store(false, Ordering::SeqCst);
    }
}

/// Parses payloads as JSON objects with an optional integer `ts` field
/// (seconds since the epoch).
pub fn test_row_parser() -> RowParser {
    Box::new(|bytes| {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).context("payload is not valid json")?;
        let ts = value.get("ts").and_then(|v| v.as_i64()).unwrap_or(0);
        let timestamp = Utc
            .timestamp_opt(ts, 0)
            .single()
            .context("timestamp out of range")?;
        Ok(vec![ParsedRow {
            timestamp,
            payload: value,
        }])
    })
}
