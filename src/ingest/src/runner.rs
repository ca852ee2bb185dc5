// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The ingestion task state machine.
//!
//! One dedicated thread drives `NOT_STARTED -> STARTING -> READING <->
//! PAUSED -> PUBLISHING`. Control arrives from HTTP handlers, which mutate
//! only under the single state lock and communicate with the run thread
//! through two condition variables: `has_paused` (run thread acknowledges a
//! pause) and `should_resume` (controller releases it). The run thread
//! yields to controllers at exactly three suspension points: after each
//! supplier poll, after an assignment change, and on entry to publishing.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use strata_stream_client::{RecordSupplier, SupplierError};
use strata_types::{
    SequenceNumber, StreamFlavor, StreamMetadata, StreamPartition, StreamPartitions, StreamRecord,
};

use crate::actions::{
    ActionError, CheckpointAction, MetadataActionClient, ResetMetadataAction,
    SegmentTransactionalInsert,
};
use crate::driver::{DriverError, RowParser, SegmentDriver, SegmentIdentifier};
use crate::meters::{RowIngestionMeters, RowStats};
use crate::sequences::{load_sequences, save_sequences, SequenceMetadata};
use crate::task::{
    IndexTaskSpec, TaskAnnouncer, TaskCompletionReport, TaskState, CHECKPOINTS_CONTEXT_KEY,
};

/// How long `pause` waits for the run thread to park before answering 202.
const PAUSE_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `resume` waits for the run thread to unpark before failing.
const RESUME_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    NotStarted,
    Starting,
    Reading,
    Paused,
    Publishing,
}

/// Fatal task failures.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("starting offset no longer available for partition(s) {partitions}")]
    OffsetUnavailable { partitions: String },
    #[error(
        "invalid offsets: current {current} is past end {end} for partition {partition}"
    )]
    InvalidBounds {
        partition: String,
        current: String,
        end: String,
    },
    #[error("offset gap on partition {partition}: expected {expected}, got {got}")]
    GapDetected {
        partition: String,
        expected: String,
        got: String,
    },
    #[error(
        "first record for partition {partition} at {got} does not match expected start {expected}"
    )]
    StartRecordMismatch {
        partition: String,
        expected: String,
        got: String,
    },
    #[error("transactional publish rejected for sequence {sequence_name}; \
             stored metadata did not match the expected start")]
    PublishRejected { sequence_name: String },
    #[error("checkpoint action rejected by the orchestrator")]
    CheckpointRejected,
    #[error("parse failures ({count}) exceeded the budget ({max})")]
    TooManyParseExceptions { count: u64, max: u64 },
    #[error("interrupted by shutdown")]
    Interrupted,
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Supplier(#[from] SupplierError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of the control surface, mapped onto HTTP status codes by the
/// `http` module.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

/// Result of a pause request.
#[derive(Debug)]
pub enum PauseOutcome<P, S> {
    /// The run thread parked; these are the exact offsets at the park point.
    Paused(BTreeMap<P, S>),
    /// The pause was registered but not acknowledged within the window.
    Accepted,
}

enum LoopSignal {
    Continue,
    Stop,
}

struct ControlState<F: StreamFlavor> {
    status: RunnerStatus,
    pause_requested: bool,
    stop_requested: bool,
    /// True exactly while the run thread is parked in its pause loop.
    paused: bool,
    curr_offsets: BTreeMap<F::PartitionId, F::Sequence>,
    end_offsets: BTreeMap<F::PartitionId, F::Sequence>,
    sequences: Vec<SequenceMetadata<F::PartitionId, F::Sequence>>,
    /// Expected first-record positions, reseeded whenever the supervisor
    /// installs new sequence starts.
    initial_offsets: BTreeMap<F::PartitionId, F::Sequence>,
    /// Partitions whose first record has been verified against
    /// `initial_offsets`.
    verified_partitions: BTreeSet<F::PartitionId>,
}

/// The per-task ingestion runner. Shared between the run thread and the
/// HTTP control surface via `Arc`.
pub struct TaskRunner<F: StreamFlavor> {
    spec: IndexTaskSpec<F::PartitionId, F::Sequence>,
    persist_dir: PathBuf,
    handle: Handle,
    state: Mutex<ControlState<F>>,
    has_paused: Condvar,
    should_resume: Condvar,
    publish_cancel: Notify,
    meters: RowIngestionMeters,
    start_time: Mutex<Option<DateTime<Utc>>>,
}

impl<F: StreamFlavor> TaskRunner<F> {
    pub fn new(
        spec: IndexTaskSpec<F::PartitionId, F::Sequence>,
        persist_dir: PathBuf,
        handle: Handle,
    ) -> Arc<Self> {
        Arc::new(TaskRunner {
            spec,
            persist_dir,
            handle,
            state: Mutex::new(ControlState {
                status: RunnerStatus::NotStarted,
                pause_requested: false,
                stop_requested: false,
                paused: false,
                curr_offsets: BTreeMap::new(),
                end_offsets: BTreeMap::new(),
                sequences: Vec::new(),
                initial_offsets: BTreeMap::new(),
                verified_partitions: BTreeSet::new(),
            }),
            has_paused: Condvar::new(),
            should_resume: Condvar::new(),
            publish_cancel: Notify::new(),
            meters: RowIngestionMeters::default(),
            start_time: Mutex::new(None),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &IndexTaskSpec<F::PartitionId, F::Sequence> {
        &self.spec
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    pub fn status(&self) -> RunnerStatus {
        self.state.lock().expect("state lock poisoned").status
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.lock().expect("start time lock poisoned")
    }

    pub fn row_stats(&self) -> RowStats {
        self.meters.snapshot()
    }

    pub fn unparseable_events(&self) -> Vec<String> {
        self.meters.saved_parse_exceptions()
    }

    pub fn current_offsets(&self) -> BTreeMap<F::PartitionId, F::Sequence> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .curr_offsets
            .clone()
    }

    pub fn end_offsets(&self) -> BTreeMap<F::PartitionId, F::Sequence> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .end_offsets
            .clone()
    }

    /// The ordered `sequence id -> start offsets` map.
    pub fn checkpoints(&self) -> BTreeMap<i32, BTreeMap<F::PartitionId, F::Sequence>> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .sequences
            .iter()
            .map(|s| (s.sequence_id, s.start_offsets.clone()))
            .collect()
    }

    /// Requests a pause and waits briefly for the run thread to park.
    pub fn pause(&self) -> Result<PauseOutcome<F::PartitionId, F::Sequence>, ControlError> {
        let mut state = self.state.lock().expect("state lock poisoned");
        if !matches!(state.status, RunnerStatus::Reading | RunnerStatus::Paused) {
            return Err(ControlError::BadRequest(format!(
                "cannot pause in state {:?}",
                state.status
            )));
        }
        state.pause_requested = true;
        let deadline = Instant::now() + PAUSE_ACK_TIMEOUT;
        while !state.paused {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(PauseOutcome::Accepted);
            }
            let (s, _timeout) = self
                .has_paused
                .wait_timeout(state, remaining)
                .expect("state lock poisoned");
            state = s;
        }
        Ok(PauseOutcome::Paused(state.curr_offsets.clone()))
    }

    /// Clears any pause and waits for the run thread to acknowledge.
    pub fn resume(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.pause_requested = false;
        self.should_resume.notify_all();
        let deadline = Instant::now() + RESUME_ACK_TIMEOUT;
        while state.paused {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ControlError::Internal(
                    "run thread did not acknowledge resume".into(),
                ));
            }
            let (s, _timeout) = self
                .should_resume
                .wait_timeout(state, remaining)
                .expect("state lock poisoned");
            state = s;
        }
        Ok(())
    }

    /// Installs new end offsets while the task is paused.
    ///
    /// With `finish`, the given offsets become the task's final ends and the
    /// open sequence is sealed: the run thread will move to publishing once
    /// every partition reaches its end. Without `finish`, the open sequence
    /// is sealed at the given offsets and a new open sequence starts there.
    /// Either way the sequence file is persisted and the task resumes.
    pub fn set_end_offsets(
        &self,
        offsets: BTreeMap<F::PartitionId, F::Sequence>,
        finish: bool,
    ) -> Result<BTreeMap<F::PartitionId, F::Sequence>, ControlError> {
        if offsets.is_empty() {
            return Err(ControlError::BadRequest("offsets must be non-empty".into()));
        }
        let mut state = self.state.lock().expect("state lock poisoned");
        if !state.paused {
            return Err(ControlError::BadRequest(
                "task must be paused before setting end offsets".into(),
            ));
        }
        let Some(latest) = state.sequences.last() else {
            return Err(ControlError::Internal("task has no sequences".into()));
        };
        if latest.checkpointed {
            return Err(ControlError::BadRequest(
                "duplicate request: latest sequence is already sealed".into(),
            ));
        }
        let known: BTreeSet<_> = state.end_offsets.keys().cloned().collect();
        let given: BTreeSet<_> = offsets.keys().cloned().collect();
        if known != given {
            return Err(ControlError::BadRequest(format!(
                "partition set mismatch: expected {known:?}, got {given:?}"
            )));
        }
        for (partition, sequence) in &offsets {
            if let Some(curr) = state.curr_offsets.get(partition) {
                if !curr.is_end_of_shard() && sequence < curr {
                    return Err(ControlError::BadRequest(format!(
                        "end offset {sequence} for partition {partition} regresses below \
                         current offset {curr}"
                    )));
                }
            }
        }

        if finish {
            state.end_offsets = offsets.clone();
            let latest = state.sequences.last_mut().expect("checked above");
            latest.end_offsets = offsets.clone();
            latest.checkpointed = true;
            info!(offsets = ?offsets, "final end offsets installed");
        } else {
            let prior_end = state.end_offsets.clone();
            let latest = state.sequences.last_mut().expect("checked above");
            latest.end_offsets = offsets.clone();
            latest.checkpointed = true;
            let next_id = latest.sequence_id + 1;
            let new_sequence = SequenceMetadata::new(
                next_id,
                &self.spec.io_config.base_sequence_name,
                offsets.clone(),
                prior_end,
                false,
            );
            info!(sequence = %new_sequence.sequence_name, "checkpointed; new sequence started");
            state.sequences.push(new_sequence);
            state.initial_offsets = offsets.clone();
            state.verified_partitions.clear();
        }

        if let Err(e) = save_sequences(&self.persist_dir, &state.sequences) {
            return Err(ControlError::Internal(format!(
                "persisting sequences failed: {e:#}"
            )));
        }

        // Resume in place: drop back into the run loop with the new bounds.
        state.pause_requested = false;
        self.should_resume.notify_all();
        drop(state);
        Ok(offsets)
    }

    /// Cooperative shutdown: release any pause and, if the run thread is
    /// already publishing, cancel its in-flight futures.
    pub fn stop_gracefully(&self) {
        let publishing = {
            let mut state = self.state.lock().expect("state lock poisoned");
            info!(task_id = %self.spec.id, "graceful stop requested");
            state.stop_requested = true;
            state.pause_requested = false;
            self.should_resume.notify_all();
            state.status == RunnerStatus::Publishing
        };
        if publishing {
            self.publish_cancel.notify_one();
        }
    }

    // ------------------------------------------------------------------
    // Run thread
    // ------------------------------------------------------------------

    /// Runs the task to completion. Blocks the calling thread; every other
    /// interaction goes through the control surface.
    pub fn run(
        self: &Arc<Self>,
        supplier: &mut dyn RecordSupplier<F>,
        driver: &mut dyn SegmentDriver,
        actions: &dyn MetadataActionClient,
        parser: &RowParser,
        announcer: &dyn TaskAnnouncer,
    ) -> TaskCompletionReport {
        announcer.announce(&self.spec.id);
        let result = self.run_internal(supplier, driver, actions, parser);

        // The cleanup frame runs in full regardless of the outcome; later
        // failures are collected rather than masking the primary error.
        let mut suppressed: Vec<anyhow::Error> = Vec::new();
        {
            let state = self.state.lock().expect("state lock poisoned");
            if let Err(e) = save_sequences(&self.persist_dir, &state.sequences) {
                suppressed.push(e.context("persisting sequences during shutdown"));
            }
        }
        self.handle.block_on(driver.close());
        supplier.close();
        announcer.unannounce(&self.spec.id);

        let (task_state, error_msg) = match result {
            Ok(()) => (TaskState::Success, None),
            Err(e) => {
                error!(task_id = %self.spec.id, "task failed: {:#}", e);
                let mut msg = format!("{e:#}");
                for s in &suppressed {
                    msg.push_str(&format!("; suppressed: {s:#}"));
                }
                (TaskState::Failed, Some(msg))
            }
        };
        for s in &suppressed {
            warn!(task_id = %self.spec.id, "suppressed shutdown error: {:#}", s);
        }
        let report = TaskCompletionReport {
            task_id: self.spec.id.clone(),
            state: task_state,
            row_stats: self.meters.snapshot(),
            error_msg,
        };
        if let Err(e) = report.write_to(&self.persist_dir) {
            error!("failed writing completion report: {:#}", e);
        }
        report
    }

    fn run_internal(
        self: &Arc<Self>,
        supplier: &mut dyn RecordSupplier<F>,
        driver: &mut dyn SegmentDriver,
        actions: &dyn MetadataActionClient,
        parser: &RowParser,
    ) -> Result<(), RunnerError> {
        let io = &self.spec.io_config;
        let tuning = &self.spec.tuning_config;
        let stream = io.stream().to_owned();

        *self.start_time.lock().expect("start time lock poisoned") = Some(Utc::now());
        self.set_status(RunnerStatus::Starting);
        info!(task_id = %self.spec.id, stream = %stream, "task starting");

        // Restore the sequence chain: the persisted file wins, then context
        // checkpoints, then a single synthesized sequence over [start, end).
        let sequences = match load_sequences(&self.persist_dir)? {
            Some(seqs) if !seqs.is_empty() => {
                info!(count = seqs.len(), "restored sequences from disk");
                seqs
            }
            _ => match self.spec.context.get(CHECKPOINTS_CONTEXT_KEY) {
                Some(value) => self.sequences_from_checkpoints(value)?,
                None => vec![SequenceMetadata::new(
                    0,
                    &io.base_sequence_name,
                    io.start_partitions.partition_sequence_map.clone(),
                    io.end_partitions.partition_sequence_map.clone(),
                    false,
                )],
            },
        };

        // Prior driver metadata is the authoritative read position; absent
        // that, the first sequence's start is.
        let restored_metadata = self.handle.block_on(driver.start())?;
        let first_start = sequences[0].start_offsets.clone();
        let curr_offsets = match restored_metadata {
            Some(value) => {
                let snapshot: StreamPartitions<F::PartitionId, F::Sequence> =
                    serde_json::from_value(value).context("decoding restored driver metadata")?;
                if snapshot.stream != stream {
                    return Err(RunnerError::Invariant(format!(
                        "restored metadata names stream {}, task reads {}",
                        snapshot.stream, stream
                    )));
                }
                for (partition, sequence) in &snapshot.partition_sequence_map {
                    if let Some(start) = first_start.get(partition) {
                        if !sequence.is_end_of_shard() && sequence < start {
                            return Err(RunnerError::Invariant(format!(
                                "restored offset {sequence} for partition {partition} \
                                 precedes task start {start}"
                            )));
                        }
                    }
                }
                info!(offsets = ?snapshot.partition_sequence_map, "adopted offsets from driver");
                snapshot.partition_sequence_map
            }
            None => first_start,
        };

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.sequences = sequences;
            state.end_offsets = io.end_partitions.partition_sequence_map.clone();
            // A partition whose assigned end is already the closed-shard
            // sentinel was finished by a predecessor; never read it.
            let mut curr_offsets = curr_offsets;
            for (partition, end) in &state.end_offsets {
                if end.is_end_of_shard() {
                    curr_offsets.insert(partition.clone(), F::Sequence::end_of_shard());
                }
            }
            for (partition, curr) in &curr_offsets {
                if let Some(end) = state.end_offsets.get(partition) {
                    if !curr.is_end_of_shard() && !end.is_no_end() && curr > end {
                        return Err(RunnerError::InvalidBounds {
                            partition: partition.to_string(),
                            current: curr.to_string(),
                            end: end.to_string(),
                        });
                    }
                }
            }
            state.curr_offsets = curr_offsets;
            state.initial_offsets = state.curr_offsets.clone();
            state.verified_partitions.clear();
            save_sequences(&self.persist_dir, &state.sequences)?;
        }

        // Assign and position whatever still needs reading.
        let assignment = self.reading_partitions(&stream);
        supplier.assign(assignment.clone())?;
        let positions: Vec<_> = {
            let state = self.state.lock().expect("state lock poisoned");
            assignment
                .iter()
                .map(|p| (p.clone(), state.curr_offsets[&p.partition_id].clone()))
                .collect()
        };
        for (partition, sequence) in &positions {
            supplier.seek(partition, sequence)?;
        }

        // Confirm the stream still retains our start positions.
        if !tuning.skip_sequence_number_availability_check {
            let mut unavailable = Vec::new();
            for (partition, sequence) in &positions {
                let earliest = supplier.earliest_sequence_number(partition)?;
                if !earliest.is_sentinel() && *sequence < earliest {
                    unavailable.push((partition.clone(), sequence.clone()));
                }
            }
            if !unavailable.is_empty() {
                if tuning.reset_offset_automatically {
                    self.request_offset_reset(actions, &stream, &unavailable)?;
                } else {
                    return Err(RunnerError::OffsetUnavailable {
                        partitions: unavailable
                            .iter()
                            .map(|(p, _)| p.to_string())
                            .collect::<Vec<_>>()
                            .join(", "),
                    });
                }
            }
        }

        self.set_status(RunnerStatus::Reading);
        info!(task_id = %self.spec.id, "reading");

        let mut next_checkpoint = Instant::now() + tuning.intermediate_handoff_period();

        loop {
            if let LoopSignal::Stop = self.check_pause() {
                break;
            }
            if self.reading_partitions(&stream).is_empty() {
                // Every partition has reached its bound (or its shard
                // closed); with final end offsets installed this is the
                // normal path into publishing.
                info!("every partition has reached its bound");
                break;
            }

            let records = supplier.poll(tuning.poll_timeout());
            let mut push_marked = false;
            let mut assignment_changed = false;
            for record in records {
                self.process_record(record, driver, parser, &mut push_marked, &mut assignment_changed)?;
            }

            if assignment_changed {
                let remaining = self.reading_partitions(&stream);
                debug!(remaining = remaining.len(), "assignment narrowed");
                supplier.assign(remaining)?;
                if let LoopSignal::Stop = self.check_pause() {
                    break;
                }
            }

            let wall_checkpoint = Instant::now() >= next_checkpoint;
            if (push_marked || wall_checkpoint) && self.latest_sequence_open() {
                self.checkpoint_latest(actions, &stream)?;
                next_checkpoint = Instant::now() + tuning.intermediate_handoff_period();
            }
        }

        self.publish_all(driver, actions, &stream)
    }

    // ------------------------------------------------------------------
    // Reading internals
    // ------------------------------------------------------------------

    fn process_record(
        &self,
        record: StreamRecord<F::PartitionId, F::Sequence>,
        driver: &mut dyn SegmentDriver,
        parser: &RowParser,
        push_marked: &mut bool,
        assignment_changed: &mut bool,
    ) -> Result<(), RunnerError> {
        let io = &self.spec.io_config;
        let tuning = &self.spec.tuning_config;
        let mut state = self.state.lock().expect("state lock poisoned");

        let partition = record.partition_id.clone();
        let Some(curr) = state.curr_offsets.get(&partition).cloned() else {
            return Ok(());
        };
        if curr.is_end_of_shard() {
            return Ok(());
        }
        let end = state.end_offsets.get(&partition).cloned();

        if record.is_end_of_shard_marker() {
            info!(partition = %partition, "shard closed");
            state
                .curr_offsets
                .insert(partition, F::Sequence::end_of_shard());
            *assignment_changed = true;
            return Ok(());
        }
        let sequence = record.sequence_number.clone();

        // First record per partition: verify it sits where the installed
        // sequence starts say it should.
        if !state.verified_partitions.contains(&partition) {
            state.verified_partitions.insert(partition.clone());
            let Some(expected) = state.initial_offsets.get(&partition).cloned() else {
                // The snapshot is seeded for every assigned partition before
                // the first poll; a missing entry is a bookkeeping bug, not
                // a stream condition.
                return Err(RunnerError::Invariant(format!(
                    "no initial offset recorded for partition {partition}"
                )));
            };
            let exclusive = io.exclusive_start_partitions.contains(&partition);
            if exclusive {
                if sequence == expected {
                    // The predecessor task already published this record.
                    let next = sequence.next().map_err(|e| anyhow!(e))?;
                    debug!(partition = %partition, %sequence, "skipping exclusive start record");
                    state.curr_offsets.insert(partition, next);
                    return Ok(());
                }
            } else if curr == expected && sequence != expected && !F::SEQUENCE_GAPS_EXPECTED {
                // Only partitions still sitting at the snapshot position are
                // held to it; one that already advanced past a checkpoint
                // boundary legitimately delivers older records first.
                return Err(RunnerError::StartRecordMismatch {
                    partition: partition.to_string(),
                    expected: expected.to_string(),
                    got: sequence.to_string(),
                });
            }
        }

        // A record at or past the end bound: this partition is done.
        if let Some(end) = &end {
            if !end.is_no_end() && sequence >= *end {
                state.curr_offsets.insert(partition, end.clone());
                *assignment_changed = true;
                return Ok(());
            }
        }

        if sequence < curr {
            // Already processed (stale redelivery across a reassignment).
            return Ok(());
        }
        if sequence > curr && !F::SEQUENCE_GAPS_EXPECTED {
            if tuning.skip_offset_gaps {
                warn!(
                    partition = %partition,
                    expected = %curr,
                    got = %sequence,
                    "offset gap; skipping ahead"
                );
            } else {
                return Err(RunnerError::GapDetected {
                    partition: partition.to_string(),
                    expected: curr.to_string(),
                    got: sequence.to_string(),
                });
            }
        }

        let Some(sequence_name) = state
            .sequences
            .iter()
            .rev()
            .find(|s| s.can_handle(&partition, &sequence))
            .map(|s| s.sequence_name.clone())
        else {
            return Err(RunnerError::Invariant(format!(
                "no sequence can handle record at {sequence} on partition {partition}"
            )));
        };

        for blob in &record.data {
            match parser(blob) {
                Err(e) => {
                    if tuning.log_parse_exceptions {
                        warn!(partition = %partition, %sequence, "unparseable payload: {:#}", e);
                    }
                    let total = self.meters.incr_unparseable(e.to_string());
                    if total > tuning.max_parse_exceptions {
                        return Err(RunnerError::TooManyParseExceptions {
                            count: total,
                            max: tuning.max_parse_exceptions,
                        });
                    }
                }
                Ok(rows) => {
                    for row in rows {
                        let too_early = io
                            .maximum_message_time
                            .map_or(false, |max| row.timestamp > max);
                        let too_late = io
                            .minimum_message_time
                            .map_or(false, |min| row.timestamp < min);
                        if too_early || too_late {
                            self.meters.incr_thrown_away();
                            continue;
                        }
                        let result =
                            driver.add(&sequence_name, row, F::SKIP_SEGMENT_LINEAGE_CHECK)?;
                        self.meters.incr_processed();
                        if result.push_required {
                            *push_marked = true;
                        }
                    }
                }
            }
        }

        let next = sequence.next().map_err(|e| anyhow!(e))?;
        if let Some(end) = &end {
            if !end.is_no_end() && next >= *end {
                state.curr_offsets.insert(partition, end.clone());
                *assignment_changed = true;
                return Ok(());
            }
        }
        state.curr_offsets.insert(partition, next);
        Ok(())
    }

    /// Pauses in place and reports a checkpoint of the open sequence to the
    /// orchestrator. The supervisor answers (on another thread) with
    /// `set_end_offsets`, which seals the sequence and resumes the task.
    fn checkpoint_latest(
        self: &Arc<Self>,
        actions: &dyn MetadataActionClient,
        stream: &str,
    ) -> Result<(), RunnerError> {
        let (start, current) = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if state.stop_requested {
                return Ok(());
            }
            state.pause_requested = true;
            let latest = state
                .sequences
                .last()
                .expect("checkpoint requires a sequence");
            (latest.start_offsets.clone(), state.curr_offsets.clone())
        };
        info!("requesting checkpoint");
        let action = CheckpointAction {
            datasource: self.spec.datasource.clone(),
            task_group_id: self.spec.io_config.task_group_id,
            base_sequence_name: self.spec.io_config.base_sequence_name.clone(),
            start_metadata: F::wrap_metadata(StreamMetadata::from_map(stream.to_owned(), start)),
            current_metadata: F::wrap_metadata(StreamMetadata::from_map(
                stream.to_owned(),
                current,
            )),
        };
        // A checkpoint the orchestrator will not record is fatal: without it
        // the supervisor cannot align replicas on this boundary.
        if !self.handle.block_on(actions.checkpoint(action))? {
            return Err(RunnerError::CheckpointRejected);
        }
        Ok(())
    }

    fn request_offset_reset(
        &self,
        actions: &dyn MetadataActionClient,
        stream: &str,
        unavailable: &[(StreamPartition<F::PartitionId>, F::Sequence)],
    ) -> Result<(), RunnerError> {
        warn!(
            partitions = ?unavailable.iter().map(|(p, _)| p.to_string()).collect::<Vec<_>>(),
            "start offsets fell out of retention; requesting metadata reset"
        );
        let map = unavailable
            .iter()
            .map(|(p, s)| (p.partition_id.clone(), s.clone()))
            .collect();
        let action = ResetMetadataAction {
            datasource: self.spec.datasource.clone(),
            metadata: Some(F::wrap_metadata(StreamMetadata::from_map(
                stream.to_owned(),
                map,
            ))),
        };
        self.handle.block_on(actions.reset_metadata(action))?;
        // Park and wait for the supervisor to tear this task down.
        let mut state = self.state.lock().expect("state lock poisoned");
        state.pause_requested = true;
        Ok(())
    }

    /// The pause suspension point.
    fn check_pause(&self) -> LoopSignal {
        let mut state = self.state.lock().expect("state lock poisoned");
        while state.pause_requested && !state.stop_requested {
            if !state.paused {
                info!(task_id = %self.spec.id, "paused");
                state.status = RunnerStatus::Paused;
                state.paused = true;
                self.has_paused.notify_all();
            }
            state = self
                .should_resume
                .wait(state)
                .expect("state lock poisoned");
        }
        if state.paused {
            state.paused = false;
            info!(task_id = %self.spec.id, "resumed");
            self.should_resume.notify_all();
        }
        if state.status == RunnerStatus::Paused {
            state.status = RunnerStatus::Reading;
        }
        if state.stop_requested {
            LoopSignal::Stop
        } else {
            LoopSignal::Continue
        }
    }

    fn set_status(&self, status: RunnerStatus) {
        self.state.lock().expect("state lock poisoned").status = status;
    }

    fn latest_sequence_sealed(&self) -> bool {
        let state = self.state.lock().expect("state lock poisoned");
        state.sequences.last().map_or(false, |s| s.checkpointed)
    }

    fn latest_sequence_open(&self) -> bool {
        !self.latest_sequence_sealed()
    }

    /// Partitions whose current offset has not yet reached their bound.
    fn reading_partitions(&self, stream: &str) -> BTreeSet<StreamPartition<F::PartitionId>> {
        let state = self.state.lock().expect("state lock poisoned");
        state
            .curr_offsets
            .iter()
            .filter(|(partition, curr)| {
                if curr.is_end_of_shard() {
                    return false;
                }
                match state.end_offsets.get(partition) {
                    Some(end) if end.is_end_of_shard() => false,
                    Some(end) if !end.is_no_end() => *curr < end,
                    _ => true,
                }
            })
            .map(|(partition, _)| StreamPartition::new(stream.to_owned(), partition.clone()))
            .collect()
    }

    fn sequences_from_checkpoints(
        &self,
        value: &serde_json::Value,
    ) -> Result<Vec<SequenceMetadata<F::PartitionId, F::Sequence>>, RunnerError> {
        use strata_types::PartitionKey;

        // The supervisor passes checkpoints either as a JSON object or as a
        // string-encoded one, depending on the transport that carried the
        // context.
        let parsed: BTreeMap<String, BTreeMap<String, F::Sequence>> = match value {
            serde_json::Value::String(s) => {
                serde_json::from_str(s).context("decoding checkpoints context")?
            }
            other => serde_json::from_value(other.clone())
                .context("decoding checkpoints context")?,
        };
        let mut checkpoints: BTreeMap<i32, BTreeMap<F::PartitionId, F::Sequence>> =
            BTreeMap::new();
        for (id, offsets) in parsed {
            let id: i32 = id
                .parse()
                .map_err(|_| anyhow!("invalid checkpoint sequence id {id:?}"))?;
            let mut map = BTreeMap::new();
            for (partition, sequence) in offsets {
                let partition = F::PartitionId::parse_key(&partition)
                    .map_err(|e| anyhow!("invalid checkpoint partition: {e}"))?;
                map.insert(partition, sequence);
            }
            checkpoints.insert(id, map);
        }
        if checkpoints.is_empty() {
            return Err(RunnerError::Invariant(
                "checkpoints context present but empty".into(),
            ));
        }

        let io = &self.spec.io_config;
        let ids: Vec<i32> = checkpoints.keys().copied().collect();
        let mut sequences = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            let start = checkpoints[id].clone();
            let (end, sealed) = match ids.get(i + 1) {
                Some(next_id) => (checkpoints[next_id].clone(), true),
                None => (io.end_partitions.partition_sequence_map.clone(), false),
            };
            sequences.push(SequenceMetadata::new(
                *id,
                &io.base_sequence_name,
                start,
                end,
                sealed,
            ));
        }
        info!(count = sequences.len(), "reconstructed sequences from context checkpoints");
        Ok(sequences)
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    fn publish_all(
        self: &Arc<Self>,
        driver: &mut dyn SegmentDriver,
        actions: &dyn MetadataActionClient,
        stream: &str,
    ) -> Result<(), RunnerError> {
        self.set_status(RunnerStatus::Publishing);
        info!(task_id = %self.spec.id, "publishing");

        // Seal the open sequence at wherever reading stopped and retire all
        // assignments; the chain is final from here on.
        let sequences = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let curr = state.curr_offsets.clone();
            for sequence in state.sequences.iter_mut() {
                if !sequence.checkpointed {
                    for partition in sequence.assignments.clone() {
                        if let Some(offset) = curr.get(&partition) {
                            sequence.end_offsets.insert(partition, offset.clone());
                        }
                    }
                    sequence.checkpointed = true;
                }
                sequence.assignments.clear();
            }
            save_sequences(&self.persist_dir, &state.sequences)?;
            state.sequences.clone()
        };

        // Persist buffered rows with the final offsets before promoting
        // anything.
        let commit_snapshot = {
            let state = self.state.lock().expect("state lock poisoned");
            StreamPartitions::new(stream.to_owned(), state.curr_offsets.clone())
        };
        let commit_value =
            serde_json::to_value(&commit_snapshot).context("encoding commit metadata")?;
        self.block_on_cancellable(driver.persist(commit_value))??;

        let use_transaction = self.spec.tuning_config.use_transaction;
        let mut handoff_segments: Vec<SegmentIdentifier> = Vec::new();
        for sequence in sequences {
            let segments = self
                .block_on_cancellable(driver.push_segments(vec![sequence.sequence_name.clone()]))??;
            let insert = SegmentTransactionalInsert {
                datasource: self.spec.datasource.clone(),
                segments: segments.clone(),
                start_metadata: use_transaction.then(|| {
                    F::wrap_metadata(StreamMetadata::from_map(
                        stream.to_owned(),
                        sequence.start_offsets.clone(),
                    ))
                }),
                end_metadata: use_transaction.then(|| {
                    F::wrap_metadata(StreamMetadata::from_map(
                        stream.to_owned(),
                        sequence.end_offsets.clone(),
                    ))
                }),
            };
            let accepted =
                self.block_on_cancellable(actions.segment_transactional_insert(insert))??;
            if !accepted {
                return Err(RunnerError::PublishRejected {
                    sequence_name: sequence.sequence_name,
                });
            }
            info!(
                sequence = %sequence.sequence_name,
                segments = segments.len(),
                "publish accepted"
            );
            handoff_segments.extend(segments);

            // A published sequence leaves the chain; a restart must not
            // publish it again.
            let mut state = self.state.lock().expect("state lock poisoned");
            state
                .sequences
                .retain(|s| s.sequence_id != sequence.sequence_id);
            save_sequences(&self.persist_dir, &state.sequences)?;
        }

        if !handoff_segments.is_empty() {
            let handoff = driver.await_handoff(handoff_segments);
            let outcome = match self.spec.tuning_config.handoff_condition_timeout() {
                None => self.block_on_cancellable(handoff)?,
                Some(limit) => {
                    match self.block_on_cancellable(tokio::time::timeout(limit, handoff))? {
                        Ok(result) => result,
                        Err(_elapsed) => {
                            // Publish already succeeded; the segments will be
                            // picked up eventually. Alert and move on.
                            warn!(
                                timeout_ms = limit.as_millis() as u64,
                                "segment handoff did not complete in time"
                            );
                            Ok(())
                        }
                    }
                }
            };
            if let Err(e) = outcome {
                warn!("handoff watcher failed: {:#}", e);
            }
        }
        Ok(())
    }

    /// Drives a future on the runtime, racing it against shutdown
    /// cancellation from `stop_gracefully`.
    fn block_on_cancellable<T>(
        &self,
        fut: impl Future<Output = T>,
    ) -> Result<T, RunnerError> {
        self.handle.block_on(async {
            tokio::select! {
                _ = self.publish_cancel.notified() => Err(RunnerError::Interrupted),
                value = fut => Ok(value),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::TimeZone;

    use strata_types::{BrokerFlavor, BrokerOffset, DataSourceMetadata, ShardFlavor, ShardSequence};

    use crate::config::{TaskIoConfig, TaskTuningConfig};
    use crate::task::IndexTaskSpec;
    use crate::testing::{
        test_row_parser, InMemoryMetadataStore, MockRecordSupplier, MockSegmentDriver,
        RecordingAnnouncer,
    };

    use super::*;

    const WAIT_BUDGET: Duration = Duration::from_secs(10);

    fn broker_spec(
        start: &[(i32, i64)],
        end: &[(i32, i64)],
        tuning: TaskTuningConfig,
    ) -> IndexTaskSpec<i32, BrokerOffset> {
        IndexTaskSpec {
            id: "index_broker_events_abc".into(),
            datasource: "events".into(),
            io_config: TaskIoConfig {
                task_group_id: 0,
                base_sequence_name: "events_base".into(),
                start_partitions: StreamPartitions::new(
                    "events",
                    start.iter().map(|(p, o)| (*p, BrokerOffset(*o))).collect(),
                ),
                end_partitions: StreamPartitions::new(
                    "events",
                    end.iter().map(|(p, o)| (*p, BrokerOffset(*o))).collect(),
                ),
                minimum_message_time: None,
                maximum_message_time: None,
                exclusive_start_partitions: BTreeSet::new(),
            },
            tuning_config: tuning,
            context: BTreeMap::new(),
        }
    }

    fn quick_tuning() -> TaskTuningConfig {
        TaskTuningConfig {
            poll_timeout_millis: 10,
            ..TaskTuningConfig::default()
        }
    }

    fn rec(partition: i32, offset: i64, ts: i64) -> StreamRecord<i32, BrokerOffset> {
        StreamRecord::new(
            "events",
            partition,
            BrokerOffset(offset),
            vec![format!(r#"{{"ts": {ts}, "n": {offset}}}"#).into_bytes()],
        )
    }

    struct Harness<F: StreamFlavor> {
        runner: Arc<TaskRunner<F>>,
        supplier: MockRecordSupplier<F>,
        driver: MockSegmentDriver,
        store: InMemoryMetadataStore,
        announcer: RecordingAnnouncer,
        persist_dir: PathBuf,
        join: Mutex<Option<thread::JoinHandle<TaskCompletionReport>>>,
        _dir: tempfile::TempDir,
        _rt: tokio::runtime::Runtime,
    }

    impl<F: StreamFlavor> Harness<F> {
        fn start(spec: IndexTaskSpec<F::PartitionId, F::Sequence>) -> Self {
            Self::start_with(spec, MockSegmentDriver::new(), InMemoryMetadataStore::new())
        }

        fn start_with(
            spec: IndexTaskSpec<F::PartitionId, F::Sequence>,
            driver: MockSegmentDriver,
            store: InMemoryMetadataStore,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self::start_in(spec, driver, store, dir)
        }

        fn start_in(
            spec: IndexTaskSpec<F::PartitionId, F::Sequence>,
            driver: MockSegmentDriver,
            store: InMemoryMetadataStore,
            dir: tempfile::TempDir,
        ) -> Self {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_time()
                .build()
                .unwrap();
            let persist_dir = dir.path().to_path_buf();
            let runner = TaskRunner::<F>::new(spec, persist_dir.clone(), rt.handle().clone());
            let supplier = MockRecordSupplier::<F>::new();
            let announcer = RecordingAnnouncer::new();
            let join = thread::spawn({
                let runner = Arc::clone(&runner);
                let mut supplier = supplier.clone();
                let mut driver = driver.clone();
                let store = store.clone();
                let announcer = announcer.clone();
                move || {
                    let parser = test_row_parser();
                    runner.run(&mut supplier, &mut driver, &store, &parser, &announcer)
                }
            });
            Harness {
                runner,
                supplier,
                driver,
                store,
                announcer,
                persist_dir,
                join: Mutex::new(Some(join)),
                _dir: dir,
                _rt: rt,
            }
        }

        fn finish(&self) -> TaskCompletionReport {
            self.join
                .lock()
                .unwrap()
                .take()
                .expect("already joined")
                .join()
                .expect("run thread panicked")
        }

        fn wait_for<C: Fn() -> bool>(&self, what: &str, cond: C) {
            let deadline = Instant::now() + WAIT_BUDGET;
            while !cond() {
                if Instant::now() > deadline {
                    panic!("timed out waiting for {what}");
                }
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn wait_for_status(&self, status: RunnerStatus) {
            self.wait_for(&format!("status {status:?}"), || {
                self.runner.status() == status
            });
        }

        fn wait_for_current(
            &self,
            partition: F::PartitionId,
            sequence: F::Sequence,
        ) {
            self.wait_for("current offset", || {
                self.runner.current_offsets().get(&partition) == Some(&sequence)
            });
        }

        fn pause_now(&self) -> BTreeMap<F::PartitionId, F::Sequence> {
            match self.runner.pause().expect("pause accepted") {
                PauseOutcome::Paused(offsets) => offsets,
                PauseOutcome::Accepted => panic!("pause not acknowledged in time"),
            }
        }
    }

    fn offsets<const N: usize>(entries: [(i32, i64); N]) -> BTreeMap<i32, BrokerOffset> {
        entries.into_iter().map(|(p, o)| (p, BrokerOffset(o))).collect()
    }

    #[test]
    fn reads_to_bounds_and_publishes_once() {
        let spec = broker_spec(&[(0, 0), (1, 0)], &[(0, 2), (1, 1)], quick_tuning());
        let h = Harness::<BrokerFlavor>::start(spec);
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![rec(0, 0, 1), rec(0, 1, 2), rec(1, 0, 3)]);

        let report = h.finish();
        assert_eq!(report.state, TaskState::Success);
        assert_eq!(report.row_stats.processed, 3);

        let added = h.driver.added();
        assert_eq!(added.len(), 3);
        assert!(added.iter().all(|(seq, _)| seq == "events_base_0"));

        let published = h.store.published();
        assert_eq!(published.len(), 1);
        let insert = &published[0];
        assert_eq!(insert.segments.len(), 1);
        match insert.start_metadata.as_ref().unwrap() {
            DataSourceMetadata::Broker(m) => {
                assert_eq!(m.partitions.partition_sequence_map, offsets([(0, 0), (1, 0)]));
            }
            _ => panic!("wrong flavor"),
        }
        assert_eq!(
            h.store.metadata("events"),
            Some(DataSourceMetadata::Broker(StreamMetadata::from_map(
                "events",
                offsets([(0, 2), (1, 1)]),
            )))
        );

        // The cleanup frame ran in full.
        assert!(h.driver.is_closed());
        assert!(h.supplier.is_closed());
        assert!(h.announcer.was_announced());
        assert!(!h.announcer.is_announced());

        // Published sequences left the persisted chain.
        let chain: Vec<SequenceMetadata<i32, BrokerOffset>> =
            load_sequences(&h.persist_dir).unwrap().unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn replaying_a_published_task_is_a_noop() {
        let store = InMemoryMetadataStore::new();
        let spec = broker_spec(&[(0, 0)], &[(0, 2)], quick_tuning());

        let h = Harness::<BrokerFlavor>::start_with(
            spec.clone(),
            MockSegmentDriver::new(),
            store.clone(),
        );
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![rec(0, 0, 1), rec(0, 1, 2)]);
        assert_eq!(h.finish().state, TaskState::Success);
        assert_eq!(store.published().len(), 1);

        // Same task again, same start metadata: the compare-and-swap must
        // refuse and nothing may be double-published.
        let h2 = Harness::<BrokerFlavor>::start_with(
            spec,
            MockSegmentDriver::new(),
            store.clone(),
        );
        h2.wait_for_status(RunnerStatus::Reading);
        h2.supplier.push_batch(vec![rec(0, 0, 1), rec(0, 1, 2)]);
        let report = h2.finish();
        assert_eq!(report.state, TaskState::Failed);
        assert!(report.error_msg.unwrap().contains("publish rejected"));
        assert_eq!(store.published().len(), 1);
        assert_eq!(
            store.metadata("events"),
            Some(DataSourceMetadata::Broker(StreamMetadata::from_map(
                "events",
                offsets([(0, 2)]),
            )))
        );
    }

    #[test]
    fn pause_parks_at_exact_offsets() {
        let spec = broker_spec(&[(0, 0)], &[(0, i64::MAX)], quick_tuning());
        let h = Harness::<BrokerFlavor>::start(spec);
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![rec(0, 0, 1)]);
        h.wait_for_current(0, BrokerOffset(1));

        let parked = h.pause_now();
        assert_eq!(parked, offsets([(0, 1)]));
        assert_eq!(h.runner.status(), RunnerStatus::Paused);

        // Records queued while paused are not processed.
        h.supplier.push_batch(vec![rec(0, 1, 2)]);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(h.runner.current_offsets(), offsets([(0, 1)]));

        h.runner.resume().unwrap();
        h.wait_for_current(0, BrokerOffset(2));

        // Wind down: seal at the current position.
        h.pause_now();
        h.runner
            .set_end_offsets(offsets([(0, 2)]), true)
            .unwrap();
        let report = h.finish();
        assert_eq!(report.state, TaskState::Success);
    }

    #[test]
    fn checkpoint_splits_sequences_and_publishes_each() {
        let spec = broker_spec(&[(0, 0)], &[(0, i64::MAX)], quick_tuning());
        let h = Harness::<BrokerFlavor>::start(spec);
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![rec(0, 0, 1), rec(0, 1, 2)]);
        h.wait_for_current(0, BrokerOffset(2));

        h.pause_now();
        let echoed = h
            .runner
            .set_end_offsets(offsets([(0, 2)]), false)
            .unwrap();
        assert_eq!(echoed, offsets([(0, 2)]));

        // The task resumed itself and now carries two sequences.
        h.wait_for_status(RunnerStatus::Reading);
        assert_eq!(
            h.runner.checkpoints(),
            BTreeMap::from([
                (0, offsets([(0, 0)])),
                (1, offsets([(0, 2)])),
            ])
        );

        h.supplier.push_batch(vec![rec(0, 2, 3)]);
        h.wait_for_current(0, BrokerOffset(3));
        let added = h.driver.added();
        assert_eq!(added[0].0, "events_base_0");
        assert_eq!(added[1].0, "events_base_0");
        assert_eq!(added[2].0, "events_base_1");

        h.pause_now();
        h.runner
            .set_end_offsets(offsets([(0, 3)]), true)
            .unwrap();
        let report = h.finish();
        assert_eq!(report.state, TaskState::Success);

        // One publish per sequence, committed in chain order.
        let published = h.store.published();
        assert_eq!(published.len(), 2);
        let end_of = |insert: &SegmentTransactionalInsert| match insert
            .end_metadata
            .as_ref()
            .unwrap()
        {
            DataSourceMetadata::Broker(m) => m.partitions.partition_sequence_map.clone(),
            _ => panic!("wrong flavor"),
        };
        assert_eq!(end_of(&published[0]), offsets([(0, 2)]));
        assert_eq!(end_of(&published[1]), offsets([(0, 3)]));
        // Offset monotonicity across the two publishes.
        let first_end = published[0].end_metadata.clone().unwrap();
        let second_end = published[1].end_metadata.clone().unwrap();
        assert_eq!(first_end.plus(&second_end), second_end);
        assert_eq!(
            h.store.metadata("events"),
            Some(DataSourceMetadata::Broker(StreamMetadata::from_map(
                "events",
                offsets([(0, 3)]),
            )))
        );
    }

    #[test]
    fn push_signal_pauses_and_reports_checkpoint() {
        let driver = MockSegmentDriver::new();
        driver.push_every(1);
        let spec = broker_spec(&[(0, 0)], &[(0, i64::MAX)], quick_tuning());
        let h = Harness::<BrokerFlavor>::start_with(spec, driver, InMemoryMetadataStore::new());
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![rec(0, 0, 1)]);

        // The driver's push signal makes the task pause itself and file a
        // checkpoint for the open sequence.
        h.wait_for("checkpoint action", || !h.store.checkpoints().is_empty());
        h.wait_for_status(RunnerStatus::Paused);
        let checkpoint = &h.store.checkpoints()[0];
        assert_eq!(checkpoint.task_group_id, 0);
        assert_eq!(checkpoint.base_sequence_name, "events_base");
        match &checkpoint.current_metadata {
            DataSourceMetadata::Broker(m) => {
                assert_eq!(m.partitions.partition_sequence_map, offsets([(0, 1)]));
            }
            _ => panic!("wrong flavor"),
        }

        // Answer the checkpoint the way the supervisor would.
        h.runner
            .set_end_offsets(offsets([(0, 1)]), false)
            .unwrap();
        h.wait_for_status(RunnerStatus::Reading);
        h.pause_now();
        h.runner
            .set_end_offsets(offsets([(0, 1)]), true)
            .unwrap();
        assert_eq!(h.finish().state, TaskState::Success);
    }

    #[test]
    fn closed_shard_retires_partition() {
        let spec = IndexTaskSpec::<String, ShardSequence> {
            id: "index_shard_clicks_abc".into(),
            datasource: "clicks".into(),
            io_config: TaskIoConfig {
                task_group_id: 0,
                base_sequence_name: "clicks_base".into(),
                start_partitions: StreamPartitions::new(
                    "clicks",
                    [
                        ("s0".to_owned(), "0".parse().unwrap()),
                        ("s1".to_owned(), "0".parse().unwrap()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                end_partitions: StreamPartitions::new(
                    "clicks",
                    [
                        ("s0".to_owned(), ShardSequence::no_end()),
                        ("s1".to_owned(), ShardSequence::no_end()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                minimum_message_time: None,
                maximum_message_time: None,
                exclusive_start_partitions: BTreeSet::new(),
            },
            tuning_config: quick_tuning(),
            context: BTreeMap::new(),
        };
        let h = Harness::<ShardFlavor>::start(spec);
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![
            StreamRecord::new(
                "clicks",
                "s0".to_owned(),
                "0".parse().unwrap(),
                vec![br#"{"ts": 1}"#.to_vec()],
            ),
            StreamRecord::end_of_shard("clicks", "s0".to_owned()),
            StreamRecord::new(
                "clicks",
                "s1".to_owned(),
                "0".parse().unwrap(),
                vec![br#"{"ts": 2}"#.to_vec()],
            ),
        ]);

        h.wait_for("shard retirement", || {
            h.runner
                .current_offsets()
                .get("s0")
                .map_or(false, |s| s.is_end_of_shard())
        });
        h.wait_for("assignment narrowed", || {
            let assigned = h.supplier.current_assignment();
            assigned.len() == 1 && assigned.iter().all(|p| p.partition_id == "s1")
        });

        h.pause_now();
        let finals: BTreeMap<String, ShardSequence> = [
            ("s0".to_owned(), ShardSequence::end_of_shard()),
            ("s1".to_owned(), "1".parse().unwrap()),
        ]
        .into_iter()
        .collect();
        h.runner.set_end_offsets(finals, true).unwrap();
        let report = h.finish();
        assert_eq!(report.state, TaskState::Success);

        // The closed-shard sentinel is committed so successors never reopen
        // the shard.
        match h.store.metadata("clicks").unwrap() {
            DataSourceMetadata::Shard(m) => {
                assert!(m.partitions.get(&"s0".to_owned()).unwrap().is_end_of_shard());
                assert_eq!(
                    m.partitions.get(&"s1".to_owned()),
                    Some(&"1".parse().unwrap())
                );
            }
            _ => panic!("wrong flavor"),
        }
    }

    #[test]
    fn driver_metadata_overrides_start_offsets() {
        let driver = MockSegmentDriver::new();
        driver.restore_metadata(
            serde_json::to_value(StreamPartitions::new(
                "events",
                offsets([(0, 5)]),
            ))
            .unwrap(),
        );
        let spec = broker_spec(&[(0, 3)], &[(0, i64::MAX)], quick_tuning());
        let h = Harness::<BrokerFlavor>::start_with(spec, driver, InMemoryMetadataStore::new());
        h.wait_for_status(RunnerStatus::Reading);
        assert_eq!(h.runner.current_offsets(), offsets([(0, 5)]));
        assert!(h
            .supplier
            .seeks()
            .contains(&(StreamPartition::new("events", 0), BrokerOffset(5))));

        h.supplier.push_batch(vec![rec(0, 5, 1)]);
        h.wait_for_current(0, BrokerOffset(6));
        h.pause_now();
        h.runner
            .set_end_offsets(offsets([(0, 6)]), true)
            .unwrap();
        assert_eq!(h.finish().state, TaskState::Success);
    }

    #[test]
    fn unavailable_start_offset_fails_without_reset() {
        // The availability probe runs once during startup, so the earliest
        // bound must be in place before the run thread exists.
        let spec = broker_spec(&[(0, 3)], &[(0, i64::MAX)], quick_tuning());
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap();
        let runner =
            TaskRunner::<BrokerFlavor>::new(spec, dir.path().to_path_buf(), rt.handle().clone());
        let supplier = MockRecordSupplier::<BrokerFlavor>::new();
        supplier.set_earliest(StreamPartition::new("events", 0), BrokerOffset(10));
        let report = {
            let mut supplier = supplier.clone();
            let mut driver = MockSegmentDriver::new();
            let parser = test_row_parser();
            runner.run(
                &mut supplier,
                &mut driver,
                &InMemoryMetadataStore::new(),
                &parser,
                &RecordingAnnouncer::new(),
            )
        };
        assert_eq!(report.state, TaskState::Failed);
        assert!(report.error_msg.unwrap().contains("no longer available"));
    }

    #[test]
    fn unavailable_start_offset_resets_when_configured() {
        let tuning = TaskTuningConfig {
            reset_offset_automatically: true,
            ..quick_tuning()
        };
        let spec = broker_spec(&[(0, 3)], &[(0, i64::MAX)], tuning);
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap();
        let runner =
            TaskRunner::<BrokerFlavor>::new(spec, dir.path().to_path_buf(), rt.handle().clone());
        let supplier = MockRecordSupplier::<BrokerFlavor>::new();
        supplier.set_earliest(StreamPartition::new("events", 0), BrokerOffset(10));
        let store = InMemoryMetadataStore::new();
        let join = thread::spawn({
            let runner = Arc::clone(&runner);
            let mut supplier = supplier.clone();
            let store = store.clone();
            move || {
                let mut driver = MockSegmentDriver::new();
                let parser = test_row_parser();
                runner.run(&mut supplier, &mut driver, &store, &parser, &RecordingAnnouncer::new())
            }
        });

        // The task files a reset and parks, waiting for the supervisor to
        // tear it down.
        let deadline = Instant::now() + WAIT_BUDGET;
        while store.resets().is_empty() || runner.status() != RunnerStatus::Paused {
            assert!(Instant::now() < deadline, "reset never filed");
            thread::sleep(Duration::from_millis(5));
        }
        let reset = &store.resets()[0];
        assert_eq!(reset.datasource, "events");
        match reset.metadata.as_ref().unwrap() {
            DataSourceMetadata::Broker(m) => {
                assert_eq!(m.partitions.partition_sequence_map, offsets([(0, 3)]));
            }
            _ => panic!("wrong flavor"),
        }
        runner.stop_gracefully();
        join.join().unwrap();
    }

    #[test]
    fn parse_failures_respect_the_budget() {
        let tuning = TaskTuningConfig {
            max_parse_exceptions: 1,
            ..quick_tuning()
        };
        let spec = broker_spec(&[(0, 0)], &[(0, i64::MAX)], tuning);
        let h = Harness::<BrokerFlavor>::start(spec);
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![
            StreamRecord::new("events", 0, BrokerOffset(0), vec![b"not json".to_vec()]),
            StreamRecord::new("events", 0, BrokerOffset(1), vec![b"also bad".to_vec()]),
        ]);
        let report = h.finish();
        assert_eq!(report.state, TaskState::Failed);
        assert!(report.error_msg.unwrap().contains("parse failures"));
        assert_eq!(report.row_stats.unparseable, 2);
        assert_eq!(h.runner.unparseable_events().len(), 2);
    }

    #[test]
    fn message_time_window_throws_rows_away() {
        let mut spec = broker_spec(&[(0, 0)], &[(0, 3)], quick_tuning());
        spec.io_config.minimum_message_time = Some(Utc.timestamp_opt(100, 0).unwrap());
        spec.io_config.maximum_message_time = Some(Utc.timestamp_opt(200, 0).unwrap());
        let h = Harness::<BrokerFlavor>::start(spec);
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier
            .push_batch(vec![rec(0, 0, 50), rec(0, 1, 150), rec(0, 2, 250)]);
        let report = h.finish();
        assert_eq!(report.state, TaskState::Success);
        assert_eq!(report.row_stats.processed, 1);
        assert_eq!(report.row_stats.thrown_away, 2);
    }

    #[test]
    fn offset_gaps_are_fatal_unless_skipped() {
        let spec = broker_spec(&[(0, 0)], &[(0, i64::MAX)], quick_tuning());
        let h = Harness::<BrokerFlavor>::start(spec);
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![rec(0, 0, 1), rec(0, 5, 2)]);
        let report = h.finish();
        assert_eq!(report.state, TaskState::Failed);
        assert!(report.error_msg.unwrap().contains("offset gap"));

        let tuning = TaskTuningConfig {
            skip_offset_gaps: true,
            ..quick_tuning()
        };
        let spec = broker_spec(&[(0, 0)], &[(0, i64::MAX)], tuning);
        let h = Harness::<BrokerFlavor>::start(spec);
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![rec(0, 0, 1), rec(0, 5, 2)]);
        h.wait_for_current(0, BrokerOffset(6));
        h.pause_now();
        h.runner
            .set_end_offsets(offsets([(0, 6)]), true)
            .unwrap();
        assert_eq!(h.finish().state, TaskState::Success);
    }

    #[test]
    fn handoff_timeout_is_a_nonfatal_alert() {
        let driver = MockSegmentDriver::new();
        driver.hang_handoff();
        let tuning = TaskTuningConfig {
            handoff_condition_timeout_millis: 200,
            ..quick_tuning()
        };
        let spec = broker_spec(&[(0, 0)], &[(0, 1)], tuning);
        let h = Harness::<BrokerFlavor>::start_with(spec, driver, InMemoryMetadataStore::new());
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![rec(0, 0, 1)]);
        let report = h.finish();
        // Publish succeeded; the unfinished handoff only alerts.
        assert_eq!(report.state, TaskState::Success);
        assert_eq!(h.store.published().len(), 1);
        assert!(h.driver.handoffs().is_empty());
    }

    #[test]
    fn restored_chain_publishes_every_owed_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let chain = vec![
            SequenceMetadata::new(
                0,
                "events_base",
                offsets([(0, 0)]),
                offsets([(0, 2)]),
                true,
            ),
            SequenceMetadata::new(
                1,
                "events_base",
                offsets([(0, 2)]),
                [(0, BrokerOffset::no_end())].into_iter().collect(),
                false,
            ),
        ];
        save_sequences(dir.path(), &chain).unwrap();

        let driver = MockSegmentDriver::new();
        driver.restore_metadata(
            serde_json::to_value(StreamPartitions::new("events", offsets([(0, 2)]))).unwrap(),
        );
        let spec = broker_spec(&[(0, 0)], &[(0, i64::MAX)], quick_tuning());
        let h = Harness::<BrokerFlavor>::start_in(
            spec,
            driver,
            InMemoryMetadataStore::new(),
            dir,
        );
        h.wait_for_status(RunnerStatus::Reading);
        assert_eq!(
            h.runner.checkpoints(),
            BTreeMap::from([(0, offsets([(0, 0)])), (1, offsets([(0, 2)]))])
        );

        h.supplier.push_batch(vec![rec(0, 2, 1)]);
        h.wait_for_current(0, BrokerOffset(3));
        h.pause_now();
        h.runner
            .set_end_offsets(offsets([(0, 3)]), true)
            .unwrap();
        let report = h.finish();
        assert_eq!(report.state, TaskState::Success);

        // Both the restored sealed sequence and the live one published, in
        // chain order, advancing the commit monotonically.
        let published = h.store.published();
        assert_eq!(published.len(), 2);
        assert_eq!(
            h.store.metadata("events"),
            Some(DataSourceMetadata::Broker(StreamMetadata::from_map(
                "events",
                offsets([(0, 3)]),
            )))
        );
    }

    #[test]
    fn graceful_stop_publishes_progress() {
        let spec = broker_spec(&[(0, 0)], &[(0, i64::MAX)], quick_tuning());
        let h = Harness::<BrokerFlavor>::start(spec);
        h.wait_for_status(RunnerStatus::Reading);
        h.supplier.push_batch(vec![rec(0, 0, 1)]);
        h.wait_for_current(0, BrokerOffset(1));

        h.runner.stop_gracefully();
        let report = h.finish();
        assert_eq!(report.state, TaskState::Success);
        let published = h.store.published();
        assert_eq!(published.len(), 1);
        match published[0].end_metadata.as_ref().unwrap() {
            DataSourceMetadata::Broker(m) => {
                assert_eq!(m.partitions.partition_sequence_map, offsets([(0, 1)]));
            }
            _ => panic!("wrong flavor"),
        }
    }
}
