// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Seekable stream clients.
//!
//! A [`RecordSupplier`] is the uniform client an ingestion task uses to read
//! a slice of a partitioned stream: assign a working set of partitions, seek
//! each to a sequence number, and poll for ordered records. The contract is
//! identical for both stream flavors; only the scheduling underneath
//! differs:
//!
//!   * [`kafka::BrokerRecordSupplier`] drives a single `rdkafka` consumer
//!     synchronously and returns whatever the driver yields;
//!   * [`kinesis::ShardRecordSupplier`] runs per-shard fetchers on a
//!     fixed-size worker pool that feeds a bounded record buffer.
//!
//! Errors inside the suppliers' background machinery never surface through
//! [`RecordSupplier::poll`]; they are logged and only influence when the
//! machinery runs next.

use std::collections::BTreeSet;
use std::time::Duration;

use strata_types::{StreamFlavor, StreamPartition, StreamRecord};

pub mod kafka;
pub mod kinesis;

/// Errors surfaced by record supplier operations.
///
/// `poll` never returns these: transient stream-broker trouble is absorbed
/// inside the supplier. The probe and assignment operations do fail, and the
/// caller decides whether the failure is fatal for its task.
#[derive(Debug, thiserror::Error)]
pub enum SupplierError {
    #[error("stream {stream} does not exist")]
    StreamNotFound { stream: String },

    #[error("partition {partition} is not assigned")]
    NotAssigned { partition: String },

    #[error("no record arrived for {partition} within the {}ms fetch window", timeout.as_millis())]
    ProbeTimeout {
        partition: String,
        timeout: Duration,
    },

    #[error("supplier is closed")]
    Closed,

    #[error(transparent)]
    Client(#[from] anyhow::Error),
}

/// A seekable client over one stream's partitions.
///
/// Implementations are owned and driven by a single task thread; none of the
/// methods are re-entrant. `close` is idempotent and releases background
/// resources within a bounded deadline.
pub trait RecordSupplier<F: StreamFlavor>: Send {
    /// Replaces the working set. State held for partitions no longer in the
    /// set is discarded.
    fn assign(
        &mut self,
        partitions: BTreeSet<StreamPartition<F::PartitionId>>,
    ) -> Result<(), SupplierError>;

    /// The current working set.
    fn assignment(&self) -> BTreeSet<StreamPartition<F::PartitionId>>;

    /// Positions `partition` so the next poll returns the record at
    /// `sequence` (inclusive).
    fn seek(
        &mut self,
        partition: &StreamPartition<F::PartitionId>,
        sequence: &F::Sequence,
    ) -> Result<(), SupplierError>;

    /// Repositions the given partitions at the lower retention bound.
    fn seek_to_earliest(
        &mut self,
        partitions: &BTreeSet<StreamPartition<F::PartitionId>>,
    ) -> Result<(), SupplierError>;

    /// Repositions the given partitions past the most recent record.
    fn seek_to_latest(
        &mut self,
        partitions: &BTreeSet<StreamPartition<F::PartitionId>>,
    ) -> Result<(), SupplierError>;

    /// Returns 0..N records in assignment order, waiting at most `timeout`.
    fn poll(&mut self, timeout: Duration) -> Vec<StreamRecord<F::PartitionId, F::Sequence>>;

    /// Non-consuming probe for the earliest retained sequence number.
    /// Returns the `END_OF_SHARD` sentinel if the partition is closed and
    /// empty.
    fn earliest_sequence_number(
        &mut self,
        partition: &StreamPartition<F::PartitionId>,
    ) -> Result<F::Sequence, SupplierError>;

    /// Non-consuming probe for the latest sequence number.
    fn latest_sequence_number(
        &mut self,
        partition: &StreamPartition<F::PartitionId>,
    ) -> Result<F::Sequence, SupplierError>;

    /// Lists the stream's live partitions. Fails if the stream is absent.
    fn partition_ids(&mut self, stream: &str) -> Result<BTreeSet<F::PartitionId>, SupplierError>;

    /// Releases the supplier. Idempotent.
    fn close(&mut self);
}
