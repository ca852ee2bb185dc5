// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Core value types for Strata stream ingestion.
//!
//! A seekable stream is a set of partitions, each delivering records in
//! strictly increasing sequence-number order. This crate defines the
//! vocabulary shared by the record suppliers, the ingestion task runner, and
//! the supervisor:
//!
//!   * [`SequenceNumber`]: a totally ordered position within one partition,
//!     with reserved `END_OF_SHARD` and `NO_END` sentinels;
//!   * [`StreamPartition`] and [`StreamPartitions`]: partition identities and
//!     immutable `partition -> sequence` snapshots;
//!   * [`DataSourceMetadata`]: the durable offset commit coupled to every
//!     transactional segment publish, with its union/difference/match
//!     algebra;
//!   * [`StreamRecord`]: one delivered record.
//!
//! Two stream flavors exist and are selected by the [`StreamFlavor`]
//! capability set: broker streams (Kafka-style, `i32` partitions with `i64`
//! offsets) and shard streams (Kinesis-style, string shard ids with opaque
//! decimal sequence numbers).

mod metadata;
mod partitions;
mod record;
mod sequence;

pub use metadata::{DataSourceMetadata, StreamMetadata};
pub use partitions::{
    partition_keyed_map, stable_partition_hash, PartitionKey, StreamPartition, StreamPartitions,
};
pub use record::StreamRecord;
pub use sequence::{BrokerOffset, SequenceError, SequenceNumber, ShardSequence};

/// The capability set that selects a stream flavor.
///
/// The ingestion runner and the supervisor are generic over this trait
/// instead of over an inheritance hierarchy: everything that differs between
/// broker and shard streams is either a type choice (partition ids, sequence
/// numbers) or one of the constants below.
pub trait StreamFlavor: Send + Sync + 'static {
    type PartitionId: PartitionKey;
    type Sequence: SequenceNumber;

    /// Human-readable flavor name used in task ids and log lines.
    const NAME: &'static str;

    /// Whether the segment driver should skip lineage checks when a task
    /// appends rows for a sequence it did not itself open. Broker tasks allow
    /// this (replicas may replay each other's sequences after a restart);
    /// shard tasks do not.
    const SKIP_SEGMENT_LINEAGE_CHECK: bool;

    /// Whether holes in the delivered sequence numbers are an expected part
    /// of the stream. Shard sequences are sparse; broker offsets are
    /// contiguous unless the topic is compacted.
    const SEQUENCE_GAPS_EXPECTED: bool;

    /// Wraps a flavor-typed metadata snapshot into the on-wire tagged form.
    fn wrap_metadata(
        meta: StreamMetadata<Self::PartitionId, Self::Sequence>,
    ) -> DataSourceMetadata;

    /// Recovers the flavor-typed snapshot from the tagged form, or `None` if
    /// the stored metadata belongs to the other flavor.
    fn unwrap_metadata(
        meta: DataSourceMetadata,
    ) -> Option<StreamMetadata<Self::PartitionId, Self::Sequence>>;
}

/// Marker for Kafka-style streams: integer partitions, contiguous i64 offsets.
pub enum BrokerFlavor {}

/// Marker for Kinesis-style streams: string shard ids, opaque decimal
/// sequence numbers, shards that can close.
pub enum ShardFlavor {}

impl StreamFlavor for BrokerFlavor {
    type PartitionId = i32;
    type Sequence = BrokerOffset;

    const NAME: &'static str = "broker";
    const SKIP_SEGMENT_LINEAGE_CHECK: bool = true;
    const SEQUENCE_GAPS_EXPECTED: bool = false;

    fn wrap_metadata(meta: StreamMetadata<i32, BrokerOffset>) -> DataSourceMetadata {
        DataSourceMetadata::Broker(meta)
    }

    fn unwrap_metadata(meta: DataSourceMetadata) -> Option<StreamMetadata<i32, BrokerOffset>> {
        match meta {
            DataSourceMetadata::Broker(m) => Some(m),
            DataSourceMetadata::Shard(_) => None,
        }
    }
}

impl StreamFlavor for ShardFlavor {
    type PartitionId = String;
    type Sequence = ShardSequence;

    const NAME: &'static str = "shard";
    const SKIP_SEGMENT_LINEAGE_CHECK: bool = false;
    const SEQUENCE_GAPS_EXPECTED: bool = true;

    fn wrap_metadata(meta: StreamMetadata<String, ShardSequence>) -> DataSourceMetadata {
        DataSourceMetadata::Shard(meta)
    }

    fn unwrap_metadata(
        meta: DataSourceMetadata,
    ) -> Option<StreamMetadata<String, ShardSequence>> {
        match meta {
            DataSourceMetadata::Shard(m) => Some(m),
            DataSourceMetadata::Broker(_) => None,
        }
    }
}
