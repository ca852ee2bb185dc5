// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Delivered stream records.

use serde::{Deserialize, Serialize};

use crate::partitions::{PartitionKey, StreamPartition};
use crate::sequence::SequenceNumber;

/// One record delivered by a record supplier.
///
/// `data` is an ordered list of payload blobs: broker records carry exactly
/// one, shard records may aggregate several. A record whose sequence number
/// is the `END_OF_SHARD` sentinel is a marker that the partition has closed;
/// it carries no data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord<P, S> {
    pub stream: String,
    pub partition_id: P,
    pub sequence_number: S,
    pub data: Vec<Vec<u8>>,
}

impl<P: PartitionKey, S: SequenceNumber> StreamRecord<P, S> {
    pub fn new<N: Into<String>>(stream: N, partition_id: P, sequence_number: S, data: Vec<Vec<u8>>) -> Self {
        StreamRecord {
            stream: stream.into(),
            partition_id,
            sequence_number,
            data,
        }
    }

    /// A marker record signaling that the partition has closed.
    pub fn end_of_shard<N: Into<String>>(stream: N, partition_id: P) -> Self {
        StreamRecord {
            stream: stream.into(),
            partition_id,
            sequence_number: S::end_of_shard(),
            data: Vec::new(),
        }
    }

    pub fn is_end_of_shard_marker(&self) -> bool {
        self.sequence_number.is_end_of_shard()
    }

    pub fn stream_partition(&self) -> StreamPartition<P> {
        StreamPartition::new(self.stream.clone(), self.partition_id.clone())
    }
}
