// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The durable offset commit and its algebra.
//!
//! Every transactional segment publish carries a pair of
//! [`DataSourceMetadata`] values: the expected stored state and the target
//! state. The metadata store compares the stored value against the expected
//! one and, only on a match, atomically installs the segments together with
//! the target. The algebra below (`plus`, `minus`, `matches`) is what the
//! store and the supervisor use to merge, reset, and compare commits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::partitions::{PartitionKey, StreamPartitions};
use crate::sequence::SequenceNumber;

/// A committed `partition -> sequence` map for one stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "P: PartitionKey, S: Serialize",
    deserialize = "P: PartitionKey, S: serde::Deserialize<'de>"
))]
pub struct StreamMetadata<P: Ord, S> {
    pub partitions: StreamPartitions<P, S>,
}

impl<P: PartitionKey, S: SequenceNumber> StreamMetadata<P, S> {
    pub fn new(partitions: StreamPartitions<P, S>) -> Self {
        StreamMetadata { partitions }
    }

    pub fn from_map<N: Into<String>>(stream: N, map: BTreeMap<P, S>) -> Self {
        StreamMetadata {
            partitions: StreamPartitions::new(stream, map),
        }
    }

    pub fn stream(&self) -> &str {
        &self.partitions.stream
    }

    /// Keys unioned; on conflict `other` wins. If the streams differ, `other`
    /// replaces `self` wholesale.
    pub fn plus(&self, other: &Self) -> Self {
        if self.stream() != other.stream() {
            return other.clone();
        }
        let mut merged = self.partitions.partition_sequence_map.clone();
        for (p, s) in &other.partitions.partition_sequence_map {
            merged.insert(p.clone(), s.clone());
        }
        StreamMetadata::from_map(self.stream().to_owned(), merged)
    }

    /// Removes every key present in `other`. If the streams differ, `self`
    /// is untouched.
    pub fn minus(&self, other: &Self) -> Self {
        if self.stream() != other.stream() {
            return self.clone();
        }
        let mut remaining = self.partitions.partition_sequence_map.clone();
        for p in other.partitions.partition_sequence_map.keys() {
            remaining.remove(p);
        }
        StreamMetadata::from_map(self.stream().to_owned(), remaining)
    }

    /// Whether the two commits agree on every partition they share.
    pub fn matches(&self, other: &Self) -> bool {
        self.plus(other) == other.plus(self)
    }
}

/// The tagged, on-wire form of a committed offset map.
///
/// The discriminator selects the stream flavor, which in turn fixes the
/// serialized shape: broker offsets encode as 64-bit integers, shard
/// sequences as strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DataSourceMetadata {
    Broker(StreamMetadata<i32, crate::BrokerOffset>),
    Shard(StreamMetadata<String, crate::ShardSequence>),
}

impl DataSourceMetadata {
    pub fn stream(&self) -> &str {
        match self {
            DataSourceMetadata::Broker(m) => m.stream(),
            DataSourceMetadata::Shard(m) => m.stream(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            DataSourceMetadata::Broker(m) => m.partitions.is_empty(),
            DataSourceMetadata::Shard(m) => m.partitions.is_empty(),
        }
    }

    pub fn plus(&self, other: &Self) -> Self {
        match (self, other) {
            (DataSourceMetadata::Broker(a), DataSourceMetadata::Broker(b)) => {
                DataSourceMetadata::Broker(a.plus(b))
            }
            (DataSourceMetadata::Shard(a), DataSourceMetadata::Shard(b)) => {
                DataSourceMetadata::Shard(a.plus(b))
            }
            // Mismatched flavors: the incoming commit replaces the stored one.
            _ => other.clone(),
        }
    }

    pub fn minus(&self, other: &Self) -> Self {
        match (self, other) {
            (DataSourceMetadata::Broker(a), DataSourceMetadata::Broker(b)) => {
                DataSourceMetadata::Broker(a.minus(b))
            }
            (DataSourceMetadata::Shard(a), DataSourceMetadata::Shard(b)) => {
                DataSourceMetadata::Shard(a.minus(b))
            }
            _ => self.clone(),
        }
    }

    pub fn matches(&self, other: &Self) -> bool {
        self.plus(other) == other.plus(self)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::{BrokerOffset, SequenceNumber, ShardSequence};

    use super::*;

    fn broker(stream: &str, entries: &[(i32, i64)]) -> StreamMetadata<i32, BrokerOffset> {
        StreamMetadata::from_map(
            stream,
            entries.iter().map(|(p, o)| (*p, BrokerOffset(*o))).collect(),
        )
    }

    #[test]
    fn plus_unions_with_other_winning() {
        let a = broker("events", &[(0, 3), (1, 5)]);
        let b = broker("events", &[(1, 9), (2, 1)]);
        let merged = a.plus(&b);
        assert_eq!(merged, broker("events", &[(0, 3), (1, 9), (2, 1)]));
        // Result values are drawn from one of the operands, never invented.
        for (p, s) in &merged.partitions.partition_sequence_map {
            let from_a = a.partitions.get(p);
            let from_b = b.partitions.get(p);
            assert!(Some(s) == from_a || Some(s) == from_b);
        }
    }

    #[test]
    fn plus_across_streams_is_replacement() {
        let a = broker("events", &[(0, 3)]);
        let b = broker("clicks", &[(7, 7)]);
        assert_eq!(a.plus(&b), b);
        assert_eq!(b.plus(&a), a);
    }

    #[test]
    fn minus_removes_named_partitions() {
        let a = broker("events", &[(0, 3), (1, 5), (2, 8)]);
        let sub = broker("events", &[(1, 999)]);
        assert_eq!(a.minus(&sub), broker("events", &[(0, 3), (2, 8)]));
        // Values in the subtrahend are irrelevant; only keys matter.
        assert_eq!(a.minus(&a), broker("events", &[]));
        let other_stream = broker("clicks", &[(0, 0)]);
        assert_eq!(a.minus(&other_stream), a);
    }

    #[test]
    fn matches_iff_plus_commutes() {
        let a = broker("events", &[(0, 3), (1, 5)]);
        let agreeing = broker("events", &[(1, 5), (2, 2)]);
        let conflicting = broker("events", &[(1, 6)]);
        assert!(a.matches(&agreeing));
        assert!(agreeing.matches(&a));
        assert!(!a.matches(&conflicting));
        assert!(a.matches(&a));
    }

    #[test]
    fn tagged_serialization_discriminates_flavors() {
        let broker_meta = DataSourceMetadata::Broker(broker("events", &[(0, 42)]));
        let json = serde_json::to_string(&broker_meta).unwrap();
        assert_eq!(
            json,
            r#"{"type":"broker","partitions":{"stream":"events","partitionSequenceMap":{"0":42}}}"#
        );
        assert_eq!(
            serde_json::from_str::<DataSourceMetadata>(&json).unwrap(),
            broker_meta
        );

        let mut shards = BTreeMap::new();
        shards.insert(
            "shardId-000000000000".to_owned(),
            "49590338271490256608559692538361571095921575989136588898".parse().unwrap(),
        );
        shards.insert("shardId-000000000001".to_owned(), ShardSequence::no_end());
        let shard_meta = DataSourceMetadata::Shard(StreamMetadata::from_map("clicks", shards));
        let json = serde_json::to_string(&shard_meta).unwrap();
        assert!(json.starts_with(r#"{"type":"shard""#));
        assert!(json.contains(r#""shardId-000000000001":"NO_END""#));
        assert_eq!(
            serde_json::from_str::<DataSourceMetadata>(&json).unwrap(),
            shard_meta
        );
    }

    #[test]
    fn committed_metadata_advances_monotonically() {
        // The shape every pair of consecutive publishes must satisfy.
        let p1 = DataSourceMetadata::Broker(broker("events", &[(0, 5), (1, 7)]));
        let p2 = DataSourceMetadata::Broker(broker("events", &[(0, 9), (1, 7)]));
        assert_eq!(p1.plus(&p2), p2);
        match (&p1, &p2) {
            (DataSourceMetadata::Broker(old), DataSourceMetadata::Broker(new)) => {
                for (p, s) in &old.partitions.partition_sequence_map {
                    assert!(new.partitions.get(p).unwrap() >= s);
                }
            }
            _ => unreachable!(),
        }
    }
}
