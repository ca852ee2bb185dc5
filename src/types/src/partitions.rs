// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Stream partition identities and offset snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::sequence::SequenceNumber;

/// A partition identifier within some stream.
///
/// Implemented by `i32` (broker partitions) and `String` (shard ids). Keys
/// live in `BTreeMap`s so snapshots iterate and serialize deterministically.
pub trait PartitionKey:
    Clone
    + fmt::Debug
    + fmt::Display
    + Eq
    + Ord
    + Hash
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Canonical bytes fed to [`stable_partition_hash`].
    fn hash_bytes(&self) -> Vec<u8>;

    /// Parses the canonical string form produced by `Display`. Map keys
    /// travel as strings on the wire (JSON object keys always are), so every
    /// partition key must round-trip through its string form.
    fn parse_key(s: &str) -> Result<Self, String>;
}

impl PartitionKey for i32 {
    fn hash_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn parse_key(s: &str) -> Result<Self, String> {
        s.parse().map_err(|_| format!("invalid partition id: {s:?}"))
    }
}

impl PartitionKey for String {
    fn hash_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn parse_key(s: &str) -> Result<Self, String> {
        Ok(s.to_owned())
    }
}

/// Serde helpers that carry partition-keyed maps with string keys.
///
/// Tagged enums and `flatten` route values through serde's internal content
/// buffer, which re-presents map keys as strings; maps keyed on integers then
/// fail to deserialize. Stringifying the keys ourselves keeps every wire and
/// disk encoding uniform and buffer-proof.
pub mod partition_keyed_map {
    use std::collections::BTreeMap;

    use serde::de::{Deserializer, Error as DeError};
    use serde::ser::{SerializeMap, Serializer};
    use serde::{Deserialize, Serialize};

    use super::PartitionKey;

    pub fn serialize<P, S, Ser>(map: &BTreeMap<P, S>, serializer: Ser) -> Result<Ser::Ok, Ser::Error>
    where
        P: PartitionKey,
        S: Serialize,
        Ser: Serializer,
    {
        let mut m = serializer.serialize_map(Some(map.len()))?;
        for (p, s) in map {
            m.serialize_entry(&p.to_string(), s)?;
        }
        m.end()
    }

    pub fn deserialize<'de, P, S, De>(deserializer: De) -> Result<BTreeMap<P, S>, De::Error>
    where
        P: PartitionKey,
        S: Deserialize<'de>,
        De: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, S>::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for (k, v) in raw {
            map.insert(P::parse_key(&k).map_err(De::Error::custom)?, v);
        }
        Ok(map)
    }
}

/// FNV-1a over the partition key's canonical bytes.
///
/// Task-group placement is `stable_partition_hash(p) % task_count` and must
/// yield the same group for the same partition across supervisor restarts
/// and across processes. The stdlib hasher is randomly keyed per process, so
/// it cannot be used here.
pub fn stable_partition_hash<P: PartitionKey>(partition: &P) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in partition.hash_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// One partition of one stream.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPartition<P> {
    pub stream: String,
    pub partition_id: P,
}

impl<P: PartitionKey> StreamPartition<P> {
    pub fn new<S: Into<String>>(stream: S, partition_id: P) -> Self {
        StreamPartition {
            stream: stream.into(),
            partition_id,
        }
    }
}

impl<P: fmt::Display> fmt::Display for StreamPartition<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]", self.stream, self.partition_id)
    }
}

/// A `partition -> sequence` snapshot scoped to one stream.
///
/// Snapshots are the start/end bounds of tasks and sequences; the only
/// mutable offset map in the system is the runner's current-offsets map, and
/// it is converted into a snapshot at every observation point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "P: PartitionKey, S: Serialize",
    deserialize = "P: PartitionKey, S: Deserialize<'de>"
))]
pub struct StreamPartitions<P: Ord, S> {
    pub stream: String,
    #[serde(with = "partition_keyed_map")]
    pub partition_sequence_map: BTreeMap<P, S>,
}

impl<P: PartitionKey, S: SequenceNumber> StreamPartitions<P, S> {
    pub fn new<N: Into<String>>(stream: N, partition_sequence_map: BTreeMap<P, S>) -> Self {
        StreamPartitions {
            stream: stream.into(),
            partition_sequence_map,
        }
    }

    pub fn empty<N: Into<String>>(stream: N) -> Self {
        Self::new(stream, BTreeMap::new())
    }

    pub fn get(&self, partition: &P) -> Option<&S> {
        self.partition_sequence_map.get(partition)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &P> {
        self.partition_sequence_map.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.partition_sequence_map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partition_sequence_map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_stable() {
        // Pinned values: a change here breaks partition-group stability for
        // every deployed supervisor.
        assert_eq!(stable_partition_hash(&0i32), 0x4d25_767f_9dce_13f5);
        assert_eq!(
            stable_partition_hash(&String::from("shardId-000000000001")),
            stable_partition_hash(&String::from("shardId-000000000001")),
        );
        assert_ne!(
            stable_partition_hash(&String::from("shardId-000000000001")),
            stable_partition_hash(&String::from("shardId-000000000002")),
        );
    }

    #[test]
    fn snapshot_orders_partitions() {
        let parts = StreamPartitions::new(
            "events",
            [(3, crate::BrokerOffset(7)), (1, crate::BrokerOffset(5))]
                .into_iter()
                .collect(),
        );
        let keys: Vec<_> = parts.partitions().copied().collect();
        assert_eq!(keys, vec![1, 3]);
        let json = serde_json::to_string(&parts).unwrap();
        assert_eq!(
            json,
            r#"{"stream":"events","partitionSequenceMap":{"1":5,"3":7}}"#
        );
    }
}
