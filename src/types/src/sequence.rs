// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Totally ordered sequence numbers with shard-lifecycle sentinels.

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Errors arising from parsing or advancing sequence numbers.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("invalid sequence number: {0:?}")]
    Unparseable(String),
    #[error("cannot advance sentinel sequence number {0}")]
    SentinelAdvance(String),
}

/// A position within one stream partition.
///
/// Every implementation carries a total order in which the two reserved
/// sentinels bracket all real positions: `END_OF_SHARD` (the shard is closed,
/// nothing further will ever be delivered) sorts below every non-sentinel,
/// and `NO_END` (an open-ended upper bound) sorts above every non-sentinel.
/// Equality is numeric, never textual.
pub trait SequenceNumber:
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
    /// The closed-shard sentinel.
    fn end_of_shard() -> Self;

    /// The open-ended upper bound sentinel.
    fn no_end() -> Self;

    fn is_end_of_shard(&self) -> bool {
        *self == Self::end_of_shard()
    }

    fn is_no_end(&self) -> bool {
        *self == Self::no_end()
    }

    fn is_sentinel(&self) -> bool {
        self.is_end_of_shard() || self.is_no_end()
    }

    /// The position immediately after `self`.
    ///
    /// Callers never advance a sentinel; doing so is a programming error
    /// surfaced as [`SequenceError::SentinelAdvance`].
    fn next(&self) -> Result<Self, SequenceError>;

    /// How many records lie between `earlier` and `self`, where the domain
    /// supports the subtraction. Opaque sequence domains return `None` and
    /// lag reporting degrades gracefully.
    fn offset_distance(&self, earlier: &Self) -> Option<u64> {
        let _ = earlier;
        None
    }
}

/// A Kafka-style broker offset.
///
/// Real offsets are nonnegative. The sentinels are encoded at the extremes of
/// the i64 domain, which makes the derived integer order the sequence order.
/// Broker partitions never close, so `END_OF_SHARD` never appears in a
/// committed offset map; the encoding exists so the runner logic is uniform
/// across flavors.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct BrokerOffset(pub i64);

const END_OF_SHARD_OFFSET: i64 = i64::MIN;
const NO_END_OFFSET: i64 = i64::MAX;

impl SequenceNumber for BrokerOffset {
    fn end_of_shard() -> Self {
        BrokerOffset(END_OF_SHARD_OFFSET)
    }

    fn no_end() -> Self {
        BrokerOffset(NO_END_OFFSET)
    }

    fn next(&self) -> Result<Self, SequenceError> {
        if self.is_sentinel() {
            return Err(SequenceError::SentinelAdvance(self.to_string()));
        }
        Ok(BrokerOffset(self.0 + 1))
    }

    fn offset_distance(&self, earlier: &Self) -> Option<u64> {
        if self.is_sentinel() || earlier.is_sentinel() {
            return None;
        }
        Some(self.0.saturating_sub(earlier.0).max(0) as u64)
    }
}

impl fmt::Display for BrokerOffset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            END_OF_SHARD_OFFSET => f.write_str("END_OF_SHARD"),
            NO_END_OFFSET => f.write_str("NO_END"),
            o => write!(f, "{}", o),
        }
    }
}

impl From<i64> for BrokerOffset {
    fn from(offset: i64) -> Self {
        BrokerOffset(offset)
    }
}

/// A Kinesis-style opaque sequence number: a nonnegative decimal integer of
/// unbounded width, carried as a string.
///
/// Ordering is numeric. The digit strings the stream service hands out carry
/// no leading zeros, so comparing by length and then lexicographically is
/// exactly the big-integer order; [`ShardSequence::cmp`] still strips leading
/// zeros first so that round-tripped values from other producers compare
/// correctly.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardSequence(String);

const END_OF_SHARD_MARKER: &str = "END_OF_SHARD";
const NO_END_MARKER: &str = "NO_END";

impl ShardSequence {
    /// Wraps a raw digit string without validation. Reserved for values that
    /// came from the stream service itself.
    pub fn new_unchecked<S: Into<String>>(seq: S) -> Self {
        ShardSequence(seq.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digits(&self) -> &str {
        self.0.trim_start_matches('0')
    }
}

impl FromStr for ShardSequence {
    type Err = SequenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == END_OF_SHARD_MARKER || s == NO_END_MARKER {
            return Ok(ShardSequence(s.to_owned()));
        }
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SequenceError::Unparseable(s.to_owned()));
        }
        Ok(ShardSequence(s.to_owned()))
    }
}

// Equality and hashing must agree with the numeric order: "010" and "10"
// denote the same position.
impl PartialEq for ShardSequence {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ShardSequence {}

impl Hash for ShardSequence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        if self.is_sentinel() {
            self.0.hash(state);
        } else {
            self.digits().hash(state);
        }
    }
}

impl Ord for ShardSequence {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_sentinel(), other.is_sentinel()) {
            (true, true) => match (self.0.as_str(), other.0.as_str()) {
                (a, b) if a == b => Ordering::Equal,
                (END_OF_SHARD_MARKER, _) => Ordering::Less,
                _ => Ordering::Greater,
            },
            (true, false) => {
                if self.is_end_of_shard() {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, true) => other.cmp(self).reverse(),
            (false, false) => {
                let (a, b) = (self.digits(), other.digits());
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
        }
    }
}

impl PartialOrd for ShardSequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl SequenceNumber for ShardSequence {
    fn end_of_shard() -> Self {
        ShardSequence(END_OF_SHARD_MARKER.to_owned())
    }

    fn no_end() -> Self {
        ShardSequence(NO_END_MARKER.to_owned())
    }

    fn is_end_of_shard(&self) -> bool {
        self.0 == END_OF_SHARD_MARKER
    }

    fn is_no_end(&self) -> bool {
        self.0 == NO_END_MARKER
    }

    fn next(&self) -> Result<Self, SequenceError> {
        if self.is_sentinel() {
            return Err(SequenceError::SentinelAdvance(self.to_string()));
        }
        // Decimal increment with carry, widening on overflow ("999" -> "1000").
        let mut digits = self.0.clone().into_bytes();
        for d in digits.iter_mut().rev() {
            if *d == b'9' {
                *d = b'0';
            } else {
                *d += 1;
                return Ok(ShardSequence(String::from_utf8(digits).expect("ascii digits")));
            }
        }
        digits.insert(0, b'1');
        Ok(ShardSequence(String::from_utf8(digits).expect("ascii digits")))
    }
}

impl fmt::Display for ShardSequence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
