// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The supervisor's externally visible status report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a task group's starting offsets came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OffsetsSource {
    /// The stored offset commit for the datasource.
    StoredMetadata,
    /// Probed from the stream's retention lower bound.
    StreamEarliest,
    /// Probed from the stream's tail.
    StreamLatest,
    /// Inherited from the predecessor group's final offsets.
    PriorGroup,
    /// Adopted from a running task found at startup.
    AdoptedTask,
}

/// Snapshot of one task, active or publishing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub group_id: i32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Seconds of reading time left before rollover; absent for publishing
    /// tasks.
    #[serde(default)]
    pub remaining_seconds: Option<i64>,
    /// Offsets keyed by the partition's string form; values are the
    /// flavor's wire encoding.
    #[serde(default)]
    pub current_offsets: BTreeMap<String, serde_json::Value>,
}

/// Snapshot of one task group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub group_id: i32,
    pub base_sequence_name: String,
    pub offsets_source: OffsetsSource,
    pub start_offsets: BTreeMap<String, serde_json::Value>,
}

/// The full status report served at `GET /status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorReport {
    pub datasource: String,
    pub stream: String,
    pub suspended: bool,
    pub partitions: usize,
    pub replicas: usize,
    pub task_count: usize,
    pub active_tasks: Vec<TaskSnapshot>,
    pub publishing_tasks: Vec<TaskSnapshot>,
    pub groups: Vec<GroupSnapshot>,
    /// Per-partition records-behind-latest. Only computable for streams
    /// whose sequence domain supports subtraction (broker offsets); opaque
    /// domains report `None`.
    #[serde(default)]
    pub lag: Option<BTreeMap<String, u64>>,
    #[serde(default)]
    pub aggregate_lag: Option<u64>,
}
