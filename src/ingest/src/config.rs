// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_types::{PartitionKey, SequenceNumber, StreamPartitions};

/// Tuning knobs for one ingestion task. All fields default so specs only
/// carry overrides.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskTuningConfig {
    /// Couple every publish to a metadata compare-and-swap. Disabling this
    /// forfeits exactly-once delivery and exists for lab use only.
    pub use_transaction: bool,
    /// Broker flavor only: tolerate holes in the offset sequence instead of
    /// failing the task. Gaps appear when topics are compacted.
    pub skip_offset_gaps: bool,
    /// How long to wait for segment handoff after a successful publish.
    /// Zero means wait forever. Expiry is an alert, not a failure.
    pub handoff_condition_timeout_millis: u64,
    /// Wall-clock period after which the runner checkpoints even without a
    /// segment-boundary signal from the driver.
    pub intermediate_handoff_period_millis: u64,
    /// Cumulative parse failures beyond this count fail the task.
    pub max_parse_exceptions: u64,
    /// Log each unparseable payload at warn level.
    pub log_parse_exceptions: bool,
    /// When the start offset has fallen out of retention, reset the stored
    /// metadata through the orchestrator instead of failing.
    pub reset_offset_automatically: bool,
    /// Skip the startup probe that confirms the start offsets are still
    /// retained by the stream.
    pub skip_sequence_number_availability_check: bool,
    /// Budget handed to each supplier poll.
    pub poll_timeout_millis: u64,
}

impl Default for TaskTuningConfig {
    fn default() -> Self {
        TaskTuningConfig {
            use_transaction: true,
            skip_offset_gaps: false,
            handoff_condition_timeout_millis: 0,
            // Effectively "never" unless the driver asks for a push first.
            intermediate_handoff_period_millis: Duration::from_secs(60 * 60 * 24 * 365)
                .as_millis() as u64,
            max_parse_exceptions: 0,
            log_parse_exceptions: false,
            reset_offset_automatically: false,
            skip_sequence_number_availability_check: false,
            poll_timeout_millis: 100,
        }
    }
}

impl TaskTuningConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_millis)
    }

    pub fn intermediate_handoff_period(&self) -> Duration {
        Duration::from_millis(self.intermediate_handoff_period_millis)
    }

    /// `None` means wait forever.
    pub fn handoff_condition_timeout(&self) -> Option<Duration> {
        match self.handoff_condition_timeout_millis {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// The slice of stream a task is responsible for.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "P: PartitionKey, S: Serialize",
    deserialize = "P: PartitionKey, S: serde::Deserialize<'de>"
))]
pub struct TaskIoConfig<P: PartitionKey, S: SequenceNumber> {
    pub task_group_id: i32,
    /// Shared by every replica in the task group; sequence names derive from
    /// it, and the supervisor recognizes its own tasks by it.
    pub base_sequence_name: String,
    pub start_partitions: StreamPartitions<P, S>,
    pub end_partitions: StreamPartitions<P, S>,
    /// Rows with timestamps before this are thrown away (late-message
    /// rejection).
    #[serde(default)]
    pub minimum_message_time: Option<DateTime<Utc>>,
    /// Rows with timestamps after this are thrown away (early-message
    /// rejection).
    #[serde(default)]
    pub maximum_message_time: Option<DateTime<Utc>>,
    /// Partitions whose start sequence number was already published by a
    /// predecessor task and must not be ingested again.
    #[serde(default)]
    pub exclusive_start_partitions: BTreeSet<P>,
}

impl<P: PartitionKey, S: SequenceNumber> TaskIoConfig<P, S> {
    pub fn stream(&self) -> &str {
        &self.start_partitions.stream
    }
}

#[cfg(test)]
mod tests {
    use strata_types::BrokerOffset;

    use super::*;

    #[test]
    fn tuning_defaults_round_trip() {
        let tuning: TaskTuningConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(tuning, TaskTuningConfig::default());
        assert!(tuning.use_transaction);
        assert_eq!(tuning.handoff_condition_timeout(), None);

        let overridden: TaskTuningConfig =
            serde_json::from_str(r#"{"useTransaction":false,"handoffConditionTimeoutMillis":5000}"#)
                .unwrap();
        assert!(!overridden.use_transaction);
        assert_eq!(
            overridden.handoff_condition_timeout(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn io_config_serializes_with_camel_case_keys() {
        let io = TaskIoConfig::<i32, BrokerOffset> {
            task_group_id: 0,
            base_sequence_name: "events_a1b2".into(),
            start_partitions: StreamPartitions::new(
                "events",
                [(0, BrokerOffset(3))].into_iter().collect(),
            ),
            end_partitions: StreamPartitions::new(
                "events",
                [(0, BrokerOffset::no_end())].into_iter().collect(),
            ),
            minimum_message_time: None,
            maximum_message_time: None,
            exclusive_start_partitions: BTreeSet::new(),
        };
        let json = serde_json::to_value(&io).unwrap();
        assert_eq!(json["baseSequenceName"], "events_a1b2");
        assert_eq!(json["startPartitions"]["partitionSequenceMap"]["0"], 3);
        let back: TaskIoConfig<i32, BrokerOffset> = serde_json::from_value(json).unwrap();
        assert_eq!(back, io);
    }
}
