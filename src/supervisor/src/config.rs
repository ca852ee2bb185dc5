// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Supervisor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use strata_ingest::config::TaskTuningConfig;

/// One supervisor's complete specification: which datasource to feed from
/// which stream, and how aggressively.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSpec {
    pub datasource: String,
    pub stream: String,
    #[serde(default)]
    pub config: SupervisorConfig,
    /// Tuning handed verbatim to every spawned task.
    #[serde(default)]
    pub task_tuning: TaskTuningConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    /// Replica tasks per task group.
    pub replicas: usize,
    /// Task groups per datasource; partitions hash into groups.
    pub task_count: usize,
    /// How long a task group reads before it is rolled over.
    pub task_duration_millis: u64,
    /// How long a pending-completion group may take to publish before its
    /// stragglers are killed.
    pub completion_timeout_millis: u64,
    /// Grace period after supervisor start before the first planning tick.
    pub start_delay_millis: u64,
    /// Interval between planning ticks.
    pub period_millis: u64,
    /// Where brand-new partitions begin when the stored commit has no entry
    /// for them: the stream's earliest retained record, or its tail.
    pub use_earliest_sequence_number: bool,
    /// Rows older than `now - late_period` at task creation are rejected.
    pub late_message_rejection_period_millis: Option<u64>,
    /// Rows newer than `now + task_duration + early_period` are rejected.
    pub early_message_rejection_period_millis: Option<u64>,
    /// Worker budget for fanning out task chat.
    pub chat_threads: usize,
    /// Transport-failure retries per task call before the task is declared
    /// unreachable.
    pub chat_retries: u64,
    /// Per-call task chat timeout.
    pub http_timeout_millis: u64,
    /// Budget for graceful shutdown of the whole supervisor.
    pub shutdown_timeout_millis: u64,
    /// Shard-flavor fetch tuning passed through to spawned tasks' suppliers.
    pub records_per_fetch: usize,
    pub fetch_delay_millis: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            replicas: 1,
            task_count: 1,
            task_duration_millis: 3_600_000,
            completion_timeout_millis: 1_800_000,
            start_delay_millis: 5_000,
            period_millis: 30_000,
            use_earliest_sequence_number: false,
            late_message_rejection_period_millis: None,
            early_message_rejection_period_millis: None,
            chat_threads: 8,
            chat_retries: 8,
            http_timeout_millis: 10_000,
            shutdown_timeout_millis: 80_000,
            records_per_fetch: 4000,
            fetch_delay_millis: 0,
        }
    }
}

impl SupervisorConfig {
    pub fn task_duration(&self) -> Duration {
        Duration::from_millis(self.task_duration_millis)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_millis)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_millis)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_millis)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_millis)
    }

    pub fn late_message_rejection_period(&self) -> Option<Duration> {
        self.late_message_rejection_period_millis.map(Duration::from_millis)
    }

    pub fn early_message_rejection_period(&self) -> Option<Duration> {
        self.early_message_rejection_period_millis.map(Duration::from_millis)
    }
}
