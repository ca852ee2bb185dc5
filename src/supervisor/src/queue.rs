// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The orchestrator's task queue, seen from the supervisor.
//!
//! Task scheduling, worker selection, and process supervision are the
//! orchestrator's business; the supervisor only submits specs, kills tasks,
//! and reads back what exists.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use strata_ingest::task::IndexTaskSpec;
use strata_types::StreamFlavor;

/// Queue-level view of one task's life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunState {
    /// Submitted, not yet running.
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskRunState {
    pub fn is_complete(&self) -> bool {
        matches!(self, TaskRunState::Success | TaskRunState::Failed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown task {0}")]
    UnknownTask(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait TaskQueueClient<F: StreamFlavor>: Send + Sync {
    async fn submit(
        &self,
        spec: IndexTaskSpec<F::PartitionId, F::Sequence>,
    ) -> Result<(), QueueError>;

    /// Hard-kills a task. Unknown ids are fine; the task may have exited.
    async fn shutdown(&self, task_id: &str) -> Result<(), QueueError>;

    /// Ids of every pending or running task for the datasource.
    async fn active_task_ids(&self, datasource: &str) -> Result<Vec<String>, QueueError>;

    async fn task_spec(
        &self,
        task_id: &str,
    ) -> Result<Option<IndexTaskSpec<F::PartitionId, F::Sequence>>, QueueError>;

    async fn task_state(&self, task_id: &str) -> Result<TaskRunState, QueueError>;
}
