// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task specs, terminal status, and the completion report.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use strata_types::{PartitionKey, SequenceNumber};

use crate::config::{TaskIoConfig, TaskTuningConfig};
use crate::meters::RowStats;

/// Context key under which the supervisor passes accumulated checkpoints to
/// a replacement task: a JSON map of `sequence id -> start offsets`.
pub const CHECKPOINTS_CONTEXT_KEY: &str = "checkpoints";

/// Everything needed to run one ingestion task. Serialized into the
/// orchestrator's task queue by the supervisor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "P: PartitionKey, S: Serialize",
    deserialize = "P: PartitionKey, S: serde::Deserialize<'de>"
))]
pub struct IndexTaskSpec<P: PartitionKey, S: SequenceNumber> {
    pub id: String,
    pub datasource: String,
    pub io_config: TaskIoConfig<P, S>,
    #[serde(default)]
    pub tuning_config: TaskTuningConfig,
    /// Free-form task context; see [`CHECKPOINTS_CONTEXT_KEY`].
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

/// Terminal task state as reported to the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Success,
    Failed,
}

/// Written next to the persist directory when the task exits, and returned
/// by the run entry point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletionReport {
    pub task_id: String,
    pub state: TaskState,
    pub row_stats: RowStats,
    #[serde(default)]
    pub error_msg: Option<String>,
}

pub const REPORT_FILE: &str = "report.json";

impl TaskCompletionReport {
    pub fn write_to(&self, dir: &Path) -> Result<(), anyhow::Error> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating report directory {}", dir.display()))?;
        let path = dir.join(REPORT_FILE);
        let buf = serde_json::to_vec_pretty(self).context("encoding completion report")?;
        fs::write(&path, buf).with_context(|| format!("writing {}", path.display()))
    }
}

/// Presence announcement for task discovery. The orchestrator's discovery
/// fabric is out of scope; tasks call through this seam on entry to
/// `STARTING` and unconditionally on the way out.
pub trait TaskAnnouncer: Send + Sync {
    fn announce(&self, task_id: &str);
    fn unannounce(&self, task_id: &str);
}

/// Discovery for embedders that have none.
pub struct NoopAnnouncer;

impl TaskAnnouncer for NoopAnnouncer {
    fn announce(&self, task_id: &str) {
        tracing::info!(task_id, "task announced");
    }

    fn unannounce(&self, task_id: &str) {
        tracing::info!(task_id, "task unannounced");
    }
}
