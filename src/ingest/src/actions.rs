// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Metadata-store actions.
//!
//! Tasks and the supervisor never touch the metadata store directly; they
//! submit typed actions to the orchestrator, which executes them inside the
//! store's transaction boundary. The only write path for offset commits is
//! [`SegmentTransactionalInsert`]: a compare-and-swap that installs segments
//! and the next commit together, or refuses both.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use strata_types::DataSourceMetadata;

use crate::driver::SegmentIdentifier;

/// Atomically publishes `segments` and advances the stored offset commit
/// from `start_metadata` to `end_metadata`.
///
/// The store accepts iff its current metadata for the datasource equals
/// `start_metadata` (equality via the metadata `matches` algebra). A `false`
/// result means some other writer got there first; the caller's work is
/// already represented and must not be retried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTransactionalInsert {
    pub datasource: String,
    pub segments: Vec<SegmentIdentifier>,
    /// `None` when the task runs without transactions: the insert is then
    /// unconditional and carries no commit.
    pub start_metadata: Option<DataSourceMetadata>,
    pub end_metadata: Option<DataSourceMetadata>,
}

/// Records an intermediate checkpoint taken by a reading task, so the
/// supervisor can align replicas on the same sequence boundaries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointAction {
    pub datasource: String,
    pub task_group_id: i32,
    pub base_sequence_name: String,
    /// Start offsets of the sequence being checkpointed.
    pub start_metadata: DataSourceMetadata,
    /// The task's current offsets: where the next sequence begins.
    pub current_metadata: DataSourceMetadata,
}

/// Rewrites or deletes the stored offset commit.
///
/// With `metadata` present, exactly the named partitions are removed from
/// the stored commit (the `minus` algebra); with `None`, the datasource's
/// commit is deleted outright.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetMetadataAction {
    pub datasource: String,
    pub metadata: Option<DataSourceMetadata>,
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("stored metadata for {datasource} is unparseable: {detail}")]
    CorruptMetadata { datasource: String, detail: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Client for submitting actions to the orchestrator.
#[async_trait]
pub trait MetadataActionClient: Send + Sync {
    /// Returns whether the compare-and-swap succeeded.
    async fn segment_transactional_insert(
        &self,
        insert: SegmentTransactionalInsert,
    ) -> Result<bool, ActionError>;

    async fn checkpoint(&self, action: CheckpointAction) -> Result<bool, ActionError>;

    async fn reset_metadata(&self, action: ResetMetadataAction) -> Result<bool, ActionError>;

    async fn retrieve_metadata(
        &self,
        datasource: &str,
    ) -> Result<Option<DataSourceMetadata>, ActionError>;
}
