// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The segment driver seam.
//!
//! The driver (the appenderator stack) buffers rows under named sequences,
//! rolls them into segments, persists them locally, and pushes finished
//! segments to deep storage. It is an external collaborator: this crate
//! defines only the slice of it the runner consumes. Crucially, the driver
//! never talks to the metadata store; the transactional coupling of segments
//! to an offset commit stays in the runner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A parsed input row: an event timestamp plus the decoded payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRow {
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Decodes one payload blob into rows. Parse failures feed the task's
/// unparseable meters, never the driver.
pub type RowParser = Box<dyn Fn(&[u8]) -> Result<Vec<ParsedRow>, anyhow::Error> + Send>;

/// Identifies one built segment in the metadata store.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentIdentifier(pub String);

/// Outcome of adding one row.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddResult {
    /// The driver crossed a segment boundary and wants the open sequence
    /// checkpointed and pushed.
    pub push_required: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("segment driver closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The runner's view of the appenderator stack.
///
/// `add` is synchronous (it is the per-record hot path); everything that
/// does IO returns a future the run thread drives through its runtime
/// handle.
#[async_trait]
pub trait SegmentDriver: Send {
    /// Restores driver-local state. Returns the commit metadata persisted by
    /// a prior incarnation of this task, if any: an opaque blob the runner
    /// round-trips through [`SegmentDriver::persist`].
    async fn start(&mut self) -> Result<Option<serde_json::Value>, DriverError>;

    /// Buffers one row under the named sequence.
    fn add(
        &mut self,
        sequence_name: &str,
        row: ParsedRow,
        skip_segment_lineage_check: bool,
    ) -> Result<AddResult, DriverError>;

    /// Persists buffered rows together with the given commit metadata. The
    /// metadata is returned verbatim by `start` after a restart.
    async fn persist(&mut self, commit_metadata: serde_json::Value) -> Result<(), DriverError>;

    /// Pushes the segments built for the named sequences and returns their
    /// identifiers. The segments are not yet visible to queries.
    async fn push_segments(
        &mut self,
        sequence_names: Vec<String>,
    ) -> Result<Vec<SegmentIdentifier>, DriverError>;

    /// Resolves once every named segment has been loaded by a serving node.
    async fn await_handoff(&mut self, segments: Vec<SegmentIdentifier>) -> Result<(), DriverError>;

    /// Releases driver resources. Idempotent; called even on failure paths.
    async fn close(&mut self);
}
