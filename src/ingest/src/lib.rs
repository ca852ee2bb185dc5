// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Strata ingestion task runner.
//!
//! An ingestion task owns a slice of a stream's partitions for one span of
//! its life: it reads records from its assigned start offsets toward its
//! assigned end offsets, pushes parsed rows into an external segment driver
//! under named sequences, persists its sequence bookkeeping across restarts,
//! and finally promotes the built segments with a transactional publish that
//! couples the segments to an offset commit in the metadata store. The
//! compare-and-swap in that publish is what upgrades at-least-once stream
//! consumption to exactly-once delivery.
//!
//! The task is driven by the [`runner::TaskRunner`] state machine
//! (`NOT_STARTED -> STARTING -> READING <-> PAUSED -> PUBLISHING`) and
//! remotely controlled over the HTTP surface in [`http`]: the supervisor
//! pauses it, reads its offsets, installs end offsets, and resumes it.
//!
//! External collaborators are taken at trait seams: the segment driver
//! ([`driver::SegmentDriver`]), the metadata store
//! ([`actions::MetadataActionClient`]), and task discovery
//! ([`task::TaskAnnouncer`]). The record supplier comes from
//! `strata-stream-client`.

pub mod actions;
pub mod config;
pub mod driver;
pub mod http;
pub mod meters;
pub mod runner;
pub mod sequences;
pub mod task;
pub mod testing;
