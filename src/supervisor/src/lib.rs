// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-datasource Strata supervisor.
//!
//! A supervisor owns the ingestion lifecycle for one datasource reading one
//! stream: it discovers the stream's partitions, hashes them into task
//! groups, plans and submits replica tasks, chats with them over HTTP to
//! track progress, rolls groups over when their reading duration elapses,
//! replaces failed replicas, and retires groups once every replica has
//! published. All decisions run on a single notice loop; HTTP callbacks and
//! internal timers only enqueue notices.
//!
//! Exactly-once delivery holds across all of this because every handoff
//! between task generations travels through the stored offset commit: a
//! successor group starts precisely where its predecessor's transactional
//! publish left the metadata.

pub mod client;
pub mod config;
pub mod http;
pub mod queue;
pub mod report;
pub mod supervisor;
pub mod testing;
