// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Row-level ingestion counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// How many recent unparseable payload descriptions are retained for the
/// `/unparseableEvents` endpoint.
const SAVED_PARSE_EXCEPTIONS: usize = 10;

/// Counters updated by the run thread and snapshotted by HTTP readers.
#[derive(Debug, Default)]
pub struct RowIngestionMeters {
    processed: AtomicU64,
    processed_with_error: AtomicU64,
    unparseable: AtomicU64,
    thrown_away: AtomicU64,
    saved_parse_exceptions: Mutex<VecDeque<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowStats {
    pub processed: u64,
    pub processed_with_error: u64,
    pub unparseable: u64,
    pub thrown_away: u64,
}

impl RowIngestionMeters {
    pub fn incr_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_processed_with_error(&self) {
        self.processed_with_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_thrown_away(&self) {
        self.thrown_away.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one unparseable payload and returns the cumulative total of
    /// rows that failed to parse cleanly, which the runner compares against
    /// its parse-exception budget.
    pub fn incr_unparseable(&self, description: String) -> u64 {
        let mut saved = self
            .saved_parse_exceptions
            .lock()
            .expect("parse exception lock poisoned");
        if saved.len() == SAVED_PARSE_EXCEPTIONS {
            saved.pop_front();
        }
        saved.push_back(description);
        drop(saved);
        self.unparseable.fetch_add(1, Ordering::Relaxed)
            + 1
            + self.processed_with_error.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RowStats {
        RowStats {
            processed: self.processed.load(Ordering::Relaxed),
            processed_with_error: self.processed_with_error.load(Ordering::Relaxed),
            unparseable: self.unparseable.load(Ordering::Relaxed),
            thrown_away: self.thrown_away.load(Ordering::Relaxed),
        }
    }

    pub fn saved_parse_exceptions(&self) -> Vec<String> {
        self.saved_parse_exceptions
            .lock()
            .expect("parse exception lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
