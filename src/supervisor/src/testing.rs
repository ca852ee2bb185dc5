// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scripted task queue and task chat for supervisor tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strata_ingest::runner::RunnerStatus;
use strata_ingest::task::IndexTaskSpec;
use strata_types::StreamFlavor;

use crate::client::{TaskClient, TaskClientError};
use crate::queue::{QueueError, TaskQueueClient, TaskRunState};

// ----------------------------------------------------------------------
// Task queue
// ----------------------------------------------------------------------

struct QueueState<F: StreamFlavor> {
    specs: BTreeMap<String, IndexTaskSpec<F::PartitionId, F::Sequence>>,
    states: BTreeMap<String, TaskRunState>,
    submitted: Vec<String>,
    shutdowns: Vec<String>,
}

/// A task queue that auto-"runs" everything submitted to it.
pub struct MockTaskQueue<F: StreamFlavor> {
    state: Arc<Mutex<QueueState<F>>>,
}

impl<F: StreamFlavor> Clone for MockTaskQueue<F> {
    fn clone(&self) -> Self {
        MockTaskQueue {
            state: Arc::clone(&self.state),
        }
    }
}

impl<F: StreamFlavor> Default for MockTaskQueue<F> {
    fn default() -> Self {
        MockTaskQueue {
            state: Arc::new(Mutex::new(QueueState {
                specs: BTreeMap::new(),
                states: BTreeMap::new(),
                submitted: Vec::new(),
                shutdowns: Vec::new(),
            })),
        }
    }
}

impl<F: StreamFlavor> MockTaskQueue<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a task the supervisor did not submit (e.g. a leftover from
    /// a previous supervisor incarnation).
    pub fn add_external_task(
        &self,
        spec: IndexTaskSpec<F::PartitionId, F::Sequence>,
        state: TaskRunState,
    ) {
        let mut q = self.state.lock().unwrap();
        q.states.insert(spec.id.clone(), state);
        q.specs.insert(spec.id.clone(), spec);
    }

    pub fn set_state(&self, task_id: &str, state: TaskRunState) {
        self.state
            .lock()
            .unwrap()
            .states
            .insert(task_id.to_owned(), state);
    }

    pub fn submitted(&self) -> Vec<IndexTaskSpec<F::PartitionId, F::Sequence>> {
        let q = self.state.lock().unwrap();
        q.submitted
            .iter()
            .map(|id| q.specs[id].clone())
            .collect()
    }

    pub fn shutdowns(&self) -> Vec<String> {
        self.state.lock().unwrap().shutdowns.clone()
    }
}

#[async_trait]
impl<F: StreamFlavor> TaskQueueClient<F> for MockTaskQueue<F> {
    async fn submit(
        &self,
        spec: IndexTaskSpec<F::PartitionId, F::Sequence>,
    ) -> Result<(), QueueError> {
        let mut q = self.state.lock().unwrap();
        q.states.insert(spec.id.clone(), TaskRunState::Running);
        q.submitted.push(spec.id.clone());
        q.specs.insert(spec.id.clone(), spec);
        Ok(())
    }

    async fn shutdown(&self, task_id: &str) -> Result<(), QueueError> {
        let mut q = self.state.lock().unwrap();
        q.shutdowns.push(task_id.to_owned());
        if let Some(state) = q.states.get_mut(task_id) {
            *state = TaskRunState::Failed;
        }
        Ok(())
    }

    async fn active_task_ids(&self, _datasource: &str) -> Result<Vec<String>, QueueError> {
        let q = self.state.lock().unwrap();
        Ok(q.states
            .iter()
            .filter(|(_, s)| !s.is_complete())
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn task_spec(
        &self,
        task_id: &str,
    ) -> Result<Option<IndexTaskSpec<F::PartitionId, F::Sequence>>, QueueError> {
        Ok(self.state.lock().unwrap().specs.get(task_id).cloned())
    }

    async fn task_state(&self, task_id: &str) -> Result<TaskRunState, QueueError> {
        self.state
            .lock()
            .unwrap()
            .states
            .get(task_id)
            .copied()
            .ok_or_else(|| QueueError::UnknownTask(task_id.to_owned()))
    }
}

// ----------------------------------------------------------------------
// Task chat
// ----------------------------------------------------------------------

struct ChatState<F: StreamFlavor> {
    statuses: BTreeMap<String, RunnerStatus>,
    start_times: BTreeMap<String, DateTime<Utc>>,
    offsets: BTreeMap<String, BTreeMap<F::PartitionId, F::Sequence>>,
    checkpoints: BTreeMap<String, BTreeMap<i32, BTreeMap<F::PartitionId, F::Sequence>>>,
    unreachable: BTreeSet<String>,
    pauses: Vec<String>,
    resumes: Vec<String>,
    stops: Vec<String>,
    end_offset_calls: Vec<(String, BTreeMap<F::PartitionId, F::Sequence>, bool)>,
}

/// A task chat client answering from scripted state.
pub struct MockTaskClient<F: StreamFlavor> {
    state: Arc<Mutex<ChatState<F>>>,
}

impl<F: StreamFlavor> Clone for MockTaskClient<F> {
    fn clone(&self) -> Self {
        MockTaskClient {
            state: Arc::clone(&self.state),
        }
    }
}

impl<F: StreamFlavor> Default for MockTaskClient<F> {
    fn default() -> Self {
        MockTaskClient {
            state: Arc::new(Mutex::new(ChatState {
                statuses: BTreeMap::new(),
                start_times: BTreeMap::new(),
                offsets: BTreeMap::new(),
                checkpoints: BTreeMap::new(),
                unreachable: BTreeSet::new(),
                pauses: Vec::new(),
                resumes: Vec::new(),
                stops: Vec::new(),
                end_offset_calls: Vec::new(),
            })),
        }
    }
}

impl<F: StreamFlavor> MockTaskClient<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, task_id: &str, status: RunnerStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(task_id.to_owned(), status);
    }

    pub fn set_start_time(&self, task_id: &str, time: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .start_times
            .insert(task_id.to_owned(), time);
    }

    pub fn set_offsets(
        &self,
        task_id: &str,
        offsets: BTreeMap<F::PartitionId, F::Sequence>,
    ) {
        self.state
            .lock()
            .unwrap()
            .offsets
            .insert(task_id.to_owned(), offsets);
    }

    pub fn set_checkpoints(
        &self,
        task_id: &str,
        checkpoints: BTreeMap<i32, BTreeMap<F::PartitionId, F::Sequence>>,
    ) {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .insert(task_id.to_owned(), checkpoints);
    }

    pub fn set_unreachable(&self, task_id: &str) {
        self.state
            .lock()
            .unwrap()
            .unreachable
            .insert(task_id.to_owned());
    }

    pub fn pauses(&self) -> Vec<String> {
        self.state.lock().unwrap().pauses.clone()
    }

    pub fn end_offset_calls(
        &self,
    ) -> Vec<(String, BTreeMap<F::PartitionId, F::Sequence>, bool)> {
        self.state.lock().unwrap().end_offset_calls.clone()
    }

    fn check_reachable(&self, task_id: &str) -> Result<(), TaskClientError> {
        if self.state.lock().unwrap().unreachable.contains(task_id) {
            return Err(TaskClientError::Unreachable {
                task_id: task_id.to_owned(),
                detail: "scripted unreachable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<F: StreamFlavor> TaskClient<F> for MockTaskClient<F> {
    async fn status(&self, task_id: &str) -> Result<RunnerStatus, TaskClientError> {
        self.check_reachable(task_id)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .statuses
            .get(task_id)
            .copied()
            .unwrap_or(RunnerStatus::Reading))
    }

    async fn start_time(
        &self,
        task_id: &str,
    ) -> Result<Option<DateTime<Utc>>, TaskClientError> {
        self.check_reachable(task_id)?;
        Ok(self.state.lock().unwrap().start_times.get(task_id).copied())
    }

    async fn pause(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<F::PartitionId, F::Sequence>, TaskClientError> {
        self.check_reachable(task_id)?;
        let mut state = self.state.lock().unwrap();
        state.pauses.push(task_id.to_owned());
        state
            .statuses
            .insert(task_id.to_owned(), RunnerStatus::Paused);
        Ok(state.offsets.get(task_id).cloned().unwrap_or_default())
    }

    async fn resume(&self, task_id: &str) -> Result<(), TaskClientError> {
        self.check_reachable(task_id)?;
        let mut state = self.state.lock().unwrap();
        state.resumes.push(task_id.to_owned());
        state
            .statuses
            .insert(task_id.to_owned(), RunnerStatus::Reading);
        Ok(())
    }

    async fn current_offsets(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<F::PartitionId, F::Sequence>, TaskClientError> {
        self.check_reachable(task_id)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .offsets
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn checkpoints(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<i32, BTreeMap<F::PartitionId, F::Sequence>>, TaskClientError> {
        self.check_reachable(task_id)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_end_offsets(
        &self,
        task_id: &str,
        offsets: BTreeMap<F::PartitionId, F::Sequence>,
        finish: bool,
    ) -> Result<(), TaskClientError> {
        self.check_reachable(task_id)?;
        let mut state = self.state.lock().unwrap();
        state
            .end_offset_calls
            .push((task_id.to_owned(), offsets, finish));
        // Installing end offsets resumes the task.
        state
            .statuses
            .insert(task_id.to_owned(), RunnerStatus::Reading);
        Ok(())
    }

    async fn stop(&self, task_id: &str) -> Result<(), TaskClientError> {
        self.check_reachable(task_id)?;
        self.state.lock().unwrap().stops.push(task_id.to_owned());
        Ok(())
    }
}
