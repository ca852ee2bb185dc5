// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Chat client for running tasks.
//!
//! The supervisor talks to its tasks over the runner HTTP surface. Every
//! call retries transport failures up to the configured budget; exhausting
//! the budget surfaces as [`TaskClientError::Unreachable`], which the
//! supervisor answers by killing and replacing the task.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use strata_ingest::runner::RunnerStatus;
use strata_types::{PartitionKey, StreamFlavor};

#[derive(Debug, thiserror::Error)]
pub enum TaskClientError {
    #[error("task {task_id} unreachable: {detail}")]
    Unreachable { task_id: String, detail: String },
    #[error("task {task_id} rejected {call}: {detail}")]
    Rejected {
        task_id: String,
        call: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The slice of the runner control surface the supervisor drives.
#[async_trait]
pub trait TaskClient<F: StreamFlavor>: Send + Sync {
    async fn status(&self, task_id: &str) -> Result<RunnerStatus, TaskClientError>;

    async fn start_time(&self, task_id: &str)
        -> Result<Option<DateTime<Utc>>, TaskClientError>;

    /// Pauses the task and returns the offsets it parked at.
    async fn pause(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<F::PartitionId, F::Sequence>, TaskClientError>;

    async fn resume(&self, task_id: &str) -> Result<(), TaskClientError>;

    async fn current_offsets(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<F::PartitionId, F::Sequence>, TaskClientError>;

    async fn checkpoints(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<i32, BTreeMap<F::PartitionId, F::Sequence>>, TaskClientError>;

    async fn set_end_offsets(
        &self,
        task_id: &str,
        offsets: BTreeMap<F::PartitionId, F::Sequence>,
        finish: bool,
    ) -> Result<(), TaskClientError>;

    async fn stop(&self, task_id: &str) -> Result<(), TaskClientError>;
}

/// Resolves a task id to the base URL its runner listens on. Task location
/// is the orchestrator's discovery concern; the supervisor only consumes it.
pub trait TaskLocator: Send + Sync {
    fn locate(&self, task_id: &str) -> Option<String>;
}

/// [`TaskClient`] over HTTP, with retry and per-call timeout.
pub struct HttpTaskClient<L> {
    http: reqwest::Client,
    locator: L,
    retries: u64,
    retry_delay: Duration,
}

impl<L: TaskLocator> HttpTaskClient<L> {
    pub fn new(locator: L, timeout: Duration, retries: u64) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTaskClient {
            http,
            locator,
            retries,
            retry_delay: Duration::from_millis(500),
        })
    }

    fn base_url(&self, task_id: &str) -> Result<String, TaskClientError> {
        self.locator
            .locate(task_id)
            .ok_or_else(|| TaskClientError::Unreachable {
                task_id: task_id.to_owned(),
                detail: "task has no known location".into(),
            })
    }

    /// Issues `request` until it succeeds, returns a non-retryable error, or
    /// the retry budget runs out.
    async fn with_retries<T, Fut>(
        &self,
        task_id: &str,
        call: &'static str,
        mut request: impl FnMut() -> Fut,
    ) -> Result<T, TaskClientError>
    where
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
        T: serde::de::DeserializeOwned,
    {
        let mut last_error = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match request().await {
                Err(e) => {
                    debug!(task_id, call, attempt, "task chat transport error: {e}");
                    last_error = e.to_string();
                }
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(|e| {
                            TaskClientError::Other(anyhow::anyhow!(
                                "decoding {call} response: {e}"
                            ))
                        });
                    }
                    let body = response.text().await.unwrap_or_default();
                    if status.is_client_error() {
                        // The task is alive and said no; retrying will not
                        // change its mind.
                        return Err(TaskClientError::Rejected {
                            task_id: task_id.to_owned(),
                            call,
                            detail: format!("{status}: {body}"),
                        });
                    }
                    debug!(task_id, call, attempt, %status, "task chat server error");
                    last_error = format!("{status}: {body}");
                }
            }
        }
        warn!(task_id, call, "task chat retry budget exhausted");
        Err(TaskClientError::Unreachable {
            task_id: task_id.to_owned(),
            detail: last_error,
        })
    }
}

#[async_trait]
impl<F: StreamFlavor, L: TaskLocator> TaskClient<F> for HttpTaskClient<L> {
    async fn status(&self, task_id: &str) -> Result<RunnerStatus, TaskClientError> {
        let url = format!("{}/status", self.base_url(task_id)?);
        self.with_retries(task_id, "status", || self.http.get(url.as_str()).send())
            .await
    }

    async fn start_time(
        &self,
        task_id: &str,
    ) -> Result<Option<DateTime<Utc>>, TaskClientError> {
        let url = format!("{}/time/start", self.base_url(task_id)?);
        let value: Option<String> = self
            .with_retries(task_id, "start_time", || self.http.get(url.as_str()).send())
            .await?;
        match value {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| TaskClientError::Other(anyhow::anyhow!("bad start time: {e}"))),
        }
    }

    async fn pause(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<F::PartitionId, F::Sequence>, TaskClientError> {
        let url = format!("{}/pause", self.base_url(task_id)?);
        // A 202 means the pause was registered but not yet acknowledged;
        // poll the status until the task parks, then read its offsets.
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            let response = match self.http.post(url.as_str()).send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(task_id, attempt, "pause transport error: {e}");
                    continue;
                }
            };
            match response.status().as_u16() {
                200 => {
                    let raw: BTreeMap<String, F::Sequence> = response.json().await.map_err(
                        |e| TaskClientError::Other(anyhow::anyhow!("decoding pause: {e}")),
                    )?;
                    return parse_offset_keys::<F>(task_id, raw);
                }
                202 => {
                    let status: RunnerStatus =
                        <Self as TaskClient<F>>::status(self, task_id).await?;
                    if status == RunnerStatus::Paused {
                        let offsets =
                            <Self as TaskClient<F>>::current_offsets(self, task_id).await?;
                        return Ok(offsets);
                    }
                }
                code if (400..500).contains(&code) => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(TaskClientError::Rejected {
                        task_id: task_id.to_owned(),
                        call: "pause",
                        detail: format!("{code}: {body}"),
                    });
                }
                _ => {}
            }
        }
        Err(TaskClientError::Unreachable {
            task_id: task_id.to_owned(),
            detail: "pause never acknowledged".into(),
        })
    }

    async fn resume(&self, task_id: &str) -> Result<(), TaskClientError> {
        let url = format!("{}/resume", self.base_url(task_id)?);
        let _: serde_json::Value = self
            .with_retries(task_id, "resume", || self.http.post(url.as_str()).send())
            .await?;
        Ok(())
    }

    async fn current_offsets(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<F::PartitionId, F::Sequence>, TaskClientError> {
        let url = format!("{}/offsets/current", self.base_url(task_id)?);
        let raw: BTreeMap<String, F::Sequence> = self
            .with_retries(task_id, "current_offsets", || self.http.get(url.as_str()).send())
            .await?;
        parse_offset_keys::<F>(task_id, raw)
    }

    async fn checkpoints(
        &self,
        task_id: &str,
    ) -> Result<BTreeMap<i32, BTreeMap<F::PartitionId, F::Sequence>>, TaskClientError> {
        let url = format!("{}/checkpoints", self.base_url(task_id)?);
        let raw: BTreeMap<String, BTreeMap<String, F::Sequence>> = self
            .with_retries(task_id, "checkpoints", || self.http.get(url.as_str()).send())
            .await?;
        let mut out = BTreeMap::new();
        for (id, offsets) in raw {
            let id: i32 = id.parse().map_err(|_| {
                TaskClientError::Other(anyhow::anyhow!("bad checkpoint id {id:?}"))
            })?;
            out.insert(id, parse_offset_keys::<F>(task_id, offsets)?);
        }
        Ok(out)
    }

    async fn set_end_offsets(
        &self,
        task_id: &str,
        offsets: BTreeMap<F::PartitionId, F::Sequence>,
        finish: bool,
    ) -> Result<(), TaskClientError> {
        let url = format!(
            "{}/offsets/end?finish={finish}",
            self.base_url(task_id)?
        );
        let body: BTreeMap<String, &F::Sequence> =
            offsets.iter().map(|(p, s)| (p.to_string(), s)).collect();
        let _: serde_json::Value = self
            .with_retries(task_id, "set_end_offsets", || {
                self.http.post(url.as_str()).json(&body).send()
            })
            .await?;
        Ok(())
    }

    async fn stop(&self, task_id: &str) -> Result<(), TaskClientError> {
        let url = format!("{}/stop", self.base_url(task_id)?);
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.http.post(url.as_str()).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    debug!(task_id, status = %response.status(), "stop not accepted");
                }
                Err(e) => debug!(task_id, "stop transport error: {e}"),
            }
        }
        Err(TaskClientError::Unreachable {
            task_id: task_id.to_owned(),
            detail: "stop never accepted".into(),
        })
    }
}

fn parse_offset_keys<F: StreamFlavor>(
    task_id: &str,
    raw: BTreeMap<String, F::Sequence>,
) -> Result<BTreeMap<F::PartitionId, F::Sequence>, TaskClientError> {
    let mut out = BTreeMap::new();
    for (key, sequence) in raw {
        let partition = F::PartitionId::parse_key(&key).map_err(|e| {
            TaskClientError::Other(anyhow::anyhow!("task {task_id} sent bad partition: {e}"))
        })?;
        out.insert(partition, sequence);
    }
    Ok(out)
}
