// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The task's remote control surface.
//!
//! Thin translation between HTTP and [`TaskRunner`]'s control methods. The
//! control methods block on the pause protocol's condition variables, so
//! every mutating handler hops onto the blocking pool. Authorization is the
//! embedding server's concern.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use serde::Deserialize;

use strata_types::{PartitionKey, StreamFlavor};

use crate::runner::{ControlError, PauseOutcome, TaskRunner};

/// Builds the router for one task.
pub fn task_router<F: StreamFlavor>(runner: Arc<TaskRunner<F>>) -> Router {
    Router::new()
        .route("/status", get(get_status::<F>))
        .route("/offsets/current", get(get_current_offsets::<F>))
        .route(
            "/offsets/end",
            get(get_end_offsets::<F>).post(post_end_offsets::<F>),
        )
        .route("/pause", post(post_pause::<F>))
        .route("/resume", post(post_resume::<F>))
        .route("/stop", post(post_stop::<F>))
        .route("/checkpoints", get(get_checkpoints::<F>))
        .route("/time/start", get(get_start_time::<F>))
        .route("/rowStats", get(get_row_stats::<F>))
        .route("/unparseableEvents", get(get_unparseable_events::<F>))
        .with_state(runner)
}

/// Offset maps travel as JSON objects keyed by the partition's string form.
fn offsets_to_json<F: StreamFlavor>(
    offsets: &BTreeMap<F::PartitionId, F::Sequence>,
) -> serde_json::Value {
    serde_json::Value::Object(
        offsets
            .iter()
            .map(|(p, s)| {
                (
                    p.to_string(),
                    serde_json::to_value(s).expect("sequence numbers serialize"),
                )
            })
            .collect(),
    )
}

fn offsets_from_json<F: StreamFlavor>(
    value: serde_json::Value,
) -> Result<BTreeMap<F::PartitionId, F::Sequence>, String> {
    let raw: BTreeMap<String, F::Sequence> =
        serde_json::from_value(value).map_err(|e| format!("invalid offset map: {e}"))?;
    let mut offsets = BTreeMap::new();
    for (key, sequence) in raw {
        let partition = F::PartitionId::parse_key(&key)?;
        offsets.insert(partition, sequence);
    }
    Ok(offsets)
}

fn control_error_response(err: ControlError) -> (StatusCode, Json<serde_json::Value>) {
    let (code, msg) = match err {
        ControlError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        ControlError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
    };
    (code, Json(serde_json::json!({ "error": msg })))
}

async fn get_status<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> Json<serde_json::Value> {
    Json(serde_json::to_value(runner.status()).expect("status serializes"))
}

async fn get_current_offsets<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> Json<serde_json::Value> {
    Json(offsets_to_json::<F>(&runner.current_offsets()))
}

async fn get_end_offsets<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> Json<serde_json::Value> {
    Json(offsets_to_json::<F>(&runner.end_offsets()))
}

#[derive(Deserialize)]
struct FinishQuery {
    #[serde(default = "default_finish")]
    finish: bool,
}

fn default_finish() -> bool {
    true
}

async fn post_end_offsets<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
    Query(query): Query<FinishQuery>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let offsets = match offsets_from_json::<F>(body) {
        Ok(offsets) => offsets,
        Err(msg) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": msg })),
            )
        }
    };
    let result = tokio::task::spawn_blocking(move || {
        runner
            .set_end_offsets(offsets, query.finish)
            .map(|echoed| offsets_to_json::<F>(&echoed))
    })
    .await
    .expect("set_end_offsets never panics");
    match result {
        Ok(echoed) => (StatusCode::OK, Json(echoed)),
        Err(err) => control_error_response(err),
    }
}

async fn post_pause<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = tokio::task::spawn_blocking(move || runner.pause())
        .await
        .expect("pause never panics");
    match result {
        Ok(PauseOutcome::Paused(offsets)) => {
            (StatusCode::OK, Json(offsets_to_json::<F>(&offsets)))
        }
        Ok(PauseOutcome::Accepted) => (StatusCode::ACCEPTED, Json(serde_json::json!({}))),
        Err(err) => control_error_response(err),
    }
}

async fn post_resume<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let result = tokio::task::spawn_blocking(move || runner.resume())
        .await
        .expect("resume never panics");
    match result {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({}))),
        Err(err) => control_error_response(err),
    }
}

async fn post_stop<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> StatusCode {
    runner.stop_gracefully();
    StatusCode::OK
}

async fn get_checkpoints<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> Json<serde_json::Value> {
    let checkpoints = runner.checkpoints();
    Json(serde_json::Value::Object(
        checkpoints
            .iter()
            .map(|(id, offsets)| (id.to_string(), offsets_to_json::<F>(offsets)))
            .collect(),
    ))
}

async fn get_start_time<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> Json<serde_json::Value> {
    Json(match runner.start_time() {
        Some(t) => serde_json::json!(t.to_rfc3339()),
        None => serde_json::Value::Null,
    })
}

async fn get_row_stats<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> Json<serde_json::Value> {
    Json(serde_json::to_value(runner.row_stats()).expect("row stats serialize"))
}

async fn get_unparseable_events<F: StreamFlavor>(
    State(runner): State<Arc<TaskRunner<F>>>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!(runner.unparseable_events()))
}
