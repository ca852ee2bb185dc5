// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The supervisor's control surface.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;

use strata_types::DataSourceMetadata;

use crate::supervisor::SupervisorHandle;

pub fn supervisor_router(handle: SupervisorHandle) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/suspend", post(post_suspend))
        .route("/resume", post(post_resume))
        .route("/reset", post(post_reset))
        .route("/shutdown", post(post_shutdown))
        .with_state(handle)
}

async fn get_status(
    State(handle): State<SupervisorHandle>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let report = handle
        .report()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")))?;
    Ok(Json(serde_json::to_value(report).expect("report serializes")))
}

async fn post_suspend(
    State(handle): State<SupervisorHandle>,
) -> Result<StatusCode, (StatusCode, String)> {
    handle
        .suspend()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")))?;
    Ok(StatusCode::OK)
}

async fn post_resume(
    State(handle): State<SupervisorHandle>,
) -> Result<StatusCode, (StatusCode, String)> {
    handle
        .resume()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")))?;
    Ok(StatusCode::OK)
}

/// Body: a tagged [`DataSourceMetadata`] naming the partitions to drop from
/// the stored commit, or empty/`null` to delete the whole commit.
async fn post_reset(
    State(handle): State<SupervisorHandle>,
    body: Option<Json<DataSourceMetadata>>,
) -> Result<StatusCode, (StatusCode, String)> {
    handle
        .reset(body.map(|Json(m)| m))
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{e:#}")))?;
    Ok(StatusCode::OK)
}

async fn post_shutdown(
    State(handle): State<SupervisorHandle>,
) -> Result<StatusCode, (StatusCode, String)> {
    handle
        .shutdown()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")))?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use axum::body::Body;
    use http::Request;
    use tower::ServiceExt;

    use strata_ingest::testing::{InMemoryMetadataStore, MockRecordSupplier};
    use strata_types::BrokerFlavor;

    use crate::config::{SupervisorConfig, SupervisorSpec};
    use crate::supervisor::Supervisor;
    use crate::testing::{MockTaskClient, MockTaskQueue};

    use super::*;

    async fn serve_router() -> Router {
        let supplier = MockRecordSupplier::<BrokerFlavor>::new();
        supplier.set_partition_ids("events-stream", BTreeSet::from([0, 1]));
        let spec = SupervisorSpec {
            datasource: "events".into(),
            stream: "events-stream".into(),
            config: SupervisorConfig {
                start_delay_millis: 0,
                period_millis: 3_600_000,
                ..SupervisorConfig::default()
            },
            task_tuning: Default::default(),
        };
        let (supervisor, handle) = Supervisor::<BrokerFlavor>::new(
            spec,
            Box::new(supplier),
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(MockTaskQueue::new()),
            Arc::new(MockTaskClient::new()),
        );
        tokio::spawn(supervisor.run());
        supervisor_router(handle)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_serves_a_report() {
        let app = serve_router().await;
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        use http_body::Body as _;
        let mut body = response.into_body();
        let mut bytes = Vec::new();
        while let Some(chunk) = body.data().await {
            bytes.extend_from_slice(&chunk.unwrap());
        }
        let report: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report["datasource"], "events");
        assert_eq!(report["suspended"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn suspend_and_resume_round_trip() {
        let app = serve_router().await;
        let response = app
            .clone()
            .oneshot(Request::post("/suspend").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app
            .oneshot(Request::post("/resume").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
