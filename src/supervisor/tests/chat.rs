// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The HTTP task chat client against a live runner control surface.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use strata_ingest::config::{TaskIoConfig, TaskTuningConfig};
use strata_ingest::http::task_router;
use strata_ingest::runner::{RunnerStatus, TaskRunner};
use strata_ingest::task::IndexTaskSpec;
use strata_supervisor::client::{HttpTaskClient, TaskClient, TaskClientError, TaskLocator};
use strata_types::{BrokerFlavor, BrokerOffset, SequenceNumber, StreamPartitions};

struct FixedLocator(SocketAddr);

impl TaskLocator for FixedLocator {
    fn locate(&self, _task_id: &str) -> Option<String> {
        Some(format!("http://{}", self.0))
    }
}

fn idle_runner() -> std::sync::Arc<TaskRunner<BrokerFlavor>> {
    let spec = IndexTaskSpec {
        id: "index_broker_events_chat".into(),
        datasource: "events".into(),
        io_config: TaskIoConfig {
            task_group_id: 0,
            base_sequence_name: "events_base".into(),
            start_partitions: StreamPartitions::new(
                "events",
                [(0, BrokerOffset(0))].into_iter().collect(),
            ),
            end_partitions: StreamPartitions::new(
                "events",
                [(0, BrokerOffset::no_end())].into_iter().collect(),
            ),
            minimum_message_time: None,
            maximum_message_time: None,
            exclusive_start_partitions: BTreeSet::new(),
        },
        tuning_config: TaskTuningConfig::default(),
        context: Default::default(),
    };
    let dir = tempfile::tempdir().unwrap().into_path();
    TaskRunner::new(spec, dir, tokio::runtime::Handle::current())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_round_trips_against_a_live_task() {
    let runner = idle_runner();
    let app = task_router(runner);
    let server =
        axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);

    let client: HttpTaskClient<FixedLocator> =
        HttpTaskClient::new(FixedLocator(addr), Duration::from_secs(2), 1).unwrap();

    // The task never started its run thread: status answers, start time is
    // null, offsets are empty.
    let status = TaskClient::<BrokerFlavor>::status(&client, "t1").await.unwrap();
    assert_eq!(status, RunnerStatus::NotStarted);
    let start = TaskClient::<BrokerFlavor>::start_time(&client, "t1")
        .await
        .unwrap();
    assert_eq!(start, None);
    let offsets = TaskClient::<BrokerFlavor>::current_offsets(&client, "t1")
        .await
        .unwrap();
    assert!(offsets.is_empty());

    // Mutations against a task that is not reading are rejections, not
    // transport failures.
    let err = TaskClient::<BrokerFlavor>::pause(&client, "t1")
        .await
        .unwrap_err();
    assert!(matches!(err, TaskClientError::Rejected { call: "pause", .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_task_location_is_unreachable() {
    struct NoLocator;
    impl TaskLocator for NoLocator {
        fn locate(&self, _task_id: &str) -> Option<String> {
            None
        }
    }
    let client: HttpTaskClient<NoLocator> =
        HttpTaskClient::new(NoLocator, Duration::from_secs(1), 0).unwrap();
    let err = TaskClient::<BrokerFlavor>::status(&client, "ghost")
        .await
        .unwrap_err();
    assert!(matches!(err, TaskClientError::Unreachable { .. }));
}
