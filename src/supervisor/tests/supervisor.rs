// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end supervisor scenarios against scripted collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use strata_ingest::actions::CheckpointAction;
use strata_ingest::config::TaskTuningConfig;
use strata_ingest::task::{IndexTaskSpec, CHECKPOINTS_CONTEXT_KEY};
use strata_ingest::testing::{InMemoryMetadataStore, MockRecordSupplier};
use strata_supervisor::config::{SupervisorConfig, SupervisorSpec};
use strata_supervisor::queue::TaskRunState;
use strata_supervisor::report::OffsetsSource;
use strata_supervisor::supervisor::{group_for_partition, Supervisor, SupervisorHandle};
use strata_supervisor::testing::{MockTaskClient, MockTaskQueue};
use strata_types::{
    BrokerFlavor, BrokerOffset, DataSourceMetadata, SequenceNumber, StreamMetadata,
    StreamPartition, StreamPartitions,
};

const STREAM: &str = "events-stream";
const DATASOURCE: &str = "events";

struct TestBed {
    handle: SupervisorHandle,
    supplier: MockRecordSupplier<BrokerFlavor>,
    store: InMemoryMetadataStore,
    queue: MockTaskQueue<BrokerFlavor>,
    chat: MockTaskClient<BrokerFlavor>,
}

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        replicas: 1,
        task_count: 1,
        task_duration_millis: 60_000,
        start_delay_millis: 0,
        // Long period: ticks only run when tests ask for them.
        period_millis: 3_600_000,
        use_earliest_sequence_number: true,
        ..SupervisorConfig::default()
    }
}

impl TestBed {
    fn start(config: SupervisorConfig) -> Self {
        Self::start_with(
            config,
            MockRecordSupplier::new(),
            InMemoryMetadataStore::new(),
            MockTaskQueue::new(),
            MockTaskClient::new(),
        )
    }

    fn start_with(
        config: SupervisorConfig,
        supplier: MockRecordSupplier<BrokerFlavor>,
        store: InMemoryMetadataStore,
        queue: MockTaskQueue<BrokerFlavor>,
        chat: MockTaskClient<BrokerFlavor>,
    ) -> Self {
        supplier.set_partition_ids(STREAM, [0, 1].into_iter().collect());
        for partition in [0, 1] {
            supplier.set_earliest(StreamPartition::new(STREAM, partition), BrokerOffset(0));
            supplier.set_latest(StreamPartition::new(STREAM, partition), BrokerOffset(100));
        }
        let spec = SupervisorSpec {
            datasource: DATASOURCE.into(),
            stream: STREAM.into(),
            config,
            task_tuning: TaskTuningConfig::default(),
        };
        let (supervisor, handle) = Supervisor::<BrokerFlavor>::new(
            spec,
            Box::new(supplier.clone()),
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            Arc::new(chat.clone()),
        );
        tokio::spawn(supervisor.run());
        TestBed {
            handle,
            supplier,
            store,
            queue,
            chat,
        }
    }

    /// Runs one planning tick to completion. The report request doubles as
    /// a barrier: the loop serves it only after the tick finished.
    async fn tick(&self) {
        self.handle.run_tick().await.unwrap();
        let _ = self.handle.report().await.unwrap();
    }
}

fn offsets<const N: usize>(entries: [(i32, i64); N]) -> BTreeMap<i32, BrokerOffset> {
    entries.into_iter().map(|(p, o)| (p, BrokerOffset(o))).collect()
}

fn broker_metadata(entries: &[(i32, i64)]) -> DataSourceMetadata {
    DataSourceMetadata::Broker(StreamMetadata::from_map(
        STREAM,
        entries.iter().map(|(p, o)| (*p, BrokerOffset(*o))).collect(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_start_probes_earliest_and_spawns_one_group() {
    let bed = TestBed::start(test_config());
    bed.tick().await;

    let submitted = bed.queue.submitted();
    assert_eq!(submitted.len(), 1);
    let spec = &submitted[0];
    assert_eq!(spec.io_config.task_group_id, 0);
    assert_eq!(
        spec.io_config.start_partitions.partition_sequence_map,
        offsets([(0, 0), (1, 0)])
    );
    // Open-ended upper bounds until the supervisor seals the group.
    assert!(spec
        .io_config
        .end_partitions
        .partition_sequence_map
        .values()
        .all(|s| s.is_no_end()));
    assert!(spec
        .io_config
        .base_sequence_name
        .starts_with("index_broker_events_"));

    let report = bed.handle.report().await.unwrap();
    assert_eq!(report.partitions, 2);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].offsets_source, OffsetsSource::StreamEarliest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stored_metadata_decides_start_offsets() {
    let store = InMemoryMetadataStore::new();
    store.set_metadata(DATASOURCE, broker_metadata(&[(0, 3), (1, 5)]));
    let bed = TestBed::start_with(
        test_config(),
        MockRecordSupplier::new(),
        store,
        MockTaskQueue::new(),
        MockTaskClient::new(),
    );
    bed.tick().await;

    let submitted = bed.queue.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(
        submitted[0].io_config.start_partitions.partition_sequence_map,
        offsets([(0, 3), (1, 5)])
    );
    let report = bed.handle.report().await.unwrap();
    assert_eq!(report.groups[0].offsets_source, OffsetsSource::StoredMetadata);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_stored_metadata_fails_the_tick_hard() {
    let store = InMemoryMetadataStore::new();
    // Wrong flavor entirely: the supervisor must refuse to guess.
    store.set_metadata(
        DATASOURCE,
        DataSourceMetadata::Shard(StreamMetadata::from_map(
            STREAM,
            [("shardId-0".to_owned(), "12".parse().unwrap())]
                .into_iter()
                .collect(),
        )),
    );
    let bed = TestBed::start_with(
        test_config(),
        MockRecordSupplier::new(),
        store,
        MockTaskQueue::new(),
        MockTaskClient::new(),
    );
    bed.tick().await;
    assert!(bed.queue.submitted().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_replica_is_replaced_in_kind() {
    let config = SupervisorConfig {
        replicas: 2,
        ..test_config()
    };
    let bed = TestBed::start(config);
    bed.tick().await;

    let submitted = bed.queue.submitted();
    assert_eq!(submitted.len(), 2);
    let (failed, survivor) = (&submitted[0], &submitted[1]);
    bed.queue.set_state(&failed.id, TaskRunState::Failed);

    bed.tick().await;
    let submitted = bed.queue.submitted();
    assert_eq!(submitted.len(), 3);
    let replacement = &submitted[2];
    // The replacement inherits the group's identity wholesale.
    assert_eq!(
        replacement.io_config.base_sequence_name,
        failed.io_config.base_sequence_name
    );
    assert_eq!(
        replacement.io_config.start_partitions,
        failed.io_config.start_partitions
    );
    assert_eq!(
        replacement.io_config.minimum_message_time,
        failed.io_config.minimum_message_time
    );
    assert_eq!(
        replacement.io_config.maximum_message_time,
        failed.io_config.maximum_message_time
    );
    // The surviving replica was not disturbed.
    assert!(!bed.queue.shutdowns().contains(&survivor.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_replica_is_killed_and_replaced() {
    let bed = TestBed::start(test_config());
    bed.tick().await;
    let first = &bed.queue.submitted()[0];
    bed.chat.set_unreachable(&first.id);

    bed.tick().await;
    assert!(bed.queue.shutdowns().contains(&first.id));
    let submitted = bed.queue.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(
        submitted[1].io_config.base_sequence_name,
        first.io_config.base_sequence_name
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn elapsed_duration_seals_group_and_spawns_successor() {
    let bed = TestBed::start(test_config());
    bed.tick().await;
    let first = bed.queue.submitted()[0].clone();

    bed.chat
        .set_start_time(&first.id, Utc::now() - ChronoDuration::minutes(2));
    bed.chat.set_offsets(&first.id, offsets([(0, 7), (1, 9)]));
    bed.tick().await;

    // The leader was paused, its offsets propagated as final ends.
    assert!(bed.chat.pauses().contains(&first.id));
    let end_calls = bed.chat.end_offset_calls();
    assert_eq!(end_calls.len(), 1);
    assert_eq!(end_calls[0].0, first.id);
    assert_eq!(end_calls[0].1, offsets([(0, 7), (1, 9)]));
    assert!(end_calls[0].2, "seal must carry finish=true");

    // A successor group starts exactly at the sealed offsets.
    let submitted = bed.queue.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(
        submitted[1].io_config.start_partitions.partition_sequence_map,
        offsets([(0, 7), (1, 9)])
    );
    let report = bed.handle.report().await.unwrap();
    assert_eq!(report.publishing_tasks.len(), 1);
    assert_eq!(report.publishing_tasks[0].task_id, first.id);

    // Once the sealed task publishes and exits, the pending group retires.
    bed.queue.set_state(&first.id, TaskRunState::Success);
    bed.tick().await;
    let report = bed.handle.report().await.unwrap();
    assert!(report.publishing_tasks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkpoint_aligns_replicas_on_max_offsets() {
    let config = SupervisorConfig {
        replicas: 2,
        ..test_config()
    };
    let bed = TestBed::start(config);
    bed.tick().await;
    let submitted = bed.queue.submitted();
    let (t1, t2) = (submitted[0].clone(), submitted[1].clone());
    bed.chat.set_offsets(&t1.id, offsets([(0, 4), (1, 5)]));
    bed.chat.set_offsets(&t2.id, offsets([(0, 6), (1, 3)]));

    let action = CheckpointAction {
        datasource: DATASOURCE.into(),
        task_group_id: 0,
        base_sequence_name: t1.io_config.base_sequence_name.clone(),
        start_metadata: broker_metadata(&[(0, 0), (1, 0)]),
        current_metadata: broker_metadata(&[(0, 5), (1, 5)]),
    };
    bed.handle.notify_checkpoint(action).await.unwrap();
    let _ = bed.handle.report().await.unwrap();

    // Every replica was paused and sealed at the per-partition maximum of
    // the group's progress, without finishing.
    let end_calls = bed.chat.end_offset_calls();
    assert_eq!(end_calls.len(), 2);
    for (_, sealed, finish) in &end_calls {
        assert_eq!(*sealed, offsets([(0, 6), (1, 5)]));
        assert!(!finish);
    }

    // A replacement spawned after the checkpoint carries the accumulated
    // history so it rebuilds the same sequence chain.
    bed.queue.set_state(&t1.id, TaskRunState::Failed);
    bed.tick().await;
    let replacement = bed.queue.submitted()[2].clone();
    let checkpoints = replacement
        .context
        .get(CHECKPOINTS_CONTEXT_KEY)
        .expect("replacement carries checkpoints");
    assert_eq!(
        checkpoints["1"],
        serde_json::json!({"0": 6, "1": 5})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incompatible_task_is_shut_down() {
    let queue = MockTaskQueue::new();
    // A leftover task reading a different partition slice.
    queue.add_external_task(
        IndexTaskSpec {
            id: "index_broker_events_stale_1".into(),
            datasource: DATASOURCE.into(),
            io_config: strata_ingest::config::TaskIoConfig {
                task_group_id: 0,
                base_sequence_name: "index_broker_events_stale".into(),
                start_partitions: StreamPartitions::new(STREAM, offsets([(0, 0)])),
                end_partitions: StreamPartitions::new(
                    STREAM,
                    [(0, BrokerOffset::no_end())].into_iter().collect(),
                ),
                minimum_message_time: None,
                maximum_message_time: None,
                exclusive_start_partitions: BTreeSet::new(),
            },
            tuning_config: TaskTuningConfig::default(),
            context: BTreeMap::new(),
        },
        TaskRunState::Running,
    );
    let bed = TestBed::start_with(
        test_config(),
        MockRecordSupplier::new(),
        InMemoryMetadataStore::new(),
        queue,
        MockTaskClient::new(),
    );
    bed.tick().await;
    assert!(bed
        .queue
        .shutdowns()
        .contains(&"index_broker_events_stale_1".to_owned()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_supervisor_adopts_running_tasks() {
    let queue = MockTaskQueue::new();
    let chat = MockTaskClient::new();
    let store = InMemoryMetadataStore::new();

    let bed = TestBed::start_with(
        test_config(),
        MockRecordSupplier::new(),
        store.clone(),
        queue.clone(),
        chat.clone(),
    );
    bed.tick().await;
    assert_eq!(bed.queue.submitted().len(), 1);
    let original = bed.queue.submitted()[0].clone();

    // A fresh supervisor over the same queue: the running task matches its
    // group's partitions and start offsets, so it is adopted, not replaced.
    let bed2 = TestBed::start_with(
        test_config(),
        MockRecordSupplier::new(),
        store,
        queue.clone(),
        chat,
    );
    bed2.tick().await;
    assert_eq!(queue.submitted().len(), 1, "no new task was spawned");
    assert!(!queue.shutdowns().contains(&original.id));

    let report = bed2.handle.report().await.unwrap();
    assert_eq!(report.active_tasks.len(), 1);
    assert_eq!(report.active_tasks[0].task_id, original.id);
    assert_eq!(report.groups[0].offsets_source, OffsetsSource::AdoptedTask);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_subtracts_partitions_and_kills_affected_tasks() {
    let store = InMemoryMetadataStore::new();
    store.set_metadata(DATASOURCE, broker_metadata(&[(0, 5), (1, 6)]));
    let bed = TestBed::start_with(
        test_config(),
        MockRecordSupplier::new(),
        store,
        MockTaskQueue::new(),
        MockTaskClient::new(),
    );
    bed.tick().await;
    let task = bed.queue.submitted()[0].clone();

    bed.handle
        .reset(Some(broker_metadata(&[(0, 0)])))
        .await
        .unwrap();

    // Exactly the named partition left the stored commit.
    assert_eq!(
        bed.store.metadata(DATASOURCE),
        Some(broker_metadata(&[(1, 6)]))
    );
    assert!(bed.queue.shutdowns().contains(&task.id));

    // A full reset deletes the commit outright.
    bed.handle.reset(None).await.unwrap();
    assert_eq!(bed.store.metadata(DATASOURCE), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn suspension_seals_groups_and_stops_spawning() {
    let bed = TestBed::start(test_config());
    bed.tick().await;
    let task = bed.queue.submitted()[0].clone();
    bed.chat.set_offsets(&task.id, offsets([(0, 3), (1, 4)]));

    bed.handle.suspend().await.unwrap();
    let end_calls = bed.chat.end_offset_calls();
    assert_eq!(end_calls.len(), 1);
    assert_eq!(end_calls[0].1, offsets([(0, 3), (1, 4)]));
    assert!(end_calls[0].2);

    // While suspended, planning ticks spawn nothing new.
    bed.tick().await;
    assert_eq!(bed.queue.submitted().len(), 1);
    let report = bed.handle.report().await.unwrap();
    assert!(report.suspended);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lag_is_reported_for_broker_offsets() {
    let bed = TestBed::start(test_config());
    bed.tick().await;
    let task = bed.queue.submitted()[0].clone();
    bed.chat
        .set_offsets(&task.id, offsets([(0, 40), (1, 90)]));

    let report = bed.handle.report().await.unwrap();
    // Latest is scripted at 100 for both partitions.
    let lag = report.lag.expect("broker lag is computable");
    assert_eq!(lag.get("0"), Some(&60));
    assert_eq!(lag.get("1"), Some(&10));
    assert_eq!(report.aggregate_lag, Some(70));
}

#[test]
fn partition_group_assignment_matches_published_contract() {
    // hash(partition) mod task_count, with the stable hash. A change here
    // would reshuffle partitions across task groups on upgrade.
    for partition in 0i32..16 {
        let group = group_for_partition(&partition, 4);
        assert_eq!(
            group,
            (strata_types::stable_partition_hash(&partition) % 4) as i32
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn diverged_checkpoint_history_kills_the_replica() {
    let config = SupervisorConfig {
        replicas: 2,
        ..test_config()
    };
    let bed = TestBed::start(config);
    bed.tick().await;
    let submitted = bed.queue.submitted();
    let (t1, t2) = (submitted[0].clone(), submitted[1].clone());

    // t2 claims a sequence-0 start that contradicts the group's history.
    bed.chat.set_checkpoints(
        &t2.id,
        BTreeMap::from([(0, offsets([(0, 42), (1, 42)]))]),
    );
    bed.chat
        .set_checkpoints(&t1.id, BTreeMap::from([(0, offsets([(0, 0), (1, 0)]))]));

    bed.tick().await;
    assert!(bed.queue.shutdowns().contains(&t2.id));
    assert!(!bed.queue.shutdowns().contains(&t1.id));
    // The killed replica is replaced on the same tick.
    assert_eq!(bed.queue.submitted().len(), 3);
}
