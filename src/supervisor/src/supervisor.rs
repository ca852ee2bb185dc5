// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The supervisor notice loop.
//!
//! All state lives on one task; HTTP handlers and task callbacks enqueue
//! [`SupervisorNotice`]s and wait on reply channels. A planning tick runs
//! whenever the notice queue stays quiet for one period. Stream hiccups and
//! unreachable tasks never poison the loop: a failed tick logs and retries
//! on the next period, a failed task is killed and replanned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use strata_ingest::actions::{CheckpointAction, MetadataActionClient, ResetMetadataAction};
use strata_ingest::config::TaskIoConfig;
use strata_ingest::task::{IndexTaskSpec, CHECKPOINTS_CONTEXT_KEY};
use strata_stream_client::RecordSupplier;
use strata_types::{
    stable_partition_hash, DataSourceMetadata, PartitionKey, SequenceNumber, StreamFlavor,
    StreamPartition, StreamPartitions,
};

use crate::client::{TaskClient, TaskClientError};
use crate::config::SupervisorSpec;
use crate::queue::{TaskQueueClient, TaskRunState};
use crate::report::{GroupSnapshot, OffsetsSource, SupervisorReport, TaskSnapshot};

/// Commands processed by the notice loop.
pub enum SupervisorNotice {
    /// Run a planning tick now.
    Run,
    /// A task filed a checkpoint for its open sequence.
    Checkpoint(CheckpointAction),
    /// Remove the named partitions from the stored commit (`None` deletes
    /// the whole commit) and kill the affected tasks.
    Reset(
        Option<DataSourceMetadata>,
        oneshot::Sender<Result<(), String>>,
    ),
    Suspend(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Report(oneshot::Sender<SupervisorReport>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap cloneable handle for feeding the notice loop.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorNotice>,
}

impl SupervisorHandle {
    pub async fn run_tick(&self) -> Result<(), anyhow::Error> {
        self.tx
            .send(SupervisorNotice::Run)
            .await
            .map_err(|_| anyhow!("supervisor loop has exited"))
    }

    pub async fn notify_checkpoint(&self, action: CheckpointAction) -> Result<(), anyhow::Error> {
        self.tx
            .send(SupervisorNotice::Checkpoint(action))
            .await
            .map_err(|_| anyhow!("supervisor loop has exited"))
    }

    pub async fn reset(&self, metadata: Option<DataSourceMetadata>) -> Result<(), anyhow::Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SupervisorNotice::Reset(metadata, reply_tx))
            .await
            .map_err(|_| anyhow!("supervisor loop has exited"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("supervisor dropped the reset"))?
            .map_err(|e| anyhow!(e))
    }

    pub async fn suspend(&self) -> Result<(), anyhow::Error> {
        self.signal(SupervisorNotice::Suspend).await
    }

    pub async fn resume(&self) -> Result<(), anyhow::Error> {
        self.signal(SupervisorNotice::Resume).await
    }

    pub async fn shutdown(&self) -> Result<(), anyhow::Error> {
        self.signal(SupervisorNotice::Shutdown).await
    }

    pub async fn report(&self) -> Result<SupervisorReport, anyhow::Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SupervisorNotice::Report(reply_tx))
            .await
            .map_err(|_| anyhow!("supervisor loop has exited"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("supervisor dropped the report"))
    }

    async fn signal(
        &self,
        make: impl FnOnce(oneshot::Sender<()>) -> SupervisorNotice,
    ) -> Result<(), anyhow::Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| anyhow!("supervisor loop has exited"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("supervisor dropped the signal"))
    }
}

struct TaskGroup<F: StreamFlavor> {
    group_id: i32,
    base_sequence_name: String,
    start_offsets: BTreeMap<F::PartitionId, F::Sequence>,
    exclusive_start_partitions: BTreeSet<F::PartitionId>,
    minimum_message_time: Option<DateTime<Utc>>,
    maximum_message_time: Option<DateTime<Utc>>,
    replica_task_ids: BTreeSet<String>,
    task_start_times: BTreeMap<String, DateTime<Utc>>,
    /// Ordered `sequence id -> start offsets`, seeded with sequence 0 at
    /// group creation and extended by every checkpoint.
    checkpoint_history: BTreeMap<i32, BTreeMap<F::PartitionId, F::Sequence>>,
    offsets_source: OffsetsSource,
}

impl<F: StreamFlavor> TaskGroup<F> {
    fn new(
        group_id: i32,
        base_sequence_name: String,
        start_offsets: BTreeMap<F::PartitionId, F::Sequence>,
        minimum_message_time: Option<DateTime<Utc>>,
        maximum_message_time: Option<DateTime<Utc>>,
        offsets_source: OffsetsSource,
    ) -> Self {
        let checkpoint_history = BTreeMap::from([(0, start_offsets.clone())]);
        TaskGroup {
            group_id,
            base_sequence_name,
            start_offsets,
            exclusive_start_partitions: BTreeSet::new(),
            minimum_message_time,
            maximum_message_time,
            replica_task_ids: BTreeSet::new(),
            task_start_times: BTreeMap::new(),
            checkpoint_history,
            offsets_source,
        }
    }

    fn partitions(&self) -> BTreeSet<F::PartitionId> {
        self.start_offsets.keys().cloned().collect()
    }

    fn earliest_task_start(&self) -> Option<DateTime<Utc>> {
        self.task_start_times.values().min().copied()
    }
}

struct PendingGroup<F: StreamFlavor> {
    group: TaskGroup<F>,
    deadline: Instant,
}

/// Maps a partition onto its task group. Deterministic across restarts and
/// processes.
pub fn group_for_partition<P: PartitionKey>(partition: &P, task_count: usize) -> i32 {
    (stable_partition_hash(partition) % task_count.max(1) as u64) as i32
}

/// The per-datasource supervisor. Built with [`Supervisor::new`], consumed
/// by [`Supervisor::run`].
pub struct Supervisor<F: StreamFlavor> {
    spec: SupervisorSpec,
    supplier: Box<dyn RecordSupplier<F>>,
    actions: Arc<dyn MetadataActionClient>,
    queue: Arc<dyn TaskQueueClient<F>>,
    chat: Arc<dyn TaskClient<F>>,
    rx: mpsc::Receiver<SupervisorNotice>,
    active_groups: BTreeMap<i32, TaskGroup<F>>,
    pending_groups: Vec<PendingGroup<F>>,
    suspended: bool,
    last_partitions: BTreeSet<F::PartitionId>,
}

impl<F: StreamFlavor> Supervisor<F> {
    pub fn new(
        spec: SupervisorSpec,
        supplier: Box<dyn RecordSupplier<F>>,
        actions: Arc<dyn MetadataActionClient>,
        queue: Arc<dyn TaskQueueClient<F>>,
        chat: Arc<dyn TaskClient<F>>,
    ) -> (Self, SupervisorHandle) {
        let (tx, rx) = mpsc::channel(64);
        let supervisor = Supervisor {
            spec,
            supplier,
            actions,
            queue,
            chat,
            rx,
            active_groups: BTreeMap::new(),
            pending_groups: Vec::new(),
            suspended: false,
            last_partitions: BTreeSet::new(),
        };
        (supervisor, SupervisorHandle { tx })
    }

    /// Runs the notice loop until shutdown. Requires a multi-threaded
    /// runtime: partition discovery and offset probes bridge into the
    /// blocking record supplier.
    pub async fn run(mut self) {
        info!(
            datasource = %self.spec.datasource,
            stream = %self.spec.stream,
            "supervisor starting"
        );
        tokio::time::sleep(self.spec.config.start_delay()).await;
        loop {
            let notice = tokio::time::timeout(self.spec.config.period(), self.rx.recv()).await;
            match notice {
                // Quiet period: plan.
                Err(_elapsed) => self.tick().await,
                Ok(None) => break,
                Ok(Some(SupervisorNotice::Run)) => self.tick().await,
                Ok(Some(SupervisorNotice::Checkpoint(action))) => {
                    if let Err(e) = self.handle_checkpoint(action).await {
                        warn!("checkpoint handling failed: {:#}", e);
                    }
                }
                Ok(Some(SupervisorNotice::Reset(metadata, reply))) => {
                    let result = self
                        .handle_reset(metadata)
                        .await
                        .map_err(|e| format!("{e:#}"));
                    let _ = reply.send(result);
                }
                Ok(Some(SupervisorNotice::Suspend(reply))) => {
                    self.suspended = true;
                    self.gracefully_stop_groups().await;
                    let _ = reply.send(());
                }
                Ok(Some(SupervisorNotice::Resume(reply))) => {
                    self.suspended = false;
                    let _ = reply.send(());
                }
                Ok(Some(SupervisorNotice::Report(reply))) => {
                    let report = self.build_report().await;
                    let _ = reply.send(report);
                }
                Ok(Some(SupervisorNotice::Shutdown(reply))) => {
                    info!(datasource = %self.spec.datasource, "supervisor shutting down");
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    async fn tick(&mut self) {
        if let Err(e) = self.tick_inner().await {
            // Stream-transient and metadata-store failures both land here;
            // the next period retries from scratch.
            warn!(
                datasource = %self.spec.datasource,
                "supervisor tick failed, will retry: {:#}",
                e
            );
        }
    }

    async fn tick_inner(&mut self) -> Result<(), anyhow::Error> {
        let partitions = self.discover_partitions()?;
        let wanted = self.plan_groups(&partitions);
        self.classify_tasks(&wanted).await?;
        self.refresh_task_states().await;
        self.manage_pending_completion().await;
        if !self.suspended {
            self.ensure_groups(&wanted).await?;
            self.rollover_elapsed_groups().await;
            self.ensure_replicas().await?;
        }
        Ok(())
    }

    fn discover_partitions(&mut self) -> Result<BTreeSet<F::PartitionId>, anyhow::Error> {
        let stream = self.spec.stream.clone();
        let supplier = &mut self.supplier;
        let partitions = tokio::task::block_in_place(|| supplier.partition_ids(&stream))
            .context("discovering stream partitions")?;
        if partitions != self.last_partitions && !self.last_partitions.is_empty() {
            info!(
                was = self.last_partitions.len(),
                now = partitions.len(),
                "stream partition set changed"
            );
        }
        self.last_partitions = partitions.clone();
        Ok(partitions)
    }

    fn plan_groups(
        &self,
        partitions: &BTreeSet<F::PartitionId>,
    ) -> BTreeMap<i32, BTreeSet<F::PartitionId>> {
        let mut wanted: BTreeMap<i32, BTreeSet<F::PartitionId>> = BTreeMap::new();
        for partition in partitions {
            let group = group_for_partition(partition, self.spec.config.task_count);
            wanted.entry(group).or_default().insert(partition.clone());
        }
        wanted
    }

    /// Walks every task the orchestrator knows for this datasource, adopting
    /// compatible ones and killing the rest.
    async fn classify_tasks(
        &mut self,
        wanted: &BTreeMap<i32, BTreeSet<F::PartitionId>>,
    ) -> Result<(), anyhow::Error> {
        let task_ids = self
            .queue
            .active_task_ids(&self.spec.datasource)
            .await
            .context("listing active tasks")?;
        for task_id in task_ids {
            if self.knows_task(&task_id) {
                continue;
            }
            let Some(spec) = self.queue.task_spec(&task_id).await? else {
                continue;
            };
            let io = &spec.io_config;
            let group_id = io.task_group_id;
            let spec_partitions: BTreeSet<F::PartitionId> =
                io.start_partitions.partition_sequence_map.keys().cloned().collect();
            let compatible = io.stream() == self.spec.stream
                && wanted.get(&group_id) == Some(&spec_partitions);
            if !compatible {
                info!(task_id, "shutting down incompatible task");
                let _ = self.queue.shutdown(&task_id).await;
                continue;
            }
            match self.active_groups.get_mut(&group_id) {
                Some(group) => {
                    let ours = group.base_sequence_name == io.base_sequence_name;
                    let same_start = group.start_offsets
                        == io.start_partitions.partition_sequence_map;
                    if ours || same_start {
                        info!(task_id, group_id, "adopting replica");
                        group.replica_task_ids.insert(task_id);
                    } else {
                        info!(task_id, "shutting down task from a stale generation");
                        let _ = self.queue.shutdown(&task_id).await;
                    }
                }
                None => {
                    // First sight of this group (fresh supervisor): rebuild
                    // the group from the task's own spec so replicas stay
                    // aligned.
                    info!(task_id, group_id, "adopting task group");
                    let mut group = TaskGroup::new(
                        group_id,
                        io.base_sequence_name.clone(),
                        io.start_partitions.partition_sequence_map.clone(),
                        io.minimum_message_time,
                        io.maximum_message_time,
                        OffsetsSource::AdoptedTask,
                    );
                    group.exclusive_start_partitions =
                        io.exclusive_start_partitions.clone();
                    group.replica_task_ids.insert(task_id);
                    self.active_groups.insert(group_id, group);
                }
            }
        }
        Ok(())
    }

    fn knows_task(&self, task_id: &str) -> bool {
        self.active_groups
            .values()
            .any(|g| g.replica_task_ids.contains(task_id))
            || self
                .pending_groups
                .iter()
                .any(|p| p.group.replica_task_ids.contains(task_id))
    }

    /// Queries every active replica's queue state, runner status, and start
    /// time; drops dead replicas and kills unreachable ones.
    async fn refresh_task_states(&mut self) {
        let mut checks = Vec::new();
        for group in self.active_groups.values() {
            for task_id in &group.replica_task_ids {
                checks.push((group.group_id, task_id.clone()));
            }
        }

        type Checkpoints<F> = BTreeMap<
            i32,
            BTreeMap<<F as StreamFlavor>::PartitionId, <F as StreamFlavor>::Sequence>,
        >;

        enum Verdict<F: StreamFlavor> {
            Keep {
                start: Option<DateTime<Utc>>,
                checkpoints: Option<Checkpoints<F>>,
            },
            Dead,
            Unreachable,
        }

        let concurrency = self.spec.config.chat_threads.max(1);
        let mut stream = futures::stream::iter(checks.into_iter().map(|(group_id, task_id)| {
            let queue = Arc::clone(&self.queue);
            let chat = Arc::clone(&self.chat);
            async move {
                match queue.task_state(&task_id).await {
                    Ok(state) if state.is_complete() => {
                        return (group_id, task_id, Verdict::Dead);
                    }
                    Ok(TaskRunState::Pending) => {
                        return (
                            group_id,
                            task_id,
                            Verdict::Keep {
                                start: None,
                                checkpoints: None,
                            },
                        );
                    }
                    Ok(TaskRunState::Running) => {}
                    Err(e) => {
                        debug!(task_id, "queue state unavailable: {e}");
                        return (
                            group_id,
                            task_id,
                            Verdict::Keep {
                                start: None,
                                checkpoints: None,
                            },
                        );
                    }
                }
                match chat.status(&task_id).await {
                    Err(TaskClientError::Unreachable { .. }) => {
                        (group_id, task_id, Verdict::Unreachable)
                    }
                    Err(e) => {
                        debug!(task_id, "status chat failed: {e}");
                        (
                            group_id,
                            task_id,
                            Verdict::Keep {
                                start: None,
                                checkpoints: None,
                            },
                        )
                    }
                    Ok(_status) => {
                        let start = chat.start_time(&task_id).await.ok().flatten();
                        let checkpoints = chat.checkpoints(&task_id).await.ok();
                        (group_id, task_id, Verdict::Keep { start, checkpoints })
                    }
                }
            }
        }))
        .buffer_unordered(concurrency);

        let mut verdicts = Vec::new();
        while let Some(v) = stream.next().await {
            verdicts.push(v);
        }
        drop(stream);

        for (group_id, task_id, verdict) in verdicts {
            let Some(group) = self.active_groups.get_mut(&group_id) else {
                continue;
            };
            match verdict {
                Verdict::Keep { start, checkpoints } => {
                    if let Some(start) = start {
                        group.task_start_times.entry(task_id.clone()).or_insert(start);
                    }
                    // A replica whose recorded checkpoints contradict the
                    // group's history would publish different sequence
                    // boundaries than its peers; kill it before it can.
                    let divergent = checkpoints.map_or(false, |cps| {
                        cps.iter().any(|(id, offsets)| {
                            group
                                .checkpoint_history
                                .get(id)
                                .map_or(false, |recorded| recorded != offsets)
                        })
                    });
                    if divergent {
                        warn!(task_id, group_id, "replica checkpoints diverged; killing");
                        let _ = self.queue.shutdown(&task_id).await;
                        group.replica_task_ids.remove(&task_id);
                        group.task_start_times.remove(&task_id);
                    }
                }
                Verdict::Dead => {
                    warn!(task_id, group_id, "replica exited while reading; will replace");
                    group.replica_task_ids.remove(&task_id);
                    group.task_start_times.remove(&task_id);
                }
                Verdict::Unreachable => {
                    warn!(task_id, group_id, "replica unreachable; killing and replacing");
                    let _ = self.queue.shutdown(&task_id).await;
                    group.replica_task_ids.remove(&task_id);
                    group.task_start_times.remove(&task_id);
                }
            }
        }
    }

    /// Creates task groups for partitions that have none, choosing starting
    /// offsets from the stored commit and falling back to stream probes.
    async fn ensure_groups(
        &mut self,
        wanted: &BTreeMap<i32, BTreeSet<F::PartitionId>>,
    ) -> Result<(), anyhow::Error> {
        for (group_id, partitions) in wanted {
            if self.active_groups.contains_key(group_id) {
                continue;
            }
            let (start_offsets, source) = self.starting_offsets(partitions).await?;
            let now = Utc::now();
            let minimum_message_time = self
                .spec
                .config
                .late_message_rejection_period()
                .map(|p| now - ChronoDuration::from_std(p).expect("period fits"));
            let maximum_message_time = self
                .spec
                .config
                .early_message_rejection_period()
                .map(|p| {
                    now + ChronoDuration::from_std(p + self.spec.config.task_duration())
                        .expect("period fits")
                });
            let base = self.generate_base_sequence_name(
                &start_offsets,
                minimum_message_time,
                maximum_message_time,
            );
            info!(
                group_id,
                base_sequence_name = %base,
                source = ?source,
                "planning new task group"
            );
            self.active_groups.insert(
                *group_id,
                TaskGroup::new(
                    *group_id,
                    base,
                    start_offsets,
                    minimum_message_time,
                    maximum_message_time,
                    source,
                ),
            );
        }
        Ok(())
    }

    /// Starting offsets for a brand-new group: stored commit entries where
    /// they exist, stream probes where they do not.
    async fn starting_offsets(
        &mut self,
        partitions: &BTreeSet<F::PartitionId>,
    ) -> Result<(BTreeMap<F::PartitionId, F::Sequence>, OffsetsSource), anyhow::Error> {
        let stored = self
            .actions
            .retrieve_metadata(&self.spec.datasource)
            .await
            .context("reading stored metadata")?;
        let stored_map = match stored {
            None => BTreeMap::new(),
            Some(metadata) => {
                // A stored commit we cannot interpret is corrupt; refusing
                // to guess is what keeps exactly-once honest.
                let meta = F::unwrap_metadata(metadata)
                    .ok_or_else(|| anyhow!("stored metadata is for a different stream flavor"))?;
                if meta.stream() != self.spec.stream {
                    bail!(
                        "stored metadata names stream {}, supervisor reads {}",
                        meta.stream(),
                        self.spec.stream
                    );
                }
                meta.partitions.partition_sequence_map
            }
        };

        let mut offsets = BTreeMap::new();
        let mut any_stored = false;
        let mut any_probed = false;
        for partition in partitions {
            match stored_map.get(partition) {
                Some(sequence) => {
                    any_stored = true;
                    offsets.insert(partition.clone(), sequence.clone());
                }
                None => {
                    any_probed = true;
                    let sp = StreamPartition::new(self.spec.stream.clone(), partition.clone());
                    let use_earliest = self.spec.config.use_earliest_sequence_number;
                    let supplier = &mut self.supplier;
                    let probed = tokio::task::block_in_place(|| {
                        if use_earliest {
                            supplier.earliest_sequence_number(&sp)
                        } else {
                            supplier.latest_sequence_number(&sp)
                        }
                    })
                    .with_context(|| format!("probing start offset for {sp}"))?;
                    offsets.insert(partition.clone(), probed);
                }
            }
        }
        let source = match (any_stored, any_probed) {
            (true, _) => OffsetsSource::StoredMetadata,
            (false, _) if self.spec.config.use_earliest_sequence_number => {
                OffsetsSource::StreamEarliest
            }
            _ => OffsetsSource::StreamLatest,
        };
        Ok((offsets, source))
    }

    /// Deterministic name shared by every replica of a group generation:
    /// derived from the group's start state so a restarted supervisor
    /// recognizes its own tasks.
    fn generate_base_sequence_name(
        &self,
        start_offsets: &BTreeMap<F::PartitionId, F::Sequence>,
        minimum_message_time: Option<DateTime<Utc>>,
        maximum_message_time: Option<DateTime<Utc>>,
    ) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut mix = |bytes: &[u8]| {
            for b in bytes {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        };
        for (partition, sequence) in start_offsets {
            mix(partition.to_string().as_bytes());
            mix(sequence.to_string().as_bytes());
        }
        if let Some(t) = minimum_message_time {
            mix(t.to_rfc3339().as_bytes());
        }
        if let Some(t) = maximum_message_time {
            mix(t.to_rfc3339().as_bytes());
        }
        format!("index_{}_{}_{:08x}", F::NAME, self.spec.datasource, hash as u32)
    }

    /// Rolls over groups whose earliest replica has been reading for the
    /// full task duration: capture the leader's offsets, seal every replica
    /// at them, and hand the group to pending-completion.
    async fn rollover_elapsed_groups(&mut self) {
        let duration =
            ChronoDuration::from_std(self.spec.config.task_duration()).expect("duration fits");
        let due: Vec<i32> = self
            .active_groups
            .values()
            .filter(|g| {
                !g.replica_task_ids.is_empty()
                    && g.earliest_task_start()
                        .map_or(false, |started| started + duration <= Utc::now())
            })
            .map(|g| g.group_id)
            .collect();
        for group_id in due {
            info!(group_id, "task duration elapsed; sealing group");
            if let Err(e) = self.seal_group(group_id).await {
                warn!(group_id, "sealing failed; killing group for replanning: {:#}", e);
                self.kill_group(group_id).await;
            }
        }
    }

    /// The graceful end of a group's reading life: pause the leading
    /// replica, read the offsets it parked at, and propagate them as final
    /// end offsets to every replica. Successors start exactly there.
    async fn seal_group(&mut self, group_id: i32) -> Result<(), anyhow::Error> {
        let (leader, replicas) = {
            let group = self
                .active_groups
                .get(&group_id)
                .ok_or_else(|| anyhow!("no group {group_id}"))?;
            let leader = group
                .replica_task_ids
                .iter()
                .next()
                .cloned()
                .ok_or_else(|| anyhow!("group {group_id} has no replicas"))?;
            (leader, group.replica_task_ids.clone())
        };

        let offsets = self
            .chat
            .pause(&leader)
            .await
            .with_context(|| format!("pausing leader {leader}"))?;
        for task_id in &replicas {
            if task_id != &leader {
                // Replicas must be paused before accepting end offsets.
                self.chat
                    .pause(task_id)
                    .await
                    .with_context(|| format!("pausing replica {task_id}"))?;
            }
            self.chat
                .set_end_offsets(task_id, offsets.clone(), true)
                .await
                .with_context(|| format!("sealing replica {task_id}"))?;
        }

        let group = self
            .active_groups
            .remove(&group_id)
            .expect("checked above");
        let exclusive = group.exclusive_start_partitions.clone();
        self.pending_groups.push(PendingGroup {
            group,
            deadline: Instant::now() + self.spec.config.completion_timeout(),
        });

        // Plan the successor immediately so ingestion continues while the
        // predecessor publishes.
        let now = Utc::now();
        let minimum_message_time = self
            .spec
            .config
            .late_message_rejection_period()
            .map(|p| now - ChronoDuration::from_std(p).expect("period fits"));
        let maximum_message_time = self.spec.config.early_message_rejection_period().map(|p| {
            now + ChronoDuration::from_std(p + self.spec.config.task_duration())
                .expect("period fits")
        });
        let base = self.generate_base_sequence_name(
            &offsets,
            minimum_message_time,
            maximum_message_time,
        );
        let mut successor = TaskGroup::new(
            group_id,
            base,
            offsets,
            minimum_message_time,
            maximum_message_time,
            OffsetsSource::PriorGroup,
        );
        successor.exclusive_start_partitions = exclusive;
        self.active_groups.insert(group_id, successor);
        Ok(())
    }

    /// Tops groups up to the configured replica count.
    async fn ensure_replicas(&mut self) -> Result<(), anyhow::Error> {
        let mut to_submit = Vec::new();
        for group in self.active_groups.values_mut() {
            while group.replica_task_ids.len() < self.spec.config.replicas {
                let task_id = format!(
                    "{}_{}",
                    group.base_sequence_name,
                    &uuid::Uuid::new_v4().simple().to_string()[..10]
                );
                group.replica_task_ids.insert(task_id.clone());
                to_submit.push((task_id, group.group_id));
            }
        }
        for (task_id, group_id) in to_submit {
            let spec = self.build_task_spec(&task_id, group_id)?;
            info!(task_id, group_id, "submitting replica task");
            if let Err(e) = self.queue.submit(spec).await {
                warn!(task_id, "task submission failed: {e}");
                if let Some(group) = self.active_groups.get_mut(&group_id) {
                    group.replica_task_ids.remove(&task_id);
                }
            }
        }
        Ok(())
    }

    fn build_task_spec(
        &self,
        task_id: &str,
        group_id: i32,
    ) -> Result<IndexTaskSpec<F::PartitionId, F::Sequence>, anyhow::Error> {
        let group = self
            .active_groups
            .get(&group_id)
            .ok_or_else(|| anyhow!("no group {group_id}"))?;
        let end_partitions: BTreeMap<F::PartitionId, F::Sequence> = group
            .start_offsets
            .keys()
            .map(|p| (p.clone(), F::Sequence::no_end()))
            .collect();
        let mut context = BTreeMap::new();
        if group.checkpoint_history.len() > 1 {
            // Replacement tasks must rebuild the same sequence chain as the
            // replicas they join.
            let checkpoints: BTreeMap<String, BTreeMap<String, &F::Sequence>> = group
                .checkpoint_history
                .iter()
                .map(|(id, offsets)| {
                    (
                        id.to_string(),
                        offsets.iter().map(|(p, s)| (p.to_string(), s)).collect(),
                    )
                })
                .collect();
            context.insert(
                CHECKPOINTS_CONTEXT_KEY.to_owned(),
                serde_json::to_value(checkpoints).context("encoding checkpoints")?,
            );
        }
        Ok(IndexTaskSpec {
            id: task_id.to_owned(),
            datasource: self.spec.datasource.clone(),
            io_config: TaskIoConfig {
                task_group_id: group_id,
                base_sequence_name: group.base_sequence_name.clone(),
                start_partitions: StreamPartitions::new(
                    self.spec.stream.clone(),
                    group.start_offsets.clone(),
                ),
                end_partitions: StreamPartitions::new(self.spec.stream.clone(), end_partitions),
                minimum_message_time: group.minimum_message_time,
                maximum_message_time: group.maximum_message_time,
                exclusive_start_partitions: group.exclusive_start_partitions.clone(),
            },
            tuning_config: self.spec.task_tuning.clone(),
            context,
        })
    }

    /// Watches pending groups: discards them when every replica published,
    /// kills stragglers when the completion budget runs out or a publisher
    /// failed (the stored commit then decides where the next group starts).
    async fn manage_pending_completion(&mut self) {
        let mut kept = Vec::new();
        let mut failed_group_ids = Vec::new();
        for pending in std::mem::take(&mut self.pending_groups) {
            let mut all_done = true;
            let mut any_failed = false;
            for task_id in &pending.group.replica_task_ids {
                match self.queue.task_state(task_id).await {
                    Ok(TaskRunState::Success) => {}
                    Ok(TaskRunState::Failed) => {
                        any_failed = true;
                        all_done = false;
                    }
                    Ok(_) => all_done = false,
                    Err(_) => all_done = false,
                }
            }
            if all_done {
                info!(group_id = pending.group.group_id, "pending group published and retired");
                continue;
            }
            let timed_out = Instant::now() >= pending.deadline;
            if any_failed || timed_out {
                warn!(
                    group_id = pending.group.group_id,
                    timed_out, "pending group failed; killing stragglers"
                );
                for task_id in &pending.group.replica_task_ids {
                    let _ = self.queue.shutdown(task_id).await;
                }
                failed_group_ids.push(pending.group.group_id);
                continue;
            }
            kept.push(pending);
        }
        self.pending_groups = kept;

        // A failed publish orphans the successor's start offsets; drop the
        // successor too and let the next tick replan from stored metadata.
        for group_id in failed_group_ids {
            self.kill_group(group_id).await;
        }
    }

    async fn kill_group(&mut self, group_id: i32) {
        if let Some(group) = self.active_groups.remove(&group_id) {
            for task_id in &group.replica_task_ids {
                let _ = self.queue.shutdown(task_id).await;
            }
        }
    }

    /// A reading task hit a segment boundary: align every replica on the
    /// same sequence split so their publishes stay byte-identical.
    async fn handle_checkpoint(&mut self, action: CheckpointAction) -> Result<(), anyhow::Error> {
        let group_id = action.task_group_id;
        let Some(group) = self.active_groups.get(&group_id) else {
            debug!(group_id, "checkpoint for unknown group; ignoring");
            return Ok(());
        };
        if group.base_sequence_name != action.base_sequence_name {
            debug!(group_id, "checkpoint from a stale generation; ignoring");
            return Ok(());
        }
        let current = F::unwrap_metadata(action.current_metadata.clone())
            .ok_or_else(|| anyhow!("checkpoint metadata has the wrong flavor"))?;
        let mut aligned = current.partitions.partition_sequence_map;
        let replicas = group.replica_task_ids.clone();

        let result: Result<(), anyhow::Error> = async {
            // Pause everyone and take the per-partition maximum: no replica
            // may be asked to seal below its own progress.
            for task_id in &replicas {
                let offsets = self
                    .chat
                    .pause(task_id)
                    .await
                    .with_context(|| format!("pausing {task_id} for checkpoint"))?;
                for (partition, sequence) in offsets {
                    match aligned.get(&partition) {
                        Some(existing) if *existing >= sequence => {}
                        _ => {
                            aligned.insert(partition, sequence);
                        }
                    }
                }
            }
            for task_id in &replicas {
                self.chat
                    .set_end_offsets(task_id, aligned.clone(), false)
                    .await
                    .with_context(|| format!("checkpointing {task_id}"))?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                let group = self
                    .active_groups
                    .get_mut(&group_id)
                    .expect("group checked above");
                let next_id = group
                    .checkpoint_history
                    .keys()
                    .next_back()
                    .map_or(0, |id| id + 1);
                group.checkpoint_history.insert(next_id, aligned);
                info!(group_id, checkpoint = next_id, "checkpoint aligned across replicas");
                Ok(())
            }
            Err(e) => {
                warn!(group_id, "checkpoint alignment failed; killing group: {:#}", e);
                self.kill_group(group_id).await;
                Err(e)
            }
        }
    }

    async fn handle_reset(
        &mut self,
        metadata: Option<DataSourceMetadata>,
    ) -> Result<(), anyhow::Error> {
        let affected: Vec<i32> = match &metadata {
            None => self.active_groups.keys().copied().collect(),
            Some(subset) => {
                let subset = F::unwrap_metadata(subset.clone())
                    .ok_or_else(|| anyhow!("reset metadata has the wrong flavor"))?;
                let partitions: BTreeSet<_> = subset
                    .partitions
                    .partition_sequence_map
                    .keys()
                    .cloned()
                    .collect();
                self.active_groups
                    .values()
                    .filter(|g| g.partitions().iter().any(|p| partitions.contains(p)))
                    .map(|g| g.group_id)
                    .collect()
            }
        };
        self.actions
            .reset_metadata(ResetMetadataAction {
                datasource: self.spec.datasource.clone(),
                metadata,
            })
            .await
            .context("resetting stored metadata")?;
        for group_id in affected {
            info!(group_id, "killing group after metadata reset");
            self.kill_group(group_id).await;
        }
        Ok(())
    }

    /// The suspension path: every active group is sealed at its current
    /// offsets so its tasks publish and exit; nothing new spawns while
    /// suspended.
    async fn gracefully_stop_groups(&mut self) {
        let group_ids: Vec<i32> = self.active_groups.keys().copied().collect();
        for group_id in group_ids {
            let has_replicas = self
                .active_groups
                .get(&group_id)
                .map_or(false, |g| !g.replica_task_ids.is_empty());
            if !has_replicas {
                self.active_groups.remove(&group_id);
                continue;
            }
            if let Err(e) = self.seal_group(group_id).await {
                warn!(group_id, "graceful stop failed; killing group: {:#}", e);
                self.kill_group(group_id).await;
            } else {
                // seal_group planned a successor; suspension wants none.
                self.active_groups.remove(&group_id);
            }
        }
    }

    async fn build_report(&mut self) -> SupervisorReport {
        let duration =
            ChronoDuration::from_std(self.spec.config.task_duration()).expect("duration fits");
        let mut active_tasks = Vec::new();
        let mut lag: BTreeMap<String, u64> = BTreeMap::new();
        let mut lag_supported = false;

        let group_replicas: Vec<(i32, String, Option<DateTime<Utc>>)> = self
            .active_groups
            .values()
            .flat_map(|g| {
                g.replica_task_ids
                    .iter()
                    .map(|t| (g.group_id, t.clone(), g.task_start_times.get(t).copied()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (group_id, task_id, start_time) in group_replicas {
            let current_offsets = match self.chat.current_offsets(&task_id).await {
                Ok(offsets) => offsets,
                Err(_) => BTreeMap::new(),
            };
            // Lag is the distance from each partition's stream tail to the
            // task's position, where the sequence domain can express it.
            for (partition, sequence) in &current_offsets {
                let sp = StreamPartition::new(self.spec.stream.clone(), partition.clone());
                let supplier = &mut self.supplier;
                if let Ok(latest) =
                    tokio::task::block_in_place(|| supplier.latest_sequence_number(&sp))
                {
                    if let Some(behind) = latest.offset_distance(sequence) {
                        lag_supported = true;
                        let entry = lag.entry(partition.to_string()).or_default();
                        *entry = (*entry).max(behind);
                    }
                }
            }
            let remaining_seconds = start_time
                .map(|s| ((s + duration) - Utc::now()).num_seconds());
            active_tasks.push(TaskSnapshot {
                task_id,
                group_id,
                start_time,
                remaining_seconds,
                current_offsets: current_offsets
                    .iter()
                    .map(|(p, s)| {
                        (
                            p.to_string(),
                            serde_json::to_value(s).expect("sequence serializes"),
                        )
                    })
                    .collect(),
            });
        }

        let publishing_tasks = self
            .pending_groups
            .iter()
            .flat_map(|p| {
                p.group.replica_task_ids.iter().map(|t| TaskSnapshot {
                    task_id: t.clone(),
                    group_id: p.group.group_id,
                    start_time: p.group.task_start_times.get(t).copied(),
                    remaining_seconds: None,
                    current_offsets: BTreeMap::new(),
                })
            })
            .collect();

        let groups = self
            .active_groups
            .values()
            .map(|g| GroupSnapshot {
                group_id: g.group_id,
                base_sequence_name: g.base_sequence_name.clone(),
                offsets_source: g.offsets_source,
                start_offsets: g
                    .start_offsets
                    .iter()
                    .map(|(p, s)| {
                        (
                            p.to_string(),
                            serde_json::to_value(s).expect("sequence serializes"),
                        )
                    })
                    .collect(),
            })
            .collect();

        let aggregate_lag = lag_supported.then(|| lag.values().copied().sum::<u64>());
        SupervisorReport {
            datasource: self.spec.datasource.clone(),
            stream: self.spec.stream.clone(),
            suspended: self.suspended,
            partitions: self.last_partitions.len(),
            replicas: self.spec.config.replicas,
            task_count: self.spec.config.task_count,
            active_tasks,
            publishing_tasks,
            groups,
            lag: lag_supported.then_some(lag),
            aggregate_lag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_assignment_is_stable() {
        // Pinned: the same partition must land in the same group across
        // supervisor restarts and across processes.
        for task_count in [1usize, 2, 3, 8] {
            for partition in 0i32..64 {
                let a = group_for_partition(&partition, task_count);
                let b = group_for_partition(&partition, task_count);
                assert_eq!(a, b);
                assert!((a as usize) < task_count);
            }
        }
        let shard = "shardId-000000000007".to_owned();
        assert_eq!(
            group_for_partition(&shard, 4),
            group_for_partition(&shard, 4)
        );
    }
}
