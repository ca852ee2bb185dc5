// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The shard-sequence record supplier, backed by per-shard fetchers on a
//! fixed-size worker pool.
//!
//! Shard streams have no long-lived fetch session: each shard is read
//! through a leased iterator that must be advanced (and occasionally
//! recreated) by the client. Fetch ticks for all assigned shards multiplex
//! over `fetch_threads` worker threads through a shared delay queue; fetched
//! records flow into a bounded buffer that `poll` drains. A full buffer
//! pushes back on the fetchers, never on the stream service: the fetcher
//! rewinds its iterator to the first unoffered record and tries again later.
//!
//! Errors inside a fetch tick never propagate to `poll` callers; they only
//! decide when that shard's next tick runs.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_kinesis::error::{GetRecordsErrorKind, ListShardsErrorKind};
use aws_sdk_kinesis::model::ShardIteratorType;
use aws_sdk_kinesis::types::SdkError;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use strata_types::{SequenceNumber, ShardFlavor, ShardSequence, StreamPartition, StreamRecord};

use crate::{RecordSupplier, SupplierError};

/// Where to (re)create a shard iterator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IteratorPosition {
    TrimHorizon,
    Latest,
    AtSequence(ShardSequence),
    AfterSequence(ShardSequence),
}

/// One `get_records` result: the fetched payloads and the lease for the next
/// call. `next_iterator` of `None` means the shard has closed and everything
/// in it has been read.
#[derive(Clone, Debug)]
pub struct ShardRecordBatch {
    pub records: Vec<(ShardSequence, Vec<u8>)>,
    pub next_iterator: Option<String>,
}

/// Errors from the shard service.
#[derive(Debug, thiserror::Error)]
pub enum ShardApiError {
    #[error("throughput limit exceeded")]
    Throttled,
    #[error("stream {0} does not exist")]
    StreamNotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The slice of the shard service the supplier consumes.
///
/// The trait exists so the fetch machinery can be exercised against a
/// scripted stream in tests; production uses [`KinesisShardApi`].
#[async_trait]
pub trait ShardApi: Send + Sync + 'static {
    async fn list_shards(&self, stream: &str) -> Result<Vec<String>, ShardApiError>;

    /// Returns `None` if the shard is closed and `position` is past its end.
    async fn shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> Result<Option<String>, ShardApiError>;

    async fn get_records(
        &self,
        iterator: &str,
        limit: usize,
    ) -> Result<ShardRecordBatch, ShardApiError>;
}

/// Tuning for the shard supplier's fetch machinery.
#[derive(Clone, Debug)]
pub struct ShardSupplierConfig {
    /// Records requested per `get_records` call.
    pub records_per_fetch: usize,
    /// Delay between consecutive fetch ticks for one shard.
    pub fetch_delay: Duration,
    /// Capacity of the record buffer between fetchers and `poll`.
    pub record_buffer_size: usize,
    /// How long a fetcher waits to place one record into a full buffer
    /// before rewinding and rescheduling.
    pub record_buffer_offer_timeout: Duration,
    /// How long a fetcher sleeps after the buffer turned it away.
    pub record_buffer_full_wait: Duration,
    /// Upper bound on records returned from one `poll`.
    pub max_records_per_poll: usize,
    /// Worker threads multiplexing the fetch ticks.
    pub fetch_threads: usize,
    /// Fetch window for the earliest/latest probes.
    pub probe_timeout: Duration,
    /// Backoff after a throughput-limit error.
    pub throughput_backoff: Duration,
    /// Backoff after any other fetch error.
    pub exception_retry_delay: Duration,
    /// Deadline for joining workers during close and restarts.
    pub shutdown_join_timeout: Duration,
}

impl Default for ShardSupplierConfig {
    fn default() -> Self {
        ShardSupplierConfig {
            records_per_fetch: 4000,
            fetch_delay: Duration::from_millis(0),
            record_buffer_size: 10000,
            record_buffer_offer_timeout: Duration::from_secs(5),
            record_buffer_full_wait: Duration::from_secs(5),
            max_records_per_poll: 100,
            fetch_threads: 2,
            probe_timeout: Duration::from_secs(10),
            throughput_backoff: Duration::from_secs(3),
            exception_retry_delay: Duration::from_secs(1),
            shutdown_join_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-shard fetch state.
#[derive(Clone, Debug)]
enum FetchState {
    /// Assigned but never positioned; not schedulable.
    Unpositioned,
    /// The next tick must create an iterator at the given position.
    NeedsIterator(IteratorPosition),
    /// A live iterator is in hand. `recreate` is one past the last record
    /// this fetcher placed into the buffer: where to rebuild the lease if it
    /// expires or the service errors.
    Active {
        iterator: String,
        recreate: IteratorPosition,
    },
    /// The shard has been read to its end; the closed marker still needs to
    /// reach the buffer.
    EndMarkerPending,
    /// The closed marker is in (or has passed through) the buffer.
    Closed,
}

struct PartitionResource {
    state: FetchState,
    /// One past the last record the caller drained: where fetching resumes
    /// after the pool restarts and the buffer is dropped.
    resume_position: Option<IteratorPosition>,
}

impl PartitionResource {
    fn new() -> Self {
        PartitionResource {
            state: FetchState::Unpositioned,
            resume_position: None,
        }
    }
}

type ShardStreamRecord = StreamRecord<String, ShardSequence>;

struct QueueState {
    heap: BinaryHeap<Reverse<(Instant, StreamPartition<String>)>>,
    shutdown: bool,
}

struct FetchShared {
    api: Arc<dyn ShardApi>,
    handle: Handle,
    config: ShardSupplierConfig,
    resources: Arc<Mutex<HashMap<StreamPartition<String>, PartitionResource>>>,
    buffer_tx: Sender<ShardStreamRecord>,
    queue: Mutex<QueueState>,
    queue_cond: Condvar,
    done_tx: Sender<()>,
}

impl FetchShared {
    fn schedule(&self, due: Instant, partition: StreamPartition<String>) {
        let mut state = self.queue.lock().expect("queue lock poisoned");
        if state.shutdown {
            return;
        }
        state.heap.push(Reverse((due, partition)));
        self.queue_cond.notify_one();
    }

    /// Runs one fetch tick for `partition`, returning when the next tick is
    /// due, or `None` if the shard needs no further fetching.
    fn run_tick(&self, partition: &StreamPartition<String>) -> Option<Instant> {
        let state = {
            let resources = self.resources.lock().expect("resources lock poisoned");
            match resources.get(partition) {
                Some(r) => r.state.clone(),
                // Unassigned while queued; nothing to do.
                None => return None,
            }
        };

        match state {
            FetchState::Unpositioned | FetchState::Closed => None,
            FetchState::NeedsIterator(position) => {
                match self.handle.block_on(self.api.shard_iterator(
                    &partition.stream,
                    &partition.partition_id,
                    &position,
                )) {
                    Ok(Some(iterator)) => {
                        self.set_state(
                            partition,
                            FetchState::Active {
                                iterator,
                                recreate: position,
                            },
                        );
                        Some(Instant::now())
                    }
                    Ok(None) => {
                        self.set_state(partition, FetchState::EndMarkerPending);
                        Some(Instant::now())
                    }
                    Err(ShardApiError::Throttled) => {
                        debug!(%partition, "iterator request throttled");
                        Some(Instant::now() + self.throttle_backoff())
                    }
                    Err(e) => {
                        warn!(%partition, "failed to create shard iterator: {:#}", anyhow!(e));
                        Some(Instant::now() + self.config.exception_retry_delay)
                    }
                }
            }
            FetchState::Active { iterator, recreate } => {
                match self
                    .handle
                    .block_on(self.api.get_records(&iterator, self.config.records_per_fetch))
                {
                    Err(ShardApiError::Throttled) => {
                        debug!(%partition, "get_records throttled");
                        Some(Instant::now() + self.throttle_backoff())
                    }
                    Err(e) => {
                        warn!(%partition, "fetch failed: {:#}", anyhow!(e));
                        // The lease may have expired; rebuild it just past
                        // the last record that reached the buffer.
                        self.set_state(partition, FetchState::NeedsIterator(recreate));
                        Some(Instant::now() + self.config.exception_retry_delay)
                    }
                    Ok(batch) => self.offer_batch(partition, batch, recreate),
                }
            }
            FetchState::EndMarkerPending => {
                let marker = StreamRecord::end_of_shard(
                    partition.stream.clone(),
                    partition.partition_id.clone(),
                );
                match self
                    .buffer_tx
                    .send_timeout(marker, self.config.record_buffer_offer_timeout)
                {
                    Ok(()) => {
                        info!(%partition, "shard closed; end marker buffered");
                        self.set_state(partition, FetchState::Closed);
                        None
                    }
                    Err(SendTimeoutError::Timeout(_)) => {
                        Some(Instant::now() + self.config.record_buffer_full_wait)
                    }
                    Err(SendTimeoutError::Disconnected(_)) => None,
                }
            }
        }
    }

    fn offer_batch(
        &self,
        partition: &StreamPartition<String>,
        batch: ShardRecordBatch,
        mut recreate: IteratorPosition,
    ) -> Option<Instant> {
        let total = batch.records.len();
        for (i, (sequence, payload)) in batch.records.into_iter().enumerate() {
            let record = StreamRecord::new(
                partition.stream.clone(),
                partition.partition_id.clone(),
                sequence.clone(),
                vec![payload],
            );
            match self
                .buffer_tx
                .send_timeout(record, self.config.record_buffer_offer_timeout)
            {
                Ok(()) => recreate = IteratorPosition::AfterSequence(sequence),
                Err(SendTimeoutError::Timeout(unoffered)) => {
                    // Buffer full: rewind to the first unoffered record and
                    // try again once the caller has drained some room.
                    debug!(
                        %partition,
                        buffered = i,
                        total,
                        "record buffer full; rewinding fetch"
                    );
                    self.set_state(
                        partition,
                        FetchState::NeedsIterator(IteratorPosition::AtSequence(
                            unoffered.sequence_number,
                        )),
                    );
                    return Some(Instant::now() + self.config.record_buffer_full_wait);
                }
                Err(SendTimeoutError::Disconnected(_)) => return None,
            }
        }
        match batch.next_iterator {
            Some(iterator) => {
                self.set_state(partition, FetchState::Active { iterator, recreate });
                Some(Instant::now() + self.config.fetch_delay)
            }
            None => {
                self.set_state(partition, FetchState::EndMarkerPending);
                Some(Instant::now())
            }
        }
    }

    fn set_state(&self, partition: &StreamPartition<String>, state: FetchState) {
        let mut resources = self.resources.lock().expect("resources lock poisoned");
        if let Some(resource) = resources.get_mut(partition) {
            resource.state = state;
        }
    }

    fn throttle_backoff(&self) -> Duration {
        self.config.throughput_backoff.max(self.config.fetch_delay)
    }
}

fn worker_loop(shared: Arc<FetchShared>) {
    loop {
        let work = {
            let mut state = shared.queue.lock().expect("queue lock poisoned");
            loop {
                if state.shutdown {
                    drop(state);
                    let _ = shared.done_tx.send(());
                    return;
                }
                let now = Instant::now();
                match state.heap.peek() {
                    Some(Reverse((due, _))) if *due <= now => {
                        let Reverse((_, partition)) = state.heap.pop().expect("peeked");
                        break partition;
                    }
                    Some(Reverse((due, _))) => {
                        let wait = *due - now;
                        let (s, _timeout) = shared
                            .queue_cond
                            .wait_timeout(state, wait)
                            .expect("queue lock poisoned");
                        state = s;
                    }
                    None => {
                        state = shared
                            .queue_cond
                            .wait(state)
                            .expect("queue lock poisoned");
                    }
                }
            }
        };
        if let Some(due) = shared.run_tick(&work) {
            shared.schedule(due, work);
        }
    }
}

/// The fixed-size worker pool. Recreated on every assignment change or seek.
struct FetcherPool {
    shared: Arc<FetchShared>,
    workers: Vec<thread::JoinHandle<()>>,
    done_rx: Receiver<()>,
}

impl FetcherPool {
    fn start(
        api: Arc<dyn ShardApi>,
        handle: Handle,
        config: ShardSupplierConfig,
        resources: Arc<Mutex<HashMap<StreamPartition<String>, PartitionResource>>>,
        buffer_tx: Sender<ShardStreamRecord>,
    ) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(FetchShared {
            api,
            handle,
            config,
            resources,
            buffer_tx,
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            queue_cond: Condvar::new(),
            done_tx,
        });
        let workers = (0..shared.config.fetch_threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("shard-fetch-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("spawning fetch worker")
            })
            .collect();
        FetcherPool {
            shared,
            workers,
            done_rx,
        }
    }

    fn schedule_now(&self, partition: StreamPartition<String>) {
        self.shared.schedule(Instant::now(), partition);
    }

    /// Signals shutdown and joins workers within `deadline`. Workers that
    /// are still mid-fetch when the deadline passes are abandoned; they exit
    /// on their own once the in-flight service call returns.
    fn stop(self, deadline: Duration) {
        {
            let mut state = self.shared.queue.lock().expect("queue lock poisoned");
            state.shutdown = true;
            state.heap.clear();
        }
        self.shared.queue_cond.notify_all();
        let stop_by = Instant::now() + deadline;
        let mut exited = 0;
        for _ in &self.workers {
            let remaining = stop_by.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(()) => exited += 1,
                Err(_) => break,
            }
        }
        if exited < self.workers.len() {
            warn!(
                exited,
                total = self.workers.len(),
                "abandoning fetch workers still busy at shutdown deadline"
            );
            return;
        }
        for worker in self.workers {
            // Exit already signaled through done_rx; this cannot block long.
            let _ = worker.join();
        }
    }
}

/// Record supplier for Kinesis-style streams.
pub struct ShardRecordSupplier {
    api: Arc<dyn ShardApi>,
    handle: Handle,
    config: ShardSupplierConfig,
    assignment: BTreeSet<StreamPartition<String>>,
    resources: Arc<Mutex<HashMap<StreamPartition<String>, PartitionResource>>>,
    buffer_rx: Receiver<ShardStreamRecord>,
    pool: Option<FetcherPool>,
    closed: bool,
}

impl ShardRecordSupplier {
    pub fn new(api: Arc<dyn ShardApi>, handle: Handle, config: ShardSupplierConfig) -> Self {
        // The buffer is recreated on every restart; this initial channel is
        // never written.
        let (_tx, rx) = crossbeam_channel::bounded(config.record_buffer_size.max(1));
        ShardRecordSupplier {
            api,
            handle,
            config,
            assignment: BTreeSet::new(),
            resources: Arc::new(Mutex::new(HashMap::new())),
            buffer_rx: rx,
            pool: None,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), SupplierError> {
        if self.closed {
            return Err(SupplierError::Closed);
        }
        Ok(())
    }

    fn ensure_assigned(&self, partition: &StreamPartition<String>) -> Result<(), SupplierError> {
        if !self.assignment.contains(partition) {
            return Err(SupplierError::NotAssigned {
                partition: partition.to_string(),
            });
        }
        Ok(())
    }

    /// Stops the pool, drops everything buffered, rewinds every live shard
    /// to its resume position, and starts a fresh pool.
    fn restart_fetch(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.stop(self.config.shutdown_join_timeout);
        }
        let (tx, rx) = crossbeam_channel::bounded(self.config.record_buffer_size.max(1));
        self.buffer_rx = rx;

        let mut schedulable = Vec::new();
        {
            let mut resources = self.resources.lock().expect("resources lock poisoned");
            for (partition, resource) in resources.iter_mut() {
                if let FetchState::Closed = resource.state {
                    continue;
                }
                match &resource.resume_position {
                    Some(position) => {
                        resource.state = FetchState::NeedsIterator(position.clone());
                        schedulable.push(partition.clone());
                    }
                    None => resource.state = FetchState::Unpositioned,
                }
            }
        }
        if schedulable.is_empty() {
            return;
        }
        let pool = FetcherPool::start(
            Arc::clone(&self.api),
            self.handle.clone(),
            self.config.clone(),
            Arc::clone(&self.resources),
            tx,
        );
        for partition in schedulable {
            pool.schedule_now(partition);
        }
        self.pool = Some(pool);
    }

    fn set_resume(&mut self, partition: &StreamPartition<String>, position: IteratorPosition) {
        let mut resources = self.resources.lock().expect("resources lock poisoned");
        let resource = resources
            .entry(partition.clone())
            .or_insert_with(PartitionResource::new);
        resource.resume_position = Some(position);
        resource.state = FetchState::Unpositioned;
    }

    /// Non-consuming probe loop shared by the earliest/latest operations.
    fn probe(
        &self,
        partition: &StreamPartition<String>,
        position: IteratorPosition,
    ) -> Result<ShardSequence, SupplierError> {
        let deadline = Instant::now() + self.config.probe_timeout;
        let mut iterator = match self
            .handle
            .block_on(
                self.api
                    .shard_iterator(&partition.stream, &partition.partition_id, &position),
            )
            .map_err(anyhow::Error::from)?
        {
            Some(iterator) => iterator,
            None => return Ok(ShardSequence::end_of_shard()),
        };
        loop {
            match self.handle.block_on(self.api.get_records(&iterator, 1)) {
                Err(ShardApiError::Throttled) => {
                    thread::sleep(self.config.exception_retry_delay.min(Duration::from_millis(200)));
                }
                Err(e) => return Err(SupplierError::Client(anyhow!(e))),
                Ok(batch) => {
                    if let Some((sequence, _)) = batch.records.first() {
                        return Ok(sequence.clone());
                    }
                    match batch.next_iterator {
                        None => return Ok(ShardSequence::end_of_shard()),
                        Some(next) => iterator = next,
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(SupplierError::ProbeTimeout {
                    partition: partition.to_string(),
                    timeout: self.config.probe_timeout,
                });
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

impl RecordSupplier<ShardFlavor> for ShardRecordSupplier {
    fn assign(
        &mut self,
        partitions: BTreeSet<StreamPartition<String>>,
    ) -> Result<(), SupplierError> {
        self.ensure_open()?;
        {
            let mut resources = self.resources.lock().expect("resources lock poisoned");
            resources.retain(|p, _| partitions.contains(p));
            for partition in &partitions {
                resources
                    .entry(partition.clone())
                    .or_insert_with(PartitionResource::new);
            }
        }
        info!(assignment = ?partitions, "assigning shards");
        self.assignment = partitions;
        self.restart_fetch();
        Ok(())
    }

    fn assignment(&self) -> BTreeSet<StreamPartition<String>> {
        self.assignment.clone()
    }

    fn seek(
        &mut self,
        partition: &StreamPartition<String>,
        sequence: &ShardSequence,
    ) -> Result<(), SupplierError> {
        self.ensure_open()?;
        self.ensure_assigned(partition)?;
        debug!(%partition, %sequence, "seeking");
        self.set_resume(partition, IteratorPosition::AtSequence(sequence.clone()));
        self.restart_fetch();
        Ok(())
    }

    fn seek_to_earliest(
        &mut self,
        partitions: &BTreeSet<StreamPartition<String>>,
    ) -> Result<(), SupplierError> {
        self.ensure_open()?;
        for partition in partitions {
            self.ensure_assigned(partition)?;
            self.set_resume(partition, IteratorPosition::TrimHorizon);
        }
        self.restart_fetch();
        Ok(())
    }

    fn seek_to_latest(
        &mut self,
        partitions: &BTreeSet<StreamPartition<String>>,
    ) -> Result<(), SupplierError> {
        self.ensure_open()?;
        for partition in partitions {
            self.ensure_assigned(partition)?;
            self.set_resume(partition, IteratorPosition::Latest);
        }
        self.restart_fetch();
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Vec<ShardStreamRecord> {
        if self.closed {
            return Vec::new();
        }
        let limit = self
            .config
            .record_buffer_size
            .max(1)
            .min(self.config.max_records_per_poll);
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < limit {
            let wait = if out.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            match self.buffer_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(record) => {
                    let partition = record.stream_partition();
                    let mut resources = self.resources.lock().expect("resources lock poisoned");
                    let Some(resource) = resources.get_mut(&partition) else {
                        // Raced an unassign; drop silently.
                        continue;
                    };
                    if !record.is_end_of_shard_marker() {
                        resource.resume_position = Some(IteratorPosition::AfterSequence(
                            record.sequence_number.clone(),
                        ));
                    }
                    drop(resources);
                    out.push(record);
                }
            }
        }
        out
    }

    fn earliest_sequence_number(
        &mut self,
        partition: &StreamPartition<String>,
    ) -> Result<ShardSequence, SupplierError> {
        self.ensure_open()?;
        self.probe(partition, IteratorPosition::TrimHorizon)
    }

    fn latest_sequence_number(
        &mut self,
        partition: &StreamPartition<String>,
    ) -> Result<ShardSequence, SupplierError> {
        self.ensure_open()?;
        self.probe(partition, IteratorPosition::Latest)
    }

    fn partition_ids(&mut self, stream: &str) -> Result<BTreeSet<String>, SupplierError> {
        self.ensure_open()?;
        let shards = self
            .handle
            .block_on(self.api.list_shards(stream))
            .map_err(|e| match e {
                ShardApiError::StreamNotFound(s) => SupplierError::StreamNotFound { stream: s },
                other => SupplierError::Client(anyhow!(other)),
            })?;
        Ok(shards.into_iter().collect())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(pool) = self.pool.take() {
            pool.stop(self.config.shutdown_join_timeout);
        }
    }
}

impl Drop for ShardRecordSupplier {
    fn drop(&mut self) {
        self.close();
    }
}

/// Production [`ShardApi`] over the AWS Kinesis SDK.
pub struct KinesisShardApi {
    client: aws_sdk_kinesis::Client,
}

impl KinesisShardApi {
    pub fn new(client: aws_sdk_kinesis::Client) -> Self {
        KinesisShardApi { client }
    }

    /// Builds a client from the ambient AWS environment.
    pub async fn connect() -> Self {
        let config = aws_config::load_from_env().await;
        KinesisShardApi {
            client: aws_sdk_kinesis::Client::new(&config),
        }
    }
}

#[async_trait]
impl ShardApi for KinesisShardApi {
    async fn list_shards(&self, stream: &str) -> Result<Vec<String>, ShardApiError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self.client.list_shards();
            req = match &next_token {
                // The service rejects requests naming both a token and a
                // stream name.
                Some(token) => req.next_token(token),
                None => req.stream_name(stream),
            };
            let output = req.send().await.map_err(|e| match &e {
                SdkError::ServiceError(ctx)
                    if matches!(
                        ctx.err().kind,
                        ListShardsErrorKind::ResourceNotFoundException(_)
                    ) =>
                {
                    ShardApiError::StreamNotFound(stream.to_owned())
                }
                _ => ShardApiError::Other(anyhow!(e)),
            })?;
            for shard in output.shards().unwrap_or_default() {
                if let Some(id) = shard.shard_id() {
                    shards.push(id.to_owned());
                }
            }
            match output.next_token() {
                Some(token) => next_token = Some(token.to_owned()),
                None => return Ok(shards),
            }
        }
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> Result<Option<String>, ShardApiError> {
        let mut req = self
            .client
            .get_shard_iterator()
            .stream_name(stream)
            .shard_id(shard_id);
        req = match position {
            IteratorPosition::TrimHorizon => {
                req.shard_iterator_type(ShardIteratorType::TrimHorizon)
            }
            IteratorPosition::Latest => req.shard_iterator_type(ShardIteratorType::Latest),
            IteratorPosition::AtSequence(seq) => req
                .shard_iterator_type(ShardIteratorType::AtSequenceNumber)
                .starting_sequence_number(seq.as_str()),
            IteratorPosition::AfterSequence(seq) => req
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(seq.as_str()),
        };
        let output = req.send().await.map_err(|e| ShardApiError::Other(anyhow!(e)))?;
        Ok(output.shard_iterator().map(|s| s.to_owned()))
    }

    async fn get_records(
        &self,
        iterator: &str,
        limit: usize,
    ) -> Result<ShardRecordBatch, ShardApiError> {
        let output = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit.min(10000) as i32)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(ctx)
                    if matches!(
                        ctx.err().kind,
                        GetRecordsErrorKind::ProvisionedThroughputExceededException(_)
                    ) =>
                {
                    ShardApiError::Throttled
                }
                _ => ShardApiError::Other(anyhow!(e)),
            })?;
        let mut records = Vec::new();
        for record in output.records().unwrap_or_default() {
            let sequence = record
                .sequence_number()
                .unwrap_or_default()
                .parse::<ShardSequence>()
                .map_err(|e| ShardApiError::Other(anyhow!(e)))?;
            let data = record
                .data()
                .map(|blob| blob.clone().into_inner())
                .unwrap_or_default();
            records.push((sequence, data));
        }
        Ok(ShardRecordBatch {
            records,
            next_iterator: output.next_shard_iterator().map(|s| s.to_owned()),
        })
    }
}
