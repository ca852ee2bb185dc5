// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The broker-offset record supplier, backed by a single `rdkafka` consumer.
//!
//! The consumer is driven synchronously: `poll` returns what the driver
//! yields, there is no buffering beyond the driver's own fetch batches.
//! Partition assignment is always manual; a unique group id is chosen at
//! construction so the broker never attempts its own consumer-group
//! balancing against our explicit placement.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::types::RDKafkaRespErr;
use rdkafka::ClientContext;
use tracing::{debug, info, warn};

use strata_types::{BrokerFlavor, BrokerOffset, StreamPartition, StreamRecord};

use crate::{RecordSupplier, SupplierError};

/// How long to wait for broker metadata and watermark probes.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on records returned from one `poll`.
const MAX_RECORDS_PER_POLL: usize = 1000;

/// Forwards librdkafka's log and error callbacks into `tracing`.
struct LoggingConsumerContext;

impl ClientContext for LoggingConsumerContext {
    fn log(&self, level: rdkafka::config::RDKafkaLogLevel, fac: &str, log_message: &str) {
        use rdkafka::config::RDKafkaLogLevel::*;
        match level {
            Emerg | Alert | Critical | Error => {
                tracing::error!(target: "librdkafka", "{} {}", fac, log_message)
            }
            Warning => tracing::warn!(target: "librdkafka", "{} {}", fac, log_message),
            Notice | Info => tracing::info!(target: "librdkafka", "{} {}", fac, log_message),
            Debug => tracing::debug!(target: "librdkafka", "{} {}", fac, log_message),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        tracing::error!(target: "librdkafka", "{}: {}", error, reason);
    }
}

impl ConsumerContext for LoggingConsumerContext {}

/// Record supplier for Kafka-style streams.
pub struct BrokerRecordSupplier {
    consumer: BaseConsumer<LoggingConsumerContext>,
    assignment: BTreeSet<StreamPartition<i32>>,
    /// Next offset to read per assigned partition. Entries exist only after
    /// a seek; polling a partition that was assigned but never sought
    /// returns nothing until the runner positions it.
    positions: HashMap<StreamPartition<i32>, i64>,
    closed: bool,
}

impl BrokerRecordSupplier {
    /// Creates a supplier from broker properties. `group_id_suffix`
    /// distinguishes this task's consumer so the broker-side group machinery
    /// stays inert.
    pub fn new(
        bootstrap_servers: &str,
        group_id_suffix: &str,
        properties: &HashMap<String, String>,
    ) -> Result<Self, SupplierError> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "none")
            .set("group.id", format!("strata-supplier-{}", group_id_suffix));
        for (k, v) in properties {
            config.set(k, v);
        }
        let consumer = config
            .create_with_context(LoggingConsumerContext)
            .context("creating kafka consumer")?;
        Ok(BrokerRecordSupplier {
            consumer,
            assignment: BTreeSet::new(),
            positions: HashMap::new(),
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), SupplierError> {
        if self.closed {
            return Err(SupplierError::Closed);
        }
        Ok(())
    }

    fn ensure_assigned(&self, partition: &StreamPartition<i32>) -> Result<(), SupplierError> {
        if !self.assignment.contains(partition) {
            return Err(SupplierError::NotAssigned {
                partition: partition.to_string(),
            });
        }
        Ok(())
    }

    /// Pushes the tracked positions down into the driver by re-assigning the
    /// full working set with explicit offsets. librdkafka applies the offsets
    /// from the assignment itself, which sidesteps the seek-before-fetch
    /// restrictions of `Consumer::seek`.
    fn apply_positions(&mut self) -> Result<(), SupplierError> {
        let tpl = build_assignment(&self.assignment, &self.positions);
        self.consumer
            .assign(&tpl)
            .context("assigning partitions")?;
        Ok(())
    }

    fn watermarks(&self, partition: &StreamPartition<i32>) -> Result<(i64, i64), SupplierError> {
        let (low, high) = self
            .consumer
            .fetch_watermarks(&partition.stream, partition.partition_id, METADATA_TIMEOUT)
            .with_context(|| format!("fetching watermarks for {partition}"))?;
        Ok((low, high))
    }
}

impl RecordSupplier<BrokerFlavor> for BrokerRecordSupplier {
    fn assign(
        &mut self,
        partitions: BTreeSet<StreamPartition<i32>>,
    ) -> Result<(), SupplierError> {
        self.ensure_open()?;
        self.positions.retain(|p, _| partitions.contains(p));
        self.assignment = partitions;
        info!(assignment = ?self.assignment, "assigning broker partitions");
        self.apply_positions()
    }

    fn assignment(&self) -> BTreeSet<StreamPartition<i32>> {
        self.assignment.clone()
    }

    fn seek(
        &mut self,
        partition: &StreamPartition<i32>,
        sequence: &BrokerOffset,
    ) -> Result<(), SupplierError> {
        self.ensure_open()?;
        self.ensure_assigned(partition)?;
        debug!(%partition, offset = sequence.0, "seeking");
        self.positions.insert(partition.clone(), sequence.0);
        self.apply_positions()
    }

    fn seek_to_earliest(
        &mut self,
        partitions: &BTreeSet<StreamPartition<i32>>,
    ) -> Result<(), SupplierError> {
        self.ensure_open()?;
        for partition in partitions {
            self.ensure_assigned(partition)?;
            let (low, _high) = self.watermarks(partition)?;
            self.positions.insert(partition.clone(), low);
        }
        self.apply_positions()
    }

    fn seek_to_latest(
        &mut self,
        partitions: &BTreeSet<StreamPartition<i32>>,
    ) -> Result<(), SupplierError> {
        self.ensure_open()?;
        for partition in partitions {
            self.ensure_assigned(partition)?;
            let (_low, high) = self.watermarks(partition)?;
            self.positions.insert(partition.clone(), high);
        }
        self.apply_positions()
    }

    fn poll(&mut self, timeout: Duration) -> Vec<StreamRecord<i32, BrokerOffset>> {
        if self.closed {
            return Vec::new();
        }
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < MAX_RECORDS_PER_POLL {
            // Block for the caller's remaining budget only while empty-handed;
            // once something has arrived, drain whatever is ready and return.
            let wait = if out.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            if wait.is_zero() && out.is_empty() && Instant::now() >= deadline {
                break;
            }
            match self.consumer.poll(wait) {
                None => break,
                Some(Err(e)) => {
                    // Transient broker trouble never propagates to the
                    // caller; the next poll retries.
                    warn!("kafka error while polling: {}", e);
                    break;
                }
                Some(Ok(msg)) => {
                    let partition =
                        StreamPartition::new(msg.topic().to_owned(), msg.partition());
                    if !self.assignment.contains(&partition) {
                        continue;
                    }
                    let offset = msg.offset();
                    match self.positions.get(&partition) {
                        Some(expected) if offset < *expected => {
                            // Stale message delivered across a reassignment.
                            debug!(
                                %partition,
                                offset,
                                expected,
                                "skipping message before expected offset"
                            );
                            continue;
                        }
                        _ => {}
                    }
                    self.positions.insert(partition.clone(), offset + 1);
                    let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();
                    out.push(StreamRecord::new(
                        partition.stream,
                        partition.partition_id,
                        BrokerOffset(offset),
                        vec![payload],
                    ));
                }
            }
        }
        out
    }

    fn earliest_sequence_number(
        &mut self,
        partition: &StreamPartition<i32>,
    ) -> Result<BrokerOffset, SupplierError> {
        self.ensure_open()?;
        let (low, _high) = self.watermarks(partition)?;
        Ok(BrokerOffset(low))
    }

    fn latest_sequence_number(
        &mut self,
        partition: &StreamPartition<i32>,
    ) -> Result<BrokerOffset, SupplierError> {
        self.ensure_open()?;
        let (_low, high) = self.watermarks(partition)?;
        Ok(BrokerOffset(high))
    }

    fn partition_ids(&mut self, stream: &str) -> Result<BTreeSet<i32>, SupplierError> {
        self.ensure_open()?;
        let metadata = self
            .consumer
            .fetch_metadata(Some(stream), METADATA_TIMEOUT)
            .with_context(|| format!("fetching metadata for {stream}"))?;
        let topic_meta = metadata.topics().get(0).ok_or_else(|| {
            SupplierError::StreamNotFound {
                stream: stream.to_owned(),
            }
        })?;

        fn check_err(err: Option<RDKafkaRespErr>) -> Result<(), anyhow::Error> {
            if let Some(err) = err {
                Err(RDKafkaErrorCode::from(err))?
            }
            Ok(())
        }

        if let Some(RDKafkaRespErr::RD_KAFKA_RESP_ERR_UNKNOWN_TOPIC_OR_PART) = topic_meta.error() {
            return Err(SupplierError::StreamNotFound {
                stream: stream.to_owned(),
            });
        }
        check_err(topic_meta.error())?;

        let mut partition_ids = BTreeSet::new();
        for partition_meta in topic_meta.partitions() {
            check_err(partition_meta.error())?;
            partition_ids.insert(partition_meta.id());
        }
        if partition_ids.is_empty() {
            return Err(SupplierError::StreamNotFound {
                stream: stream.to_owned(),
            });
        }
        Ok(partition_ids)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.consumer.assign(&TopicPartitionList::new()) {
            debug!("ignoring unassign error during close: {}", e);
        }
    }
}

/// Builds the assignment list: every working-set partition, with an explicit
/// offset where one is tracked and `Offset::Invalid` (driver-side default)
/// where the partition has not been positioned yet.
fn build_assignment(
    assignment: &BTreeSet<StreamPartition<i32>>,
    positions: &HashMap<StreamPartition<i32>, i64>,
) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in assignment {
        let offset = match positions.get(partition) {
            Some(o) => Offset::Offset(*o),
            None => Offset::Invalid,
        };
        tpl.add_partition_offset(&partition.stream, partition.partition_id, offset)
            .expect("offset known to be valid");
    }
    tpl
}
