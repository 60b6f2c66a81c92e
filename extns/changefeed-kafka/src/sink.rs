use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use rdkafka::ClientConfig;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer, PurgeConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, KafkaSinkConfig, Result, assign_partition, topic_name};

/// Partition snapshots older than this are refreshed before a resolved
/// fan-out. Staleness only means brand-new partitions miss this marker and
/// pick up a later one.
const METADATA_REFRESH_MIN_INTERVAL: Duration = Duration::from_secs(60);
const METADATA_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry cadence while librdkafka's producer queue is full.
const QUEUE_FULL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Hard cap on messages buffered inside the producer.
const PRODUCER_QUEUE_MAX_MESSAGES: &str = "1000";

/// State shared between the emitting side and the delivery worker.
///
/// Invariant: `inflight` is the number of messages handed to the producer
/// whose delivery report has not been recorded yet. It is incremented
/// before the producer accepts a message and decremented exactly once per
/// outcome, so a flush may return only after it has observed zero (or a
/// latched error) since the flush began.
#[derive(Default)]
struct FlushState {
    inflight: i64,
    flush_err: Option<Error>,
    flush_tx: Option<oneshot::Sender<()>>,
}

impl FlushState {
    fn queued(&mut self) {
        self.inflight += 1;
    }

    /// Record one delivery outcome: decrement, latch the first error seen
    /// since the last flush, and fire the pending flush signal on the
    /// zero-crossing.
    fn settled(&mut self, err: Option<Error>) {
        self.inflight -= 1;
        if let Some(err) = err {
            if self.flush_err.is_none() {
                self.flush_err = Some(err);
            }
        }
        if self.inflight == 0 {
            if let Some(tx) = self.flush_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// Block until every message handed to the producer so far has been
/// acknowledged, or until a delivery failure has been latched. The sticky
/// error is consumed either way.
async fn wait_flushed(state: &Arc<Mutex<FlushState>>, cancel: &CancellationToken) -> Result<()> {
    let rx = {
        let mut state = state.lock();
        let err = state.flush_err.take();
        if state.inflight == 0 || err.is_some() {
            return match err {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        debug!(inflight = state.inflight, "flush waiting for in-flight messages");
        let (tx, rx) = oneshot::channel();
        state.flush_tx = Some(tx);
        rx
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = rx => {
            match state.lock().flush_err.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }
}

/// Consumes delivery reports from the producer, keeping the in-flight
/// accounting in [FlushState] current.
struct DeliveryWorker {
    deliveries: mpsc::Receiver<DeliveryFuture>,
    state: Arc<Mutex<FlushState>>,
    stop: CancellationToken,
}

impl DeliveryWorker {
    async fn run(mut self) {
        let mut pending = FuturesUnordered::new();
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                delivery = self.deliveries.recv() => match delivery {
                    Some(fut) => pending.push(fut),
                    None => {
                        // Producer handle dropped; settle what is left.
                        while let Some(outcome) = pending.next().await {
                            self.record(outcome);
                        }
                        return;
                    }
                },
                Some(outcome) = pending.next(), if !pending.is_empty() => {
                    self.record(outcome);
                }
            }
        }
    }

    fn record(&self, outcome: <DeliveryFuture as std::future::Future>::Output) {
        match outcome {
            Ok(Ok(_)) => self.state.lock().settled(None),
            Ok(Err((err, msg))) => {
                warn!(error = %err, topic = msg.topic(), "message delivery failed");
                self.state
                    .lock()
                    .settled(Some(Error::Kafka(err.to_string())));
            }
            Err(err) => {
                warn!(error = %err, "delivery report channel cancelled");
                self.state
                    .lock()
                    .settled(Some(Error::Kafka(err.to_string())));
            }
        }
    }
}

/// Asynchronous, pipelined Kafka sink.
///
/// Emissions enqueue on the producer and return; delivery outcomes are
/// drained by a background worker. All methods are meant to be called from
/// a single task; only the in-flight accounting is shared with the worker.
pub struct KafkaSink {
    producer: FutureProducer,
    brokers: String,
    topic_prefix: String,
    topics: HashSet<String>,
    partitions: HashMap<String, Vec<i32>>,
    last_metadata_refresh: Option<Instant>,
    state: Arc<Mutex<FlushState>>,
    deliveries: mpsc::Sender<DeliveryFuture>,
    stop: CancellationToken,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

/// Connect to the brokers and start the delivery worker. The initial
/// metadata fetch doubles as the connectivity check, so a bad address
/// fails here rather than on the first emission.
pub async fn new_sink(config: KafkaSinkConfig) -> Result<KafkaSink> {
    let brokers = config.brokers.join(",");
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        // Dispatch as soon as the link is idle; batching still happens
        // naturally while a request is in flight. Leaving time-or-size
        // batching on can park a message past any flush deadline.
        .set("linger.ms", "0")
        .set("queue.buffering.max.messages", PRODUCER_QUEUE_MAX_MESSAGES)
        .set("request.required.acks", "all")
        .set("client.id", "changefeed-kafka-sink")
        .set_log_level(RDKafkaLogLevel::Warning)
        .create()
        .map_err(|e| Error::Connection {
            server: brokers.clone(),
            error: e.to_string(),
        })?;

    let topics: HashSet<String> = config
        .table_names
        .iter()
        .map(|name| topic_name(&config.topic_prefix, name))
        .collect();

    let state = Arc::new(Mutex::new(FlushState::default()));
    let (deliveries_tx, deliveries_rx) = mpsc::channel(1024);
    let stop = CancellationToken::new();
    let worker = DeliveryWorker {
        deliveries: deliveries_rx,
        state: Arc::clone(&state),
        stop: stop.clone(),
    };
    let worker = tokio::spawn(worker.run());

    let mut sink = KafkaSink {
        producer,
        brokers,
        topic_prefix: config.topic_prefix,
        topics,
        partitions: HashMap::new(),
        last_metadata_refresh: None,
        state,
        deliveries: deliveries_tx,
        stop,
        worker: Some(worker),
        closed: false,
    };
    sink.force_refresh_metadata().await?;
    Ok(sink)
}

impl KafkaSink {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Declared topics, in no particular order.
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().cloned().collect()
    }

    /// The current partition snapshot for `topic`.
    pub fn partition_snapshot(&self, topic: &str) -> Vec<i32> {
        self.partitions.get(topic).cloned().unwrap_or_default()
    }

    /// Refresh the partition snapshots unless they were fetched recently.
    pub async fn refresh_metadata(&mut self) -> Result<()> {
        if let Some(at) = self.last_metadata_refresh {
            if at.elapsed() < METADATA_REFRESH_MIN_INTERVAL {
                return Ok(());
            }
        }
        self.force_refresh_metadata().await
    }

    async fn force_refresh_metadata(&mut self) -> Result<()> {
        let producer = self.producer.clone();
        let brokers = self.brokers.clone();
        let topics: Vec<String> = self.topics.iter().cloned().collect();
        // librdkafka's metadata call blocks the calling thread.
        let fetched = tokio::task::spawn_blocking(move || {
            let mut out = HashMap::with_capacity(topics.len());
            for topic in topics {
                let metadata = producer
                    .client()
                    .fetch_metadata(Some(&topic), METADATA_FETCH_TIMEOUT)
                    .map_err(|e| Error::Connection {
                        server: brokers.clone(),
                        error: e.to_string(),
                    })?;
                let partitions: Vec<i32> = metadata
                    .topics()
                    .iter()
                    .find(|t| t.name() == topic)
                    .map(|t| t.partitions().iter().map(|p| p.id()).collect())
                    .unwrap_or_default();
                if partitions.is_empty() {
                    return Err(Error::Kafka(format!("no partitions for topic {topic}")));
                }
                out.insert(topic, partitions);
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::Kafka(format!("metadata task failed: {e}")))??;

        self.partitions = fetched;
        self.last_metadata_refresh = Some(Instant::now());
        Ok(())
    }

    /// Enqueue a keyed row message on the topic derived from `table_name`.
    /// Returns once the producer has accepted the message; delivery is
    /// asynchronous and any failure surfaces at the next flush.
    pub async fn emit_row(
        &self,
        cancel: &CancellationToken,
        table_name: &str,
        key: Bytes,
        value: Bytes,
    ) -> Result<()> {
        self.check_open()?;
        let topic = topic_name(&self.topic_prefix, table_name);
        if !self.topics.contains(&topic) {
            return Err(Error::UndeclaredTopic(topic));
        }
        let partitions = self.partition_snapshot(&topic);
        if partitions.is_empty() {
            return Err(Error::Kafka(format!("no partitions for topic {topic}")));
        }
        let partition = assign_partition(Some(&key), -1, &partitions);
        self.produce(cancel, &topic, partition, Some(key), value)
            .await
    }

    /// Enqueue a keyless message addressed at one partition. Used for the
    /// resolved-timestamp fan-out, which targets every known partition.
    pub async fn emit_to_partition(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        partition: i32,
        payload: Bytes,
    ) -> Result<()> {
        self.check_open()?;
        if !self.topics.contains(topic) {
            return Err(Error::UndeclaredTopic(topic.to_string()));
        }
        self.produce(cancel, topic, partition, None, payload).await
    }

    async fn produce(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<()> {
        self.state.lock().queued();

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic)
            .partition(partition)
            .payload(value.as_ref());
        if let Some(key) = key.as_deref() {
            record = record.key(key);
        }

        let delivery = loop {
            match self.producer.send_result(record) {
                Ok(fut) => break fut,
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    record = returned;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(QUEUE_FULL_RETRY_INTERVAL) => {}
                    }
                }
                Err((err, _)) => {
                    // The producer rejected the message outright, so no
                    // delivery report will follow; settle the accounting
                    // here and let the next flush surface the error.
                    self.state.lock().settled(Some(Error::Kafka(err.to_string())));
                    return Ok(());
                }
            }
        };

        if self.deliveries.send(delivery).await.is_err() {
            return Err(Error::Kafka("delivery worker terminated".to_string()));
        }
        Ok(())
    }

    /// Block until every enqueued message has been acknowledged, or return
    /// the first delivery error latched since the previous flush.
    pub async fn flush_inflight(&self, cancel: &CancellationToken) -> Result<()> {
        self.check_open()?;
        wait_flushed(&self.state, cancel).await
    }

    /// Stop the delivery worker and abandon outstanding messages. Delivery
    /// of anything still buffered is not guaranteed.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        self.stop.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        self.producer
            .purge(PurgeConfig::default().queue().inflight());
        Ok(())
    }
}
