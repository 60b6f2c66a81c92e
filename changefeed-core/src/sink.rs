//! The sink contract and the factory that picks an implementation from a
//! destination URI.

use std::collections::HashMap;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::SinkConfig;
use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::message::{Table, Timestamp};

/// Keeps rows in an in-process FIFO, for tests.
#[path = "sink/buffer.rs"]
mod buffer;

/// Buffers rows per wall-time bucket and materializes files in object
/// storage, with `.RESOLVED` markers as the external completion barrier.
#[path = "sink/cloud_storage.rs"]
mod cloud_storage;

/// Adapts the Kafka producer wrapper to the sink contract.
#[path = "sink/kafka.rs"]
mod kafka;

/// Mirrors the Kafka sink's semantics into a SQL table, for tests.
#[path = "sink/sql.rs"]
mod sql;

pub use buffer::{BufferSink, BufferedRow};
pub use changefeed_kafka::sink::KafkaSink;
pub use cloud_storage::CloudStorageSink;
pub use sql::SqlSink;

/// Name of the table the SQL sink writes into.
const SQL_SINK_TABLE_NAME: &str = "sqlsink";

/// Anything a changefeed may emit into.
///
/// Emissions are asynchronous; `flush` is the only synchronization point.
/// Between two emissions to the same destination partition from the same
/// sink instance, order is preserved. Nothing else is promised.
#[trait_variant::make(Sink: Send)]
pub trait LocalSink {
    /// Enqueue a keyed row message on the topic derived from `table`.
    /// Fails if a previously enqueued message has failed and the failure
    /// has not yet been consumed by `flush`, or if the sink is closed.
    async fn emit_row(
        &mut self,
        cancel: CancellationToken,
        table: &Table,
        key: Bytes,
        value: Bytes,
        updated: Timestamp,
    ) -> Result<()>;

    /// Emit a resolved marker to every topic (and, where the destination
    /// has per-partition ordering, every partition).
    async fn emit_resolved_timestamp(
        &mut self,
        cancel: CancellationToken,
        encoder: &dyn Encoder,
        resolved: Timestamp,
    ) -> Result<()>;

    /// Block until every message enqueued so far is acknowledged. On
    /// success the caller may durably advance its watermark past `ts`; on
    /// error nothing is guaranteed about any in-flight message.
    async fn flush(&mut self, cancel: CancellationToken, ts: Timestamp) -> Result<()>;

    /// Release resources without flushing. Idempotent; later emissions
    /// fail.
    async fn close(&mut self) -> Result<()>;
}

/// A changefeed destination, selected by URI scheme.
pub enum ChangefeedSink {
    Buffer(BufferSink),
    Kafka(KafkaSink),
    CloudStorage(CloudStorageSink),
    Sql(SqlSink),
}

impl std::fmt::Debug for ChangefeedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            ChangefeedSink::Buffer(_) => "Buffer",
            ChangefeedSink::Kafka(_) => "Kafka",
            ChangefeedSink::CloudStorage(_) => "CloudStorage",
            ChangefeedSink::Sql(_) => "Sql",
        };
        f.debug_tuple(variant).finish()
    }
}

impl Sink for ChangefeedSink {
    async fn emit_row(
        &mut self,
        cancel: CancellationToken,
        table: &Table,
        key: Bytes,
        value: Bytes,
        updated: Timestamp,
    ) -> Result<()> {
        match self {
            ChangefeedSink::Buffer(sink) => {
                Sink::emit_row(sink, cancel, table, key, value, updated).await
            }
            ChangefeedSink::Kafka(sink) => {
                Sink::emit_row(sink, cancel, table, key, value, updated).await
            }
            ChangefeedSink::CloudStorage(sink) => {
                Sink::emit_row(sink, cancel, table, key, value, updated).await
            }
            ChangefeedSink::Sql(sink) => {
                Sink::emit_row(sink, cancel, table, key, value, updated).await
            }
        }
    }

    async fn emit_resolved_timestamp(
        &mut self,
        cancel: CancellationToken,
        encoder: &dyn Encoder,
        resolved: Timestamp,
    ) -> Result<()> {
        match self {
            ChangefeedSink::Buffer(sink) => {
                Sink::emit_resolved_timestamp(sink, cancel, encoder, resolved).await
            }
            ChangefeedSink::Kafka(sink) => {
                Sink::emit_resolved_timestamp(sink, cancel, encoder, resolved).await
            }
            ChangefeedSink::CloudStorage(sink) => {
                Sink::emit_resolved_timestamp(sink, cancel, encoder, resolved).await
            }
            ChangefeedSink::Sql(sink) => {
                Sink::emit_resolved_timestamp(sink, cancel, encoder, resolved).await
            }
        }
    }

    async fn flush(&mut self, cancel: CancellationToken, ts: Timestamp) -> Result<()> {
        match self {
            ChangefeedSink::Buffer(sink) => Sink::flush(sink, cancel, ts).await,
            ChangefeedSink::Kafka(sink) => Sink::flush(sink, cancel, ts).await,
            ChangefeedSink::CloudStorage(sink) => Sink::flush(sink, cancel, ts).await,
            ChangefeedSink::Sql(sink) => Sink::flush(sink, cancel, ts).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            ChangefeedSink::Buffer(sink) => Sink::close(sink).await,
            ChangefeedSink::Kafka(sink) => Sink::close(sink).await,
            ChangefeedSink::CloudStorage(sink) => Sink::close(sink).await,
            ChangefeedSink::Sql(sink) => Sink::close(sink).await,
        }
    }
}

/// Build a sink for `sink_uri`.
///
/// Parameter validation happens before any external connection is opened,
/// so an invalid URI never costs a half-constructed sink. Connection
/// failures to the bus or the object store come back wrapped as retryable;
/// everything else is fatal.
pub async fn open_sink(
    sink_uri: &str,
    opts: &HashMap<String, String>,
    targets: &[Table],
) -> Result<ChangefeedSink> {
    let config = SinkConfig::from_uri(sink_uri)?;
    match config {
        SinkConfig::Buffer => Ok(ChangefeedSink::Buffer(BufferSink::new())),
        SinkConfig::Kafka {
            brokers,
            topic_prefix,
        } => {
            let config = changefeed_kafka::KafkaSinkConfig {
                brokers,
                topic_prefix,
                table_names: targets.iter().map(|t| t.name.clone()).collect(),
            };
            let sink = changefeed_kafka::sink::new_sink(config)
                .await
                .map_err(Error::from)?;
            Ok(ChangefeedSink::Kafka(sink))
        }
        SinkConfig::CloudStorage { base, bucket_size } => Ok(ChangefeedSink::CloudStorage(
            CloudStorageSink::new(base, bucket_size, opts)?,
        )),
        SinkConfig::Sql { uri } => Ok(ChangefeedSink::Sql(
            SqlSink::connect(uri, SQL_SINK_TABLE_NAME, targets).await?,
        )),
    }
}
