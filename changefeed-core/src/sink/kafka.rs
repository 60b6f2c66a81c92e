use bytes::Bytes;
use changefeed_kafka::sink::KafkaSink;
use tokio_util::sync::CancellationToken;

use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::message::{Table, Timestamp};
use crate::sink::Sink;

impl Sink for KafkaSink {
    async fn emit_row(
        &mut self,
        cancel: CancellationToken,
        table: &Table,
        key: Bytes,
        value: Bytes,
        _updated: Timestamp,
    ) -> Result<()> {
        KafkaSink::emit_row(self, &cancel, &table.name, key, value)
            .await
            .map_err(Error::from)
    }

    async fn emit_resolved_timestamp(
        &mut self,
        cancel: CancellationToken,
        encoder: &dyn Encoder,
        resolved: Timestamp,
    ) -> Result<()> {
        // Partition snapshots may be stale; a partition created since the
        // last refresh misses this marker and picks up a later one.
        self.refresh_metadata().await.map_err(Error::from)?;
        for topic in self.topic_names() {
            let payload = encoder.encode_resolved_timestamp(&topic, resolved)?;
            for partition in self.partition_snapshot(&topic) {
                self.emit_to_partition(&cancel, &topic, partition, payload.clone())
                    .await
                    .map_err(Error::from)?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self, cancel: CancellationToken, _ts: Timestamp) -> Result<()> {
        // Flushing everything necessarily flushes everything at or below
        // the requested timestamp.
        self.flush_inflight(&cancel).await.map_err(Error::from)
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown().await.map_err(Error::from)
    }
}
