use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use changefeed_kafka::fnv1a_hash32;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::message::{Table, Timestamp};
use crate::sink::Sink;

const SQL_SINK_EMIT_COLS: usize = 6;
/// Some amount of batching, mirroring how the Kafka sink pipelines.
const SQL_SINK_ROW_BATCH_SIZE: usize = 3;
/// Small but greater than one, so partition-dependent behavior shows up.
const SQL_SINK_NUM_PARTITIONS: i32 = 3;

/// Low bits of a message id carry the partition; the rest is a
/// strictly-increasing clock reading.
const UNIQUE_INT_NODE_BITS: u32 = 15;

static LAST_UNIQUE_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Clock-derived unique ids, strictly increasing across calls. Generated
/// client-side to give the same guarantee the bus sink offers: order holds
/// between two emissions from the same sink to the same partition.
fn generate_unique_int(partition: i32) -> i64 {
    let wall = Utc::now().timestamp_millis();
    let prev = LAST_UNIQUE_MILLIS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(wall.max(last + 1))
        })
        .unwrap_or_else(|prev| prev);
    let ts = wall.max(prev + 1);
    (ts << UNIQUE_INT_NODE_BITS) | partition as i64
}

/// Partition assignment mirrors the Kafka key-hash scheme.
fn partition_for(key: &[u8]) -> i32 {
    let mut partition = (fnv1a_hash32(key) as i32) % SQL_SINK_NUM_PARTITIONS;
    if partition < 0 {
        partition = -partition;
    }
    partition
}

fn create_table_statement(table_name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table_name}\" (\n\
         \ttopic STRING,\n\
         \tpartition INT,\n\
         \tmessage_id INT,\n\
         \tkey BYTES, value BYTES,\n\
         \tresolved BYTES,\n\
         \tPRIMARY KEY (topic, partition, message_id)\n\
         )"
    )
}

fn build_insert_statement(table_name: &str, rows: usize) -> String {
    use std::fmt::Write;
    let mut stmt = format!(
        "INSERT INTO \"{table_name}\" (topic, partition, message_id, key, value, resolved) VALUES "
    );
    for row in 0..rows {
        if row > 0 {
            stmt.push_str(", ");
        }
        stmt.push('(');
        for col in 0..SQL_SINK_EMIT_COLS {
            if col > 0 {
                stmt.push(',');
            }
            let _ = write!(stmt, "${}", row * SQL_SINK_EMIT_COLS + col + 1);
        }
        stmt.push(')');
    }
    stmt
}

struct SqlRow {
    topic: String,
    partition: i64,
    message_id: i64,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    resolved: Option<Vec<u8>>,
}

/// Mirrors the bus sink's semantics as closely as a SQL table allows; used
/// only in tests. Every emitted row or resolved timestamp becomes a table
/// row; each topic gets a fixed number of synthetic partitions.
pub struct SqlSink {
    client: Client,
    connection: JoinHandle<()>,
    table_name: String,
    topics: HashSet<String>,
    row_buf: Vec<SqlRow>,
    closed: bool,
}

impl SqlSink {
    pub async fn connect(uri: Url, table_name: &str, targets: &[Table]) -> Result<SqlSink> {
        let (client, connection) = tokio_postgres::connect(uri.as_str(), NoTls).await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "sql sink connection terminated");
            }
        });
        client.batch_execute(&create_table_statement(table_name)).await?;

        Ok(SqlSink {
            client,
            connection,
            table_name: table_name.to_string(),
            topics: targets.iter().map(|t| t.name.clone()).collect(),
            row_buf: Vec::new(),
            closed: false,
        })
    }

    async fn emit(
        &mut self,
        cancel: &CancellationToken,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Option<Bytes>,
        resolved: Option<Bytes>,
    ) -> Result<()> {
        self.row_buf.push(SqlRow {
            topic: topic.to_string(),
            partition: partition as i64,
            message_id: generate_unique_int(partition),
            key: key.map(|b| b.to_vec()),
            value: value.map(|b| b.to_vec()),
            resolved: resolved.map(|b| b.to_vec()),
        });
        if self.row_buf.len() >= SQL_SINK_ROW_BATCH_SIZE {
            return self.flush_rows(cancel).await;
        }
        Ok(())
    }

    async fn flush_rows(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.row_buf.is_empty() {
            return Ok(());
        }
        let stmt = build_insert_statement(&self.table_name, self.row_buf.len());
        {
            let mut params: Vec<&(dyn ToSql + Sync)> =
                Vec::with_capacity(self.row_buf.len() * SQL_SINK_EMIT_COLS);
            for row in &self.row_buf {
                params.push(&row.topic);
                params.push(&row.partition);
                params.push(&row.message_id);
                params.push(&row.key);
                params.push(&row.value);
                params.push(&row.resolved);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                res = self.client.execute(stmt.as_str(), &params) => {
                    res?;
                }
            }
        }
        self.row_buf.clear();
        Ok(())
    }
}

impl Sink for SqlSink {
    async fn emit_row(
        &mut self,
        cancel: CancellationToken,
        table: &Table,
        key: Bytes,
        value: Bytes,
        _updated: Timestamp,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if !self.topics.contains(&table.name) {
            return Err(Error::UndeclaredTopic(table.name.clone()));
        }
        let partition = partition_for(&key);
        let topic = table.name.clone();
        self.emit(&cancel, &topic, partition, Some(key), Some(value), None)
            .await
    }

    async fn emit_resolved_timestamp(
        &mut self,
        cancel: CancellationToken,
        encoder: &dyn Encoder,
        resolved: Timestamp,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let topics: Vec<String> = self.topics.iter().cloned().collect();
        for topic in topics {
            let payload = encoder.encode_resolved_timestamp(&topic, resolved)?;
            for partition in 0..SQL_SINK_NUM_PARTITIONS {
                self.emit(&cancel, &topic, partition, None, None, Some(payload.clone()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self, cancel: CancellationToken, _ts: Timestamp) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.flush_rows(&cancel).await
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.connection.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable_and_in_range() {
        let first = partition_for(b"some-key");
        let second = partition_for(b"some-key");
        assert_eq!(first, second);
        assert!((0..SQL_SINK_NUM_PARTITIONS).contains(&first));
        for key in [b"a".as_slice(), b"b", b"c", b"dddddd"] {
            assert!((0..SQL_SINK_NUM_PARTITIONS).contains(&partition_for(key)));
        }
    }

    #[test]
    fn test_message_ids_strictly_increase() {
        let mut last = generate_unique_int(1);
        for _ in 0..1000 {
            let next = generate_unique_int(1);
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_message_id_carries_partition() {
        let mask = (1 << UNIQUE_INT_NODE_BITS) - 1;
        assert_eq!(generate_unique_int(2) & mask, 2);
        assert_eq!(generate_unique_int(0) & mask, 0);
    }

    #[test]
    fn test_build_insert_statement() {
        assert_eq!(
            build_insert_statement("sqlsink", 2),
            "INSERT INTO \"sqlsink\" (topic, partition, message_id, key, value, resolved) \
             VALUES ($1,$2,$3,$4,$5,$6), ($7,$8,$9,$10,$11,$12)"
        );
    }

    #[test]
    fn test_create_table_statement_shape() {
        let stmt = create_table_statement("sqlsink");
        assert!(stmt.starts_with("CREATE TABLE IF NOT EXISTS \"sqlsink\""));
        assert!(stmt.contains("PRIMARY KEY (topic, partition, message_id)"));
    }
}
