//! Kafka producer support for changefeeds: a pipelined sink with in-flight
//! accounting and a flush barrier, plus the key-hash partitioning scheme
//! shared with the other sinks.

pub mod sink;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("cannot emit to undeclared topic: {0}")]
    UndeclaredTopic(String),

    #[error("sink is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}

/// Configuration for the changefeed Kafka sink.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSinkConfig {
    pub brokers: Vec<String>,
    /// Prepended to every derived topic name.
    pub topic_prefix: String,
    /// Table names the sink may produce to. The topic set is closed at
    /// construction; emissions to anything else are rejected.
    pub table_names: Vec<String>,
}

/// Kafka topic names may only contain `[a-zA-Z0-9._-]`; every other
/// character of a SQL table name is replaced with `_`.
pub fn sql_name_to_kafka_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive the topic a table's rows are published under.
pub fn topic_name(prefix: &str, table_name: &str) -> String {
    format!("{prefix}{}", sql_name_to_kafka_name(table_name))
}

/// FNV-1a, 32 bit. Kept byte-compatible with the classic key-hash
/// partitioners so assignment is stable across restarts and languages.
#[inline]
pub fn fnv1a_hash32(data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x01000193;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Key-hash partition assignment over a partition-list snapshot.
///
/// Keyed messages hash to a stable slot in the snapshot: equal keys land on
/// equal partitions for as long as the snapshot holds. Keyless messages
/// (resolved markers) keep whatever partition the caller picked.
pub fn assign_partition(key: Option<&[u8]>, requested: i32, partitions: &[i32]) -> i32 {
    let Some(key) = key else {
        return requested;
    };
    if partitions.is_empty() {
        return requested;
    }
    let mut slot = (fnv1a_hash32(key) as i32) % (partitions.len() as i32);
    if slot < 0 {
        slot = -slot;
    }
    partitions[slot as usize]
}
