//! Destination URI parsing.
//!
//! Everything here is pure validation: a [SinkConfig] is only produced
//! once the scheme is recognized, scheme-specific parameters are consumed,
//! and nothing unknown is left over. No external resource is touched until
//! the factory turns the config into a live sink.

use std::collections::BTreeMap;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const SINK_SCHEME_BUFFER: &str = "buffer";
pub const SINK_SCHEME_KAFKA: &str = "kafka";
pub const SINK_SCHEME_SQL: &str = "experimental-sql";
const SINK_SCHEME_CLOUD_PREFIX: &str = "experimental-";
const CLOUD_SCHEMES: &[&str] = &["s3", "gs", "nodelocal", "http", "https", "azure"];

pub const SINK_PARAM_TOPIC_PREFIX: &str = "topic_prefix";
pub const SINK_PARAM_SCHEMA_TOPIC: &str = "schema_topic";
pub const SINK_PARAM_BUCKET_SIZE: &str = "bucket_size";
/// Connection parameters the SQL sink forwards rather than consumes.
const SQL_PARAMS_FORWARDED: &[&str] = &["sslcert", "sslkey", "sslmode", "sslrootcert"];

pub const OPT_FORMAT: &str = "format";
pub const OPT_ENVELOPE: &str = "envelope";
pub const FORMAT_JSON: &str = "json";
pub const ENVELOPE_VALUE_ONLY: &str = "value_only";

/// A fully validated sink selection; `open_sink` turns it into a live sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkConfig {
    Buffer,
    Kafka {
        brokers: Vec<String>,
        topic_prefix: String,
    },
    CloudStorage {
        base: Url,
        bucket_size: Duration,
    },
    Sql {
        uri: Url,
    },
}

impl SinkConfig {
    pub fn from_uri(sink_uri: &str) -> Result<SinkConfig> {
        let url = Url::parse(sink_uri)
            .map_err(|e| Error::Config(format!("invalid sink URI {sink_uri}: {e}")))?;
        let mut params: BTreeMap<String, String> = url.query_pairs().into_owned().collect();

        let config = match url.scheme() {
            SINK_SCHEME_BUFFER => SinkConfig::Buffer,
            SINK_SCHEME_KAFKA => {
                let topic_prefix = params.remove(SINK_PARAM_TOPIC_PREFIX).unwrap_or_default();
                if let Some(schema_topic) = params.remove(SINK_PARAM_SCHEMA_TOPIC) {
                    if !schema_topic.is_empty() {
                        return Err(Error::Config(format!(
                            "{SINK_PARAM_SCHEMA_TOPIC} is not yet supported"
                        )));
                    }
                }
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::Config("kafka sink requires a broker address".into()))?;
                let broker = match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                SinkConfig::Kafka {
                    brokers: vec![broker],
                    topic_prefix,
                }
            }
            SINK_SCHEME_SQL => {
                for key in SQL_PARAMS_FORWARDED {
                    params.remove(*key);
                }
                // Swap the changefeed scheme for the connection one the
                // SQL client expects.
                let rest = &sink_uri[SINK_SCHEME_SQL.len()..];
                let uri = Url::parse(&format!("postgres{rest}"))
                    .map_err(|e| Error::Config(format!("invalid sink URI {sink_uri}: {e}")))?;
                if uri.path().is_empty() || uri.path() == "/" {
                    return Err(Error::Config("must specify database".into()));
                }
                SinkConfig::Sql { uri }
            }
            scheme
                if scheme
                    .strip_prefix(SINK_SCHEME_CLOUD_PREFIX)
                    .is_some_and(|s| CLOUD_SCHEMES.contains(&s)) =>
            {
                let bucket_size = params.remove(SINK_PARAM_BUCKET_SIZE).ok_or_else(|| {
                    Error::Config(format!("sink param {SINK_PARAM_BUCKET_SIZE} is required"))
                })?;
                let bucket_size = parse_duration(&bucket_size)?;
                let trimmed = &sink_uri[SINK_SCHEME_CLOUD_PREFIX.len()..];
                let mut base = Url::parse(trimmed)
                    .map_err(|e| Error::Config(format!("invalid sink URI {sink_uri}: {e}")))?;
                base.set_query(None);
                SinkConfig::CloudStorage { base, bucket_size }
            }
            other => return Err(Error::Config(format!("unsupported sink: {other}"))),
        };

        if let Some(key) = params.keys().next() {
            return Err(Error::Config(format!("unknown sink query parameter: {key}")));
        }
        Ok(config)
    }
}

/// Parse `30s`, `250ms`, `1m30s` style durations.
pub(crate) fn parse_duration(literal: &str) -> Result<Duration> {
    let bytes = literal.as_bytes();
    let mut idx = 0;
    let mut total_ns: u128 = 0;
    if literal.is_empty() {
        return Err(Error::Config("empty duration".into()));
    }
    while idx < bytes.len() {
        let start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        let value: u128 = literal[start..idx]
            .parse()
            .map_err(|_| Error::Config(format!("invalid duration {literal:?}")))?;
        let unit_start = idx;
        while idx < bytes.len() && !bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        let scale: u128 = match &literal[unit_start..idx] {
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            unit => {
                return Err(Error::Config(format!(
                    "invalid duration unit {unit:?} in {literal:?}"
                )));
            }
        };
        total_ns += value * scale;
    }
    if total_ns == 0 {
        return Err(Error::Config(format!(
            "duration must be positive: {literal:?}"
        )));
    }
    Ok(Duration::from_nanos(total_ns as u64))
}
