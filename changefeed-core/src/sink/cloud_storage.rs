use std::collections::HashMap;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::{ENVELOPE_VALUE_ONLY, FORMAT_JSON, OPT_ENVELOPE, OPT_FORMAT};
use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::message::{Table, Timestamp, format_bucket};
use crate::sink::Sink;
use crate::storage::ExportStorage;

/// Buffer identity: one file per (bucket, topic, schema version). The sink
/// id and extension complete the filename but are fixed per instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileKey {
    bucket_ns: i64,
    topic: String,
    schema_version: u64,
}

/// Emits to files in object storage.
///
/// Rows buffer in memory per (bucket, topic, schema version) and become
/// files named `<bucket>-<topic>-<schema>-<sink_id><ext>` when a flush
/// passes the bucket. Resolved timestamps become `<bucket - 1ns>.RESOLVED`
/// markers, so a consumer iterating filenames lexicographically may treat
/// everything before a marker as final. Duplicate file contents across
/// flushes are allowed; losing an acknowledged row is not.
///
/// Within a file, rows are not sorted by timestamp. A duplicate of any row
/// may exist in another file or in the same file.
pub struct CloudStorageSink {
    base: Url,
    bucket_size: Duration,
    /// Distinguishes this instance's files from other writers sharing the
    /// prefix, including restarted incarnations of the same feed.
    sink_id: String,
    ext: &'static str,
    record_delim: u8,
    /// `None` once the sink is closed.
    files: Option<HashMap<FileKey, BytesMut>>,
    /// Largest `ts` ever flushed. Rows at or below it are duplicates from
    /// a previous incarnation and are dropped on emission.
    local_resolved: Timestamp,
}

impl CloudStorageSink {
    pub fn new(base: Url, bucket_size: Duration, opts: &HashMap<String, String>) -> Result<Self> {
        let format = opts.get(OPT_FORMAT).map(String::as_str).unwrap_or(FORMAT_JSON);
        let (ext, record_delim) = match format {
            FORMAT_JSON => (".ndjson", b'\n'),
            other => {
                return Err(Error::Config(format!(
                    "this sink is incompatible with {OPT_FORMAT}={other}"
                )));
            }
        };
        let envelope = opts
            .get(OPT_ENVELOPE)
            .map(String::as_str)
            .unwrap_or(ENVELOPE_VALUE_ONLY);
        if envelope != ENVELOPE_VALUE_ONLY {
            return Err(Error::Config(format!(
                "this sink is incompatible with {OPT_ENVELOPE}={envelope}"
            )));
        }

        // Sanity-check the destination before accepting rows.
        ExportStorage::from_uri(&base).map_err(Error::retryable)?;

        Ok(Self {
            base,
            bucket_size,
            sink_id: Uuid::new_v4().to_string(),
            ext,
            record_delim,
            files: Some(HashMap::new()),
            local_resolved: Timestamp::default(),
        })
    }

    fn filename(&self, key: &FileKey) -> String {
        format!(
            "{}-{}-{}-{}{}",
            format_bucket(key.bucket_ns),
            key.topic,
            key.schema_version,
            self.sink_id,
            self.ext
        )
    }
}

impl Sink for CloudStorageSink {
    async fn emit_row(
        &mut self,
        _cancel: CancellationToken,
        table: &Table,
        _key: Bytes,
        value: Bytes,
        updated: Timestamp,
    ) -> Result<()> {
        let Some(files) = self.files.as_mut() else {
            return Err(Error::Closed);
        };
        // Rows at or below the watermark were already delivered by a
        // previous incarnation of this sink.
        if updated <= self.local_resolved {
            return Ok(());
        }

        let key = FileKey {
            bucket_ns: updated.bucket_start(self.bucket_size),
            topic: table.name.clone(),
            schema_version: table.schema_version,
        };
        let file = files.entry(key).or_default();
        // TODO: bound the memory held by these buffers.
        file.extend_from_slice(&value);
        file.put_u8(self.record_delim);
        Ok(())
    }

    async fn emit_resolved_timestamp(
        &mut self,
        cancel: CancellationToken,
        encoder: &dyn Encoder,
        resolved: Timestamp,
    ) -> Result<()> {
        if self.files.is_none() {
            return Err(Error::Closed);
        }
        let payload = encoder.encode_resolved_timestamp("", resolved)?;

        // Resolving a timestamp means every file of the previous bucket is
        // final. One nanosecond before the bucket start places the marker
        // after that bucket's data files and before the current bucket's.
        let marker_ns = resolved.bucket_start(self.bucket_size) - 1;
        let name = format!("{}.RESOLVED", format_bucket(marker_ns));
        debug!(name, "writing resolved marker");

        let storage = ExportStorage::from_uri(&self.base)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = storage.write_file(&name, payload) => res,
        }
    }

    async fn flush(&mut self, cancel: CancellationToken, ts: Timestamp) -> Result<()> {
        let Some(files) = self.files.as_ref() else {
            return Err(Error::Closed);
        };
        if self.local_resolved < ts {
            self.local_resolved = ts;
        }

        // Buckets starting at or after ts may still receive rows and stay
        // buffered; everything earlier is written out now.
        let pending: Vec<(FileKey, Bytes)> = files
            .iter()
            .filter(|(key, _)| key.bucket_ns < ts.wall_ns)
            .map(|(key, file)| (key.clone(), Bytes::copy_from_slice(file)))
            .collect();

        let bucket_ns = self.bucket_size.as_nanos() as i64;
        let mut evict = Vec::new();
        for (key, contents) in pending {
            let name = self.filename(&key);
            debug!(name, bytes = contents.len(), "writing data file");
            let storage = ExportStorage::from_uri(&self.base)?;
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                res = storage.write_file(&name, contents) => res?,
            }
            // Once the bucket's right edge has passed, no unseen row can
            // land in it and the buffer can go. Until then it stays and
            // may be written again, contents included, on a later flush.
            if ts.wall_ns > key.bucket_ns + bucket_ns {
                evict.push(key);
            }
        }

        if let Some(files) = self.files.as_mut() {
            for key in &evict {
                files.remove(key);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.files = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::JsonEncoder;
    use tempfile::TempDir;

    const SECOND: i64 = 1_000_000_000;

    fn new_sink(dir: &TempDir) -> CloudStorageSink {
        let base = Url::parse(&format!("file://{}", dir.path().display())).expect("base url");
        CloudStorageSink::new(base, Duration::from_secs(1), &HashMap::new()).expect("construct")
    }

    fn listing(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    async fn emit(sink: &mut CloudStorageSink, topic: &str, value: &'static [u8], wall_ns: i64) {
        sink.emit_row(
            CancellationToken::new(),
            &Table::new(topic, 1),
            Bytes::new(),
            Bytes::from_static(value),
            Timestamp::new(wall_ns, 0),
        )
        .await
        .expect("emit");
    }

    #[tokio::test]
    async fn test_rows_bucket_by_wall_time() {
        let dir = TempDir::new().expect("tempdir");
        let mut sink = new_sink(&dir);

        emit(&mut sink, "t", b"a", SECOND - 1).await;
        emit(&mut sink, "t", b"b", SECOND).await;
        emit(&mut sink, "t", b"c", SECOND + SECOND / 2).await;

        let files = sink.files.as_ref().expect("open");
        assert_eq!(files.len(), 2);
        let first_bucket = files
            .get(&FileKey {
                bucket_ns: 0,
                topic: "t".to_string(),
                schema_version: 1,
            })
            .expect("bucket [0,1)");
        assert_eq!(first_bucket.as_ref(), b"a\n");
        let second_bucket = files
            .get(&FileKey {
                bucket_ns: SECOND,
                topic: "t".to_string(),
                schema_version: 1,
            })
            .expect("bucket [1,2)");
        assert_eq!(second_bucket.as_ref(), b"b\nc\n");
    }

    #[tokio::test]
    async fn test_resolved_marker_is_lexicographic_barrier() {
        let dir = TempDir::new().expect("tempdir");
        let mut sink = new_sink(&dir);
        let cancel = CancellationToken::new();

        emit(&mut sink, "t", b"r1", SECOND + 200_000_000).await;
        emit(&mut sink, "t", b"r2", SECOND + 800_000_000).await;
        emit(&mut sink, "t", b"r3", 2 * SECOND + 300_000_000).await;

        sink.flush(cancel.clone(), Timestamp::new(2 * SECOND, 0))
            .await
            .expect("flush");
        sink.emit_resolved_timestamp(cancel.clone(), &JsonEncoder, Timestamp::new(2 * SECOND, 0))
            .await
            .expect("emit resolved");
        sink.flush(cancel, Timestamp::new(3 * SECOND + 1, 0))
            .await
            .expect("second flush");

        let names = listing(&dir);
        assert_eq!(names.len(), 3);
        // Bucket [1,2) data, then the marker, then bucket [2,3) data.
        assert!(names[0].starts_with("19700101000001000000000-t-1-"));
        assert_eq!(names[1], "19700101000001999999999.RESOLVED");
        assert!(names[2].starts_with("19700101000002000000000-t-1-"));
    }

    #[tokio::test]
    async fn test_flush_skips_open_buckets_and_evicts_passed_ones() {
        let dir = TempDir::new().expect("tempdir");
        let mut sink = new_sink(&dir);
        let cancel = CancellationToken::new();

        emit(&mut sink, "t", b"old", SECOND / 2).await;
        emit(&mut sink, "t", b"new", 2 * SECOND + 1).await;

        // ts at the [2,3) boundary: bucket [0,1) is written and fully
        // passed (evicted); bucket [2,3) starts at ts and is not flushed.
        sink.flush(cancel, Timestamp::new(2 * SECOND, 0))
            .await
            .expect("flush");

        assert_eq!(listing(&dir).len(), 1);
        assert_eq!(sink.files.as_ref().expect("open").len(), 1);
    }

    #[tokio::test]
    async fn test_reflushed_bucket_rewrites_same_file() {
        let dir = TempDir::new().expect("tempdir");
        let mut sink = new_sink(&dir);
        let cancel = CancellationToken::new();

        emit(&mut sink, "t", b"a", SECOND / 4).await;
        // ts inside the bucket: written but not evicted.
        sink.flush(cancel.clone(), Timestamp::new(SECOND / 2, 0))
            .await
            .expect("first flush");

        emit(&mut sink, "t", b"b", (3 * SECOND) / 4).await;
        sink.flush(cancel, Timestamp::new(SECOND - 1, 0))
            .await
            .expect("second flush");

        let names = listing(&dir);
        assert_eq!(names.len(), 1);
        let contents = std::fs::read(dir.path().join(&names[0])).expect("read");
        assert_eq!(contents, b"a\nb\n");
    }

    #[tokio::test]
    async fn test_watermark_drops_already_resolved_rows() {
        let dir = TempDir::new().expect("tempdir");
        let mut sink = new_sink(&dir);

        sink.flush(CancellationToken::new(), Timestamp::new(5 * SECOND, 0))
            .await
            .expect("raise watermark");

        emit(&mut sink, "t", b"dup", 5 * SECOND - 100_000_000).await;
        assert!(sink.files.as_ref().expect("open").is_empty());

        emit(&mut sink, "t", b"fresh", 5 * SECOND + 100_000_000).await;
        assert_eq!(sink.files.as_ref().expect("open").len(), 1);
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let dir = TempDir::new().expect("tempdir");
        let mut sink = new_sink(&dir);
        let cancel = CancellationToken::new();

        sink.flush(cancel.clone(), Timestamp::new(5 * SECOND, 0))
            .await
            .expect("flush");
        sink.flush(cancel, Timestamp::new(3 * SECOND, 0))
            .await
            .expect("older flush");
        assert_eq!(sink.local_resolved, Timestamp::new(5 * SECOND, 0));
    }

    #[tokio::test]
    async fn test_schema_versions_get_separate_files() {
        let dir = TempDir::new().expect("tempdir");
        let mut sink = new_sink(&dir);
        let cancel = CancellationToken::new();

        sink.emit_row(
            cancel.clone(),
            &Table::new("t", 1),
            Bytes::new(),
            Bytes::from_static(b"v1"),
            Timestamp::new(SECOND / 4, 0),
        )
        .await
        .expect("emit v1");
        sink.emit_row(
            cancel.clone(),
            &Table::new("t", 2),
            Bytes::new(),
            Bytes::from_static(b"v2"),
            Timestamp::new(SECOND / 2, 0),
        )
        .await
        .expect("emit v2");

        sink.flush(cancel, Timestamp::new(2 * SECOND, 0))
            .await
            .expect("flush");
        let names = listing(&dir);
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.contains("-t-1-")));
        assert!(names.iter().any(|n| n.contains("-t-2-")));
    }

    #[tokio::test]
    async fn test_close_discards_buffers_and_stops_emissions() {
        let dir = TempDir::new().expect("tempdir");
        let mut sink = new_sink(&dir);
        let cancel = CancellationToken::new();

        emit(&mut sink, "t", b"a", SECOND / 2).await;
        sink.close().await.expect("close");
        sink.close().await.expect("close again");

        assert!(listing(&dir).is_empty());
        let err = sink
            .flush(cancel.clone(), Timestamp::new(SECOND, 0))
            .await
            .expect_err("flush after close");
        assert!(matches!(err, Error::Closed));
        let err = sink
            .emit_resolved_timestamp(cancel, &JsonEncoder, Timestamp::new(SECOND, 0))
            .await
            .expect_err("resolved after close");
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn test_invalid_format_or_envelope_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let base = Url::parse(&format!("file://{}", dir.path().display())).expect("url");

        let opts: HashMap<String, String> =
            [(OPT_FORMAT.to_string(), "avro".to_string())].into();
        assert!(CloudStorageSink::new(base.clone(), Duration::from_secs(1), &opts).is_err());

        let opts: HashMap<String, String> =
            [(OPT_ENVELOPE.to_string(), "key_only".to_string())].into();
        assert!(CloudStorageSink::new(base, Duration::from_secs(1), &opts).is_err());
    }
}
