use std::collections::VecDeque;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::message::{Table, Timestamp};
use crate::sink::Sink;

/// One row captured by [BufferSink]. Fields unused by the row's kind stay
/// `None`: data rows carry topic/key/value, resolved rows only a value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedRow {
    pub resolved_span: Option<Bytes>,
    pub topic: Option<String>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

/// In-process sink: rows pile up in a FIFO that whoever drives the test
/// (or streams results back to the client) pops from.
#[derive(Debug, Default)]
pub struct BufferSink {
    buf: VecDeque<BufferedRow>,
    closed: bool,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&mut self) -> Option<BufferedRow> {
        self.buf.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Sink for BufferSink {
    async fn emit_row(
        &mut self,
        _cancel: CancellationToken,
        table: &Table,
        key: Bytes,
        value: Bytes,
        _updated: Timestamp,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.buf.push_back(BufferedRow {
            resolved_span: None,
            topic: Some(table.name.clone()),
            key: Some(key),
            value: Some(value),
        });
        Ok(())
    }

    async fn emit_resolved_timestamp(
        &mut self,
        _cancel: CancellationToken,
        encoder: &dyn Encoder,
        resolved: Timestamp,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let payload = encoder.encode_resolved_timestamp("", resolved)?;
        self.buf.push_back(BufferedRow {
            value: Some(payload),
            ..Default::default()
        });
        Ok(())
    }

    async fn flush(&mut self, _cancel: CancellationToken, _ts: Timestamp) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::JsonEncoder;

    #[tokio::test]
    async fn test_rows_pop_in_emission_order() {
        let mut sink = BufferSink::new();
        let cancel = CancellationToken::new();
        let table = Table::new("orders", 1);

        for value in [b"v1".as_slice(), b"v2"] {
            sink.emit_row(
                cancel.clone(),
                &table,
                Bytes::from_static(b"k"),
                Bytes::copy_from_slice(value),
                Timestamp::new(1, 0),
            )
            .await
            .expect("emit");
        }

        let first = sink.pop().expect("first");
        assert_eq!(first.topic.as_deref(), Some("orders"));
        assert_eq!(first.value.as_deref(), Some(b"v1".as_slice()));
        let second = sink.pop().expect("second");
        assert_eq!(second.value.as_deref(), Some(b"v2".as_slice()));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_resolved_row_has_only_value() {
        let mut sink = BufferSink::new();
        sink.emit_resolved_timestamp(
            CancellationToken::new(),
            &JsonEncoder,
            Timestamp::new(5, 0),
        )
        .await
        .expect("emit resolved");

        let row = sink.pop().expect("row");
        assert!(row.topic.is_none());
        assert!(row.key.is_none());
        assert!(row.resolved_span.is_none());
        assert!(row.value.is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_emissions() {
        let mut sink = BufferSink::new();
        let cancel = CancellationToken::new();
        sink.close().await.expect("close");
        sink.close().await.expect("close again");

        let err = sink
            .emit_row(
                cancel.clone(),
                &Table::new("t", 1),
                Bytes::new(),
                Bytes::new(),
                Timestamp::default(),
            )
            .await
            .expect_err("emit after close");
        assert!(matches!(err, Error::Closed));

        let err = sink
            .emit_resolved_timestamp(cancel, &JsonEncoder, Timestamp::default())
            .await
            .expect_err("emit resolved after close");
        assert!(matches!(err, Error::Closed));
    }
}
