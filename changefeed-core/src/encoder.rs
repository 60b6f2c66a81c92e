//! Row and timestamp encoding is owned upstream; sinks only consume this
//! interface to serialize resolved markers.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::Timestamp;

pub trait Encoder: Send + Sync {
    /// Serialize a resolved timestamp for `topic`. `topic` is empty when
    /// the destination has no per-topic resolved concept.
    fn encode_resolved_timestamp(&self, topic: &str, resolved: Timestamp) -> Result<Bytes>;
}

/// JSON resolved markers: `{"resolved":"<wall>.<logical>"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn encode_resolved_timestamp(&self, _topic: &str, resolved: Timestamp) -> Result<Bytes> {
        let payload = serde_json::json!({ "resolved": resolved.to_string() });
        let bytes = serde_json::to_vec(&payload).map_err(|e| Error::Encoder(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }
}
