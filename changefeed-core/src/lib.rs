//! Delivery layer for changefeeds.
//!
//! Upstream streams row-level changes and periodic resolved timestamps;
//! the sinks here deliver them to Kafka, cloud storage, or the SQL/buffer
//! test destinations. `Flush` is the single synchronization point: once it
//! returns, every row emitted before it is accepted by the destination and
//! the caller may advance its durable watermark.

pub mod encoder;
pub mod message;
pub mod sink;
pub mod storage;

mod config;
mod error;

pub use crate::config::SinkConfig;
pub use crate::error::{Error, RETRYABLE_SINK_ERROR, Result, is_retryable};
pub use crate::sink::{ChangefeedSink, Sink, open_sink};
