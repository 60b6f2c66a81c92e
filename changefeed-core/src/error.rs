use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable prefix of [Error::Retryable]'s rendering. Supervisors match on
/// this substring when the error has been flattened to text across a
/// process boundary; it must not change between versions.
pub const RETRYABLE_SINK_ERROR: &str = "retryable sink error";

#[derive(Error, Debug)]
pub enum Error {
    /// Transient infrastructure fault. The supervisor rebuilds the sink
    /// and replays from the last committed watermark instead of failing
    /// the changefeed.
    #[error("retryable sink error: {0}")]
    Retryable(#[source] Box<Error>),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Storage Error - {0}")]
    Storage(String),

    #[error("SQL Error - {0}")]
    Sql(String),

    #[error("Encoder Error - {0}")]
    Encoder(String),

    #[error("cannot emit to undeclared topic: {0}")]
    UndeclaredTopic(String),

    #[error("sink is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap an error as retryable. Already-retryable errors are returned
    /// as-is so chains never nest the sentinel.
    pub fn retryable(err: Error) -> Error {
        match err {
            Error::Retryable(_) => err,
            other => Error::Retryable(Box::new(other)),
        }
    }
}

/// True if `err` is [Error::Retryable] anywhere along its source chain, or
/// if a flattened (stringified) form of the sentinel is present. The
/// textual fallback is what keeps recognition working after the error has
/// crossed a serialization boundary.
pub fn is_retryable(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if matches!(e.downcast_ref::<Error>(), Some(Error::Retryable(_))) {
            return true;
        }
        cur = e.source();
    }
    err.to_string().contains(RETRYABLE_SINK_ERROR)
}

impl From<changefeed_kafka::Error> for Error {
    fn from(value: changefeed_kafka::Error) -> Self {
        use changefeed_kafka::Error as KafkaError;
        match value {
            KafkaError::UndeclaredTopic(topic) => Error::UndeclaredTopic(topic),
            KafkaError::Closed => Error::Closed,
            KafkaError::Cancelled => Error::Cancelled,
            // Connection and producer-origin failures are grounds for a
            // rebuild rather than a changefeed failure.
            other => Error::retryable(Error::Sink(other.to_string())),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(value: object_store::Error) -> Self {
        Error::Storage(value.to_string())
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(value: tokio_postgres::Error) -> Self {
        Error::Sql(value.to_string())
    }
}
