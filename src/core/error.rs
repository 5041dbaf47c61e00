use thiserror::Error;

/// Errors that can occur anywhere below the connector boundary.
///
/// Every variant here is recovered inside the connector that produced it (see
/// `core::connector`); the engine never sees a per-message error, only the
/// absence of progress on a venue that gave up.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transport error talking to the venue. Origin error: {0}")]
    Transport(String),

    #[error("reqwest crate could not proceed with given data. Origin error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("serialization framework was unable to process entity. Origin serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("websocket error. Origin error: {0}")]
    WsError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("could not send canonical update to the engine's ingest task.")]
    DataTransmitError,

    #[error(
        "sequence gap detected: expected update continuing from {expected}, got first_id={got}"
    )]
    SequenceGap { expected: u64, got: u64 },

    #[error("snapshot sync failed: no buffered delta spans snapshot id {snapshot_id}")]
    SyncFailed { snapshot_id: u64 },

    #[error("venue rejected the subscription: {0}")]
    SubscriptionRejected(String),

    #[error("malformed frame from venue, dropped: {0}")]
    MalformedFrame(String),

    #[error("listener bind failed: {0}")]
    BindError(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
