use thiserror::Error;

pub type QsResult<T> = Result<T, QsError>;

/// Errors surfaced by the codec, connection and scheduler layers.
#[derive(Debug, Error)]
pub enum QsError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("unknown stream id {0}")]
    UnknownStream(u32),

    #[error("endpoint closed")]
    EndpointClosed,

    #[error("connection refused by remote")]
    RemoteRefused,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
