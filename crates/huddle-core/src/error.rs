use thiserror::Error;
use uuid::Uuid;

/// Local rejection of a draft or attachment. Never reaches the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message needs text or an attachment")]
    EmptyMessage,

    #[error("{name} is {size} bytes, the limit is {limit} bytes")]
    TooLarge { name: String, size: u64, limit: u64 },

    #[error("{name} is not an allowed file type (images, PDF, Word or plain text)")]
    UnsupportedType { name: String },
}

/// Failure reported by a [`ChatTransport`](crate::transport::ChatTransport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The result arrived for a channel that is no longer of interest.
    #[error("request for channel {channel_id} was cancelled")]
    Cancelled { channel_id: Uuid },

    #[error("channel {0} has no cached history yet")]
    ChannelNotLoaded(Uuid),

    #[error("message is not in the cache of channel {channel_id}")]
    UnknownMessage { channel_id: Uuid },
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(what) => Self::NotFound(what),
            TransportError::Network(msg) => Self::Network(msg),
            TransportError::Rejected { status, message } => {
                Self::Network(format!("status {}: {}", status, message))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
