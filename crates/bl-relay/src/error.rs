use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Malformed entry on channel {channel}: {reason}")]
    MalformedEntry { channel: String, reason: String },

    #[error("Not accepting entries (not started or shutting down)")]
    NotAccepting,

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport setup error: {0}")]
    TransportSetup(String),

    #[error("Configuration error: {0}")]
    Config(#[from] bl_config::ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] bl_queue::QueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    pub fn malformed(channel: &str, reason: impl Into<String>) -> Self {
        RelayError::MalformedEntry {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }
}
