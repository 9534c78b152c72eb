//! Error types for univer-event-consumer

use thiserror::Error;

/// Failure to turn raw delivery bytes into an [`Envelope`](crate::types::Envelope)
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Bytes are not valid JSON or do not match the envelope shape
    #[error("Malformed envelope ({len} bytes): {source}")]
    Malformed {
        len: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Envelope parsed but the payload for its event type is absent
    #[error("Envelope ({len} bytes) of type '{event_type}' is missing its payload")]
    MissingPayload { len: usize, event_type: String },

    /// Change-set `type` field holds an unknown document kind
    #[error("Envelope ({len} bytes) has unknown document kind {kind}")]
    UnknownDocKind { len: usize, kind: i64 },
}

impl DecodeError {
    /// Length of the raw body that failed to decode
    pub fn len(&self) -> usize {
        match self {
            DecodeError::Malformed { len, .. }
            | DecodeError::MissingPayload { len, .. }
            | DecodeError::UnknownDocKind { len, .. } => *len,
        }
    }

    /// True if the offending body was empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors that can occur while consuming events
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Delivery body could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Connection or channel failure (network drop, broker restart)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Broker rejected a re-declare because parameters differ
    #[error("Configuration conflict on {resource}: {reason}")]
    ConfigurationConflict { resource: String, reason: String },

    /// An event handler reported failure
    #[error("Handler error: {0}")]
    Handler(String),

    /// Reconnect budget spent without re-establishing the subscription
    #[error("Gave up reconnecting after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Illegal lifecycle transition
    #[error("Invalid lifecycle transition from {from} to {to}")]
    Lifecycle { from: String, to: String },

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Acknowledgement failure
    #[error("Failed to acknowledge delivery: {0}")]
    Ack(String),

    /// A consumer task panicked outside handler dispatch
    #[error("Consumer task panicked: {0}")]
    Panicked(String),

    /// Shutdown requested before the operation completed
    #[error("Operation cancelled")]
    Cancelled,
}

impl ConsumerError {
    /// Whether the error ends the affected subscription
    ///
    /// Transport, ack, decode, and handler failures are recoverable;
    /// everything else terminates the subscription that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsumerError::ConfigurationConflict { .. }
                | ConsumerError::ReconnectExhausted { .. }
                | ConsumerError::Config(_)
                | ConsumerError::Lifecycle { .. }
                | ConsumerError::Panicked(_)
        )
    }

    /// Whether the error warrants tearing down the channel and reconnecting
    pub fn is_transport(&self) -> bool {
        matches!(self, ConsumerError::Transport(_) | ConsumerError::Ack(_))
    }
}

/// Result type alias for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;
