//! Error types for chat-channel

use thiserror::Error;

/// Errors surfaced by the messaging channel.
///
/// None of these are fatal to the host process: validation and transmission
/// faults are recoverable by the caller, connection loss degrades to a
/// closed state that a new `connect` can leave.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The envelope failed structural validation and was never queued or sent.
    #[error("Invalid envelope: {0}")]
    Validation(String),

    /// The transport could not be established.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A write on an open channel failed. The envelope has been re-queued.
    #[error("Transmission failed: {0}")]
    Transmission(String),

    /// An inbound payload did not parse as an envelope.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failure_converts_to_decode() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err = ChannelError::from(parse_err);
        assert!(matches!(err, ChannelError::Decode(_)));
        assert!(err.to_string().starts_with("Decode error:"));
    }
}
