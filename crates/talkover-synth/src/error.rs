use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to open connection: {0}")]
    Connect(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed by remote")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Connection failed: {0}")]
    Connection(#[from] TransportError),

    #[error("Remote never acknowledged readiness within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Remote reported failure: {0}")]
    Protocol(String),

    #[error("Audio payload could not be decoded: {0}")]
    Decode(String),

    #[error("Failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Synthesis did not complete within {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_timeout_names_the_bound() {
        let err = SynthesisError::HandshakeTimeout(Duration::from_secs(3));
        assert!(format!("{}", err).contains("3s"));
    }

    #[test]
    fn transport_error_converts_to_connection() {
        let err: SynthesisError = TransportError::Closed.into();
        assert!(matches!(err, SynthesisError::Connection(_)));
    }

    #[test]
    fn protocol_error_carries_remote_message() {
        let err = SynthesisError::Protocol("voice not found".to_string());
        assert!(format!("{}", err).contains("voice not found"));
    }
}
