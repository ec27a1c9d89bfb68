//! Streaming speech synthesis over persistent duplex connections.
//!
//! A session submits one utterance to a remote synthesis service and decodes
//! the inbound audio stream into a playback ring buffer. Two wire dialects
//! are supported behind one protocol trait: a task-oriented dialect carrying
//! raw binary PCM, and a session-oriented realtime dialect carrying base64
//! audio deltas. Sessions are cancellable at any point; cancellation from a
//! barge-in must never block the caller.

pub mod config;
pub mod dialect;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::{ProtocolKind, SynthesisSettings, VoiceConfig};
pub use error::{SynthesisError, TransportError};
pub use protocol::{ProtocolEvent, ProtocolFactory, SynthesisProtocol, WireProtocolFactory};
pub use session::{
    PcmTee, SessionControl, SessionHandle, SessionOutcome, SessionState, SessionStats,
    SynthesisSession,
};
pub use transport::{DuplexTransport, TransportConnector, WireMessage, WsConnector};
