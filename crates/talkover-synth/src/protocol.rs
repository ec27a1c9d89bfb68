use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::timeout;

use talkover_audio::AudioFrame;

use crate::config::{ProtocolKind, SynthesisSettings};
use crate::dialect::realtime::RealtimeProtocol;
use crate::dialect::task::TaskProtocol;
use crate::error::{SynthesisError, TransportError};
use crate::transport::{TransportConnector, WsConnector};

/// One decoded happening on the wire, in playback terms.
#[derive(Debug, PartialEq)]
pub enum ProtocolEvent {
    /// Remote acknowledged readiness; text may now be submitted.
    Ready,
    /// One decoded frame of mono PCM, sequence-stamped by the dialect.
    Audio(AudioFrame),
    /// An audio payload arrived but could not be decoded. The frame is gone;
    /// the session keeps going.
    PayloadDropped,
    /// Remote signaled normal completion.
    Finished,
    /// Stream ended without a completion signal.
    Closed,
}

/// The shared contract both wire dialects implement. The session state
/// machine is written once against this.
#[async_trait]
pub trait SynthesisProtocol: Send {
    /// Send the initialization message carrying voice and model config.
    async fn begin(&mut self) -> Result<(), SynthesisError>;

    /// Submit the utterance text.
    async fn submit_text(&mut self, text: &str) -> Result<(), SynthesisError>;

    /// Declare that no more text is coming.
    async fn finish(&mut self) -> Result<(), SynthesisError>;

    /// Next event from the remote. Remote-reported failures surface as
    /// `Err(SynthesisError::Protocol)`; malformed payloads do not.
    async fn next_event(&mut self) -> Result<ProtocolEvent, SynthesisError>;

    /// Graceful close of the underlying transport.
    async fn shutdown(&mut self);
}

/// Connects a transport and wraps it in the dialect the settings select.
#[async_trait]
pub trait ProtocolFactory: Send + Sync {
    async fn connect(
        &self,
        settings: &SynthesisSettings,
    ) -> Result<Box<dyn SynthesisProtocol>, SynthesisError>;
}

pub struct WireProtocolFactory {
    connector: Arc<dyn TransportConnector>,
}

impl WireProtocolFactory {
    pub fn new() -> Self {
        Self {
            connector: Arc::new(WsConnector),
        }
    }

    /// Swap the connector; tests plug in scripted transports here.
    pub fn with_connector(connector: Arc<dyn TransportConnector>) -> Self {
        Self { connector }
    }
}

impl Default for WireProtocolFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolFactory for WireProtocolFactory {
    async fn connect(
        &self,
        settings: &SynthesisSettings,
    ) -> Result<Box<dyn SynthesisProtocol>, SynthesisError> {
        let bound = settings.connect_timeout();
        let transport = timeout(
            bound,
            self.connector
                .connect(&settings.endpoint, settings.bearer_token.as_deref()),
        )
        .await
        .map_err(|_| {
            SynthesisError::Connection(TransportError::Connect(format!(
                "Connect timed out after {:?}",
                bound
            )))
        })??;

        Ok(match settings.protocol {
            ProtocolKind::Task => Box::new(TaskProtocol::new(transport, settings)),
            ProtocolKind::Realtime => Box::new(RealtimeProtocol::new(transport, settings)),
        })
    }
}
