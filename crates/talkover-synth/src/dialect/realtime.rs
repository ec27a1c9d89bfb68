//! Session-oriented realtime wire dialect.
//!
//! Control flow: `session.update` -> `session.created`/`session.updated` ->
//! `input_text_buffer.append` -> `session.finish` -> zero or more
//! `response.audio.delta` events (base64 PCM) -> `session.finished`. All
//! traffic including audio rides in JSON text frames.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use talkover_audio::AudioFrame;
use tracing::{debug, warn};

use super::{pcm16_from_le_bytes, OutputFormat};
use crate::config::{SynthesisSettings, VoiceConfig};
use crate::error::SynthesisError;
use crate::protocol::{ProtocolEvent, SynthesisProtocol};
use crate::transport::{DuplexTransport, WireMessage};

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum RealtimeRequest<'a> {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionParams<'a> },
    #[serde(rename = "input_text_buffer.append")]
    InputTextAppend { text: &'a str },
    #[serde(rename = "session.finish")]
    SessionFinish,
}

#[derive(Debug, Serialize)]
struct SessionParams<'a> {
    voice: &'a str,
    model: &'a str,
    language: &'a str,
    output_format: OutputFormat,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RealtimeEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "session.finished")]
    SessionFinished,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

pub struct RealtimeProtocol {
    transport: Box<dyn DuplexTransport>,
    voice: VoiceConfig,
    sample_rate: u32,
    next_seq: u64,
}

impl RealtimeProtocol {
    pub fn new(transport: Box<dyn DuplexTransport>, settings: &SynthesisSettings) -> Self {
        Self {
            transport,
            voice: settings.voice.clone(),
            sample_rate: settings.sample_rate,
            next_seq: 0,
        }
    }

    async fn send(&mut self, request: &RealtimeRequest<'_>) -> Result<(), SynthesisError> {
        let json = serde_json::to_string(request)?;
        self.transport.send_text(json).await?;
        Ok(())
    }

    fn decode_delta(delta: &str) -> Result<Vec<i16>, SynthesisError> {
        let bytes = BASE64
            .decode(delta)
            .map_err(|e| SynthesisError::Decode(format!("Invalid base64 delta: {}", e)))?;
        pcm16_from_le_bytes(&bytes)
    }
}

#[async_trait]
impl SynthesisProtocol for RealtimeProtocol {
    async fn begin(&mut self) -> Result<(), SynthesisError> {
        let request = RealtimeRequest::SessionUpdate {
            session: SessionParams {
                voice: &self.voice.voice_id,
                model: &self.voice.model,
                language: &self.voice.language,
                output_format: OutputFormat::pcm(self.sample_rate),
            },
        };
        let json = serde_json::to_string(&request)?;
        self.transport.send_text(json).await?;
        Ok(())
    }

    async fn submit_text(&mut self, text: &str) -> Result<(), SynthesisError> {
        self.send(&RealtimeRequest::InputTextAppend { text }).await
    }

    async fn finish(&mut self) -> Result<(), SynthesisError> {
        self.send(&RealtimeRequest::SessionFinish).await
    }

    async fn next_event(&mut self) -> Result<ProtocolEvent, SynthesisError> {
        loop {
            match self.transport.next_message().await {
                Some(Ok(WireMessage::Text(text))) => {
                    match serde_json::from_str::<RealtimeEvent>(&text) {
                        Ok(RealtimeEvent::SessionCreated | RealtimeEvent::SessionUpdated) => {
                            return Ok(ProtocolEvent::Ready)
                        }
                        Ok(RealtimeEvent::AudioDelta { delta }) => {
                            match Self::decode_delta(&delta) {
                                Ok(samples) if samples.is_empty() => continue,
                                Ok(samples) => {
                                    let frame =
                                        AudioFrame::new(samples, self.next_seq, self.sample_rate);
                                    self.next_seq += 1;
                                    return Ok(ProtocolEvent::Audio(frame));
                                }
                                Err(e) => {
                                    warn!("Dropping undecodable audio delta: {}", e);
                                    return Ok(ProtocolEvent::PayloadDropped);
                                }
                            }
                        }
                        Ok(RealtimeEvent::SessionFinished) => return Ok(ProtocolEvent::Finished),
                        Ok(RealtimeEvent::Error { message }) => {
                            return Err(SynthesisError::Protocol(message))
                        }
                        Ok(RealtimeEvent::Unknown) => {
                            debug!("Ignoring unknown event: {}", text);
                        }
                        Err(e) => {
                            debug!("Ignoring unparseable event: {}", e);
                        }
                    }
                }
                Some(Ok(WireMessage::Binary(_))) => {
                    // This dialect never sends binary frames.
                    debug!("Ignoring unexpected binary frame");
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(ProtocolEvent::Closed),
            }
        }
    }

    async fn shutdown(&mut self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_json_shape() {
        let request = RealtimeRequest::SessionUpdate {
            session: SessionParams {
                voice: "doctor-voice",
                model: "sonic-3",
                language: "en",
                output_format: OutputFormat::pcm(24_000),
            },
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["voice"], "doctor-voice");
        assert_eq!(value["session"]["output_format"]["sample_rate"], 24_000);
    }

    #[test]
    fn append_and_finish_json_shape() {
        let append =
            serde_json::to_string(&RealtimeRequest::InputTextAppend { text: "take two" }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&append).unwrap();
        assert_eq!(value["type"], "input_text_buffer.append");
        assert_eq!(value["text"], "take two");

        let finish = serde_json::to_string(&RealtimeRequest::SessionFinish).unwrap();
        let value: serde_json::Value = serde_json::from_str(&finish).unwrap();
        assert_eq!(value["type"], "session.finish");
    }

    #[test]
    fn parses_ready_events() {
        assert!(matches!(
            serde_json::from_str::<RealtimeEvent>(r#"{"type":"session.created"}"#).unwrap(),
            RealtimeEvent::SessionCreated
        ));
        assert!(matches!(
            serde_json::from_str::<RealtimeEvent>(r#"{"type":"session.updated"}"#).unwrap(),
            RealtimeEvent::SessionUpdated
        ));
    }

    #[test]
    fn decodes_base64_audio_delta() {
        // Samples [1, -2, 300] as little-endian bytes.
        let pcm: Vec<u8> = vec![0x01, 0x00, 0xFE, 0xFF, 0x2C, 0x01];
        let delta = BASE64.encode(&pcm);
        let json = format!(r#"{{"type":"response.audio.delta","delta":"{}"}}"#, delta);
        match serde_json::from_str::<RealtimeEvent>(&json).unwrap() {
            RealtimeEvent::AudioDelta { delta } => {
                assert_eq!(RealtimeProtocol::decode_delta(&delta).unwrap(), vec![1, -2, 300]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn invalid_base64_is_a_decode_error() {
        let err = RealtimeProtocol::decode_delta("@@not-base64@@").unwrap_err();
        assert!(matches!(err, SynthesisError::Decode(_)));
    }

    #[test]
    fn ancillary_event_types_fall_through() {
        assert!(matches!(
            serde_json::from_str::<RealtimeEvent>(
                r#"{"type":"response.text.delta","delta":"hi"}"#
            )
            .unwrap(),
            RealtimeEvent::Unknown
        ));
    }
}
