//! Task-oriented wire dialect.
//!
//! Control flow: `run-task` -> `task-started` -> `continue-task` (text) ->
//! `finish-task` -> `task-finished` / `task-failed`. Audio arrives as raw
//! binary PCM frames at any point after `task-started`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use talkover_audio::AudioFrame;
use tracing::{debug, warn};

use super::{pcm16_from_le_bytes, OutputFormat};
use crate::config::{SynthesisSettings, VoiceConfig};
use crate::error::SynthesisError;
use crate::protocol::{ProtocolEvent, SynthesisProtocol};
use crate::transport::{DuplexTransport, WireMessage};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum TaskRequest<'a> {
    RunTask {
        model: &'a str,
        voice: &'a str,
        language: &'a str,
        output_format: OutputFormat,
    },
    ContinueTask {
        text: &'a str,
    },
    FinishTask,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum TaskEvent {
    TaskStarted,
    TaskFinished,
    TaskFailed {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

pub struct TaskProtocol {
    transport: Box<dyn DuplexTransport>,
    voice: VoiceConfig,
    sample_rate: u32,
    next_seq: u64,
}

impl TaskProtocol {
    pub fn new(transport: Box<dyn DuplexTransport>, settings: &SynthesisSettings) -> Self {
        Self {
            transport,
            voice: settings.voice.clone(),
            sample_rate: settings.sample_rate,
            next_seq: 0,
        }
    }

    async fn send(&mut self, request: &TaskRequest<'_>) -> Result<(), SynthesisError> {
        let json = serde_json::to_string(request)?;
        self.transport.send_text(json).await?;
        Ok(())
    }
}

#[async_trait]
impl SynthesisProtocol for TaskProtocol {
    async fn begin(&mut self) -> Result<(), SynthesisError> {
        let request = TaskRequest::RunTask {
            model: &self.voice.model,
            voice: &self.voice.voice_id,
            language: &self.voice.language,
            output_format: OutputFormat::pcm(self.sample_rate),
        };
        let json = serde_json::to_string(&request)?;
        self.transport.send_text(json).await?;
        Ok(())
    }

    async fn submit_text(&mut self, text: &str) -> Result<(), SynthesisError> {
        self.send(&TaskRequest::ContinueTask { text }).await
    }

    async fn finish(&mut self) -> Result<(), SynthesisError> {
        self.send(&TaskRequest::FinishTask).await
    }

    async fn next_event(&mut self) -> Result<ProtocolEvent, SynthesisError> {
        loop {
            match self.transport.next_message().await {
                Some(Ok(WireMessage::Binary(data))) => match pcm16_from_le_bytes(&data) {
                    Ok(samples) if samples.is_empty() => continue,
                    Ok(samples) => {
                        let frame = AudioFrame::new(samples, self.next_seq, self.sample_rate);
                        self.next_seq += 1;
                        return Ok(ProtocolEvent::Audio(frame));
                    }
                    Err(e) => {
                        warn!("Dropping undecodable audio frame: {}", e);
                        return Ok(ProtocolEvent::PayloadDropped);
                    }
                },
                Some(Ok(WireMessage::Text(text))) => match serde_json::from_str::<TaskEvent>(&text)
                {
                    Ok(TaskEvent::TaskStarted) => return Ok(ProtocolEvent::Ready),
                    Ok(TaskEvent::TaskFinished) => return Ok(ProtocolEvent::Finished),
                    Ok(TaskEvent::TaskFailed { message }) => {
                        return Err(SynthesisError::Protocol(message))
                    }
                    Ok(TaskEvent::Unknown) => {
                        debug!("Ignoring unknown control message: {}", text);
                    }
                    Err(e) => {
                        debug!("Ignoring unparseable control message: {}", e);
                    }
                },
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(ProtocolEvent::Closed),
            }
        }
    }

    async fn shutdown(&mut self) {
        self.transport.close().await;
    }
}
