//! Runtime assembly: playback manager plus the voice monitor that triggers
//! barge-in, with ordered startup and shutdown.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use talkover_foundation::{AppState, StateManager};
use talkover_vad::{VadEvent, VoiceMonitor};

use crate::config::AppSettings;
use crate::orchestrator::PlaybackManager;

/// Handle to the running application.
pub struct AppHandle {
    pub manager: Arc<PlaybackManager>,
    pub state: StateManager,
    monitor: Option<VoiceMonitor>,
    barge_in_handle: Option<JoinHandle<()>>,
}

/// Start the playback pipeline. When barge-in is enabled the microphone
/// monitor starts immediately and any detected speech interrupts playback.
pub async fn start(settings: AppSettings) -> anyhow::Result<AppHandle> {
    let state = StateManager::new();
    let manager = Arc::new(PlaybackManager::new(
        settings.synthesis.clone(),
        settings.playback.clone(),
    ));
    manager.set_on_error(|err| warn!(error = %err, "Voice reply failed; falling back to text"));

    let (monitor, barge_in_handle) = if settings.playback.barge_in {
        let mut monitor = VoiceMonitor::new(settings.vad.clone());
        monitor.start()?;
        let handle = spawn_barge_in(Arc::clone(&manager), monitor.subscribe());
        info!("Barge-in monitor started");
        (Some(monitor), Some(handle))
    } else {
        (None, None)
    };

    state.transition(AppState::Running)?;
    Ok(AppHandle {
        manager,
        state,
        monitor,
        barge_in_handle,
    })
}

/// Forward voice events to the playback manager until the sending side goes
/// away. A `VoiceStart` is the barge-in trigger; everything else is logged.
pub fn spawn_barge_in(
    manager: Arc<PlaybackManager>,
    mut events: broadcast::Receiver<VadEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(VadEvent::VoiceStart { energy_db }) => {
                    info!(energy_db, "Voice detected; interrupting playback");
                    manager.interrupt();
                }
                Ok(VadEvent::VoiceStop { voiced_ms }) => {
                    info!(voiced_ms, "Voice ended");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Voice event listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

impl AppHandle {
    /// Ordered teardown: monitor first so a dying capture stream cannot fire
    /// a late interrupt, then the live playback, then the listener task.
    pub async fn shutdown(mut self) {
        info!("Shutting down Talkover runtime");
        let _ = self.state.transition(AppState::Stopping);

        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
        self.manager.stop();

        if let Some(handle) = self.barge_in_handle.take() {
            handle.abort();
            let _ = handle.await;
        }

        let _ = self.state.transition(AppState::Stopped);
        info!("Shutdown complete");
    }
}
