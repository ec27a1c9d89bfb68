use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use talkover_app::config::AppSettings;
use talkover_app::logging;
use talkover_app::orchestrator::PlaybackManager;
use talkover_app::runtime;
use talkover_foundation::ShutdownHandler;
use talkover_synth::{PcmTee, ProtocolKind, SessionOutcome};

#[derive(Parser)]
#[command(name = "talkover")]
#[command(version)]
#[command(about = "Streaming speech playback with voice-triggered barge-in")]
struct Cli {
    /// Optional TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Synthesis endpoint, e.g. wss://host/stream
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Bearer credential for the synthesis service
    #[arg(long, env = "TALKOVER_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Wire dialect to speak with the service
    #[arg(long, value_parser = ["task", "realtime"])]
    protocol: Option<String>,

    /// Voice identifier
    #[arg(long)]
    voice: Option<String>,

    /// Synthesis model
    #[arg(long)]
    model: Option<String>,

    /// Output device name; substring match
    #[arg(short = 'D', long)]
    output_device: Option<String>,

    /// Microphone device for barge-in detection; substring match
    #[arg(long)]
    input_device: Option<String>,

    /// Disable the microphone monitor and barge-in
    #[arg(long)]
    no_barge_in: bool,

    /// Speak one utterance and exit instead of reading stdin
    #[arg(short, long)]
    text: Option<String>,

    /// Also write decoded audio to a WAV file (a directory gets a
    /// timestamped name)
    #[arg(long)]
    save_wav: Option<PathBuf>,

    /// List audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.list_devices {
        list_devices();
        return Ok(());
    }

    logging::init()?;
    info!("Starting Talkover");

    let mut settings = AppSettings::load(cli.config.as_deref())?;
    apply_cli(&mut settings, &cli)?;
    if settings.synthesis.endpoint.is_empty() {
        bail!("No synthesis endpoint; pass --endpoint or set one in the settings file");
    }

    let shutdown = ShutdownHandler::new().install().await;
    let sample_rate = settings.synthesis.sample_rate;
    let handle = runtime::start(settings).await?;
    let manager = Arc::clone(&handle.manager);

    let wav_task = match cli.save_wav.as_deref() {
        Some(path) => Some(spawn_wav_capture(&manager, path, sample_rate)?),
        None => None,
    };

    if let Some(text) = cli.text.as_deref() {
        tokio::select! {
            outcome = manager.speak(text) => match outcome {
                Ok(outcome) => println!("{}", describe(&outcome)),
                Err(e) => println!("failed to start playback: {}", e),
            },
            _ = shutdown.wait() => info!("Interrupted before playback finished"),
        }
    } else {
        println!("Type a line to speak it; Ctrl-C to quit.");
        let metrics = manager.metrics();
        let mut stats_interval = tokio::time::interval(Duration::from_secs(30));
        stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        stats_interval.tick().await; // the first tick fires immediately
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = stats_interval.tick() => {
                    info!(
                        sessions = metrics.sessions_started.load(Ordering::Relaxed),
                        completed = metrics.sessions_completed.load(Ordering::Relaxed),
                        interrupted = metrics.sessions_interrupted.load(Ordering::Relaxed),
                        failed = metrics.sessions_failed.load(Ordering::Relaxed),
                        underruns = metrics.underruns.load(Ordering::Relaxed),
                        dropped_payloads = metrics.decode_errors.load(Ordering::Relaxed),
                        "Playback stats"
                    );
                }
                line = lines.next_line() => match line {
                    Ok(Some(text)) => {
                        let text = text.trim().to_string();
                        if text.is_empty() {
                            continue;
                        }
                        let speaker = Arc::clone(&manager);
                        tokio::spawn(async move {
                            match speaker.speak(&text).await {
                                Ok(outcome) => println!("{}", describe(&outcome)),
                                Err(e) => println!("failed to start playback: {}", e),
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        }
    }

    handle.shutdown().await;

    if let Some(task) = wav_task {
        manager.set_tee(None);
        drop(manager);
        if tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .is_err()
        {
            warn!("WAV capture did not finish in time");
        }
    }

    Ok(())
}

fn apply_cli(settings: &mut AppSettings, cli: &Cli) -> anyhow::Result<()> {
    if let Some(endpoint) = &cli.endpoint {
        settings.synthesis.endpoint = endpoint.clone();
    }
    if let Some(token) = &cli.token {
        settings.synthesis.bearer_token = Some(token.clone());
    }
    if let Some(protocol) = cli.protocol.as_deref() {
        settings.synthesis.protocol = match protocol {
            "task" => ProtocolKind::Task,
            "realtime" => ProtocolKind::Realtime,
            other => bail!("Unknown protocol '{}'", other),
        };
    }
    if let Some(voice) = &cli.voice {
        settings.synthesis.voice.voice_id = voice.clone();
    }
    if let Some(model) = &cli.model {
        settings.synthesis.voice.model = model.clone();
    }
    if let Some(device) = &cli.output_device {
        settings.playback.output_device = Some(device.clone());
    }
    if let Some(device) = &cli.input_device {
        settings.vad.device = Some(device.clone());
    }
    if cli.no_barge_in {
        settings.playback.barge_in = false;
    }
    Ok(())
}

fn describe(outcome: &SessionOutcome) -> String {
    match outcome {
        SessionOutcome::Completed(stats) => {
            let dropped = if stats.decode_errors > 0 {
                format!(", {} dropped payloads", stats.decode_errors)
            } else {
                String::new()
            };
            format!(
                "done: {} samples in {} ms (first audio after {} ms{})",
                stats.samples_decoded,
                stats.elapsed_ms,
                stats.first_audio_ms.unwrap_or(0),
                dropped
            )
        }
        SessionOutcome::Cancelled => "cancelled".to_string(),
        SessionOutcome::Failed(e) => format!("failed: {}", e),
    }
}

fn list_devices() {
    println!("Output devices:");
    for name in talkover_audio::device::output_device_names() {
        println!("  {}", name);
    }
    println!("Input devices:");
    for name in talkover_audio::device::input_device_names() {
        println!("  {}", name);
    }
}

/// Tee every decoded stream into a mono WAV file at the synthesis rate.
fn spawn_wav_capture(
    manager: &PlaybackManager,
    path: &Path,
    sample_rate: u32,
) -> anyhow::Result<JoinHandle<()>> {
    let path = resolve_wav_path(path);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec)
        .with_context(|| format!("Failed to create WAV file {}", path.display()))?;
    let (tee, mut chunks) = PcmTee::channel();
    manager.set_tee(Some(tee));
    info!(path = %path.display(), "Capturing decoded audio");

    Ok(tokio::spawn(async move {
        while let Some(chunk) = chunks.recv().await {
            for sample in chunk {
                if let Err(e) = writer.write_sample(sample) {
                    warn!("WAV capture write failed: {}", e);
                    return;
                }
            }
        }
        match writer.finalize() {
            Ok(()) => info!(path = %path.display(), "WAV capture written"),
            Err(e) => warn!("WAV capture finalize failed: {}", e),
        }
    }))
}

fn resolve_wav_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        path.join(format!("talkover-{}.wav", ts))
    } else {
        path.to_path_buf()
    }
}
