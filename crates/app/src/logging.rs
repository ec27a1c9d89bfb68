use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Install the global subscriber: stdout plus a daily-rolling file under
/// `logs/`, filtered by `RUST_LOG` (default `info`).
pub fn init() -> anyhow::Result<()> {
    std::fs::create_dir_all("logs")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "talkover.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.and(non_blocking_file))
        .with_env_filter(log_level)
        .init();
    // The worker guard must outlive every log call; the process owns it.
    std::mem::forget(guard);
    Ok(())
}
