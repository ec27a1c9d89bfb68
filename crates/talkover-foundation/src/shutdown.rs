use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;

/// One-shot process shutdown latch. `install` hooks Ctrl-C and panics, then
/// hands out the guard the runtime blocks on.
pub struct ShutdownHandler {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandler {
    pub fn new() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn install(self) -> ShutdownGuard {
        let requested = Arc::clone(&self.requested);
        let notify = Arc::clone(&self.notify);

        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown requested via Ctrl-C"),
                Err(e) => {
                    tracing::error!("Failed to install Ctrl-C handler: {}", e);
                    return;
                }
            }
            requested.store(true, Ordering::SeqCst);
            notify.notify_waiters();
        });

        // Panics must reach the log file as well as stderr; the default hook
        // keeps running afterwards.
        let original_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            tracing::error!("Panic: {}", panic_info);
            eprintln!("Talkover panicked: {}", panic_info);
            original_hook(panic_info);
        }));

        ShutdownGuard {
            requested: self.requested,
            notify: self.notify,
        }
    }
}

/// Waitable side of the latch. Waiters that arrive after the request return
/// immediately.
pub struct ShutdownGuard {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownGuard {
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        // Register interest before checking the flag so a request landing in
        // between is not lost.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Trip the latch from inside the process, e.g. after a fatal error.
    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_unblocks_waiters() {
        let guard = Arc::new(ShutdownHandler::new().install().await);
        let waiter = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move { guard.wait().await })
        };
        tokio::task::yield_now().await;
        guard.request_shutdown();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_returns_at_once_when_already_requested() {
        let guard = ShutdownHandler::new().install().await;
        guard.request_shutdown();
        assert!(guard.is_shutdown_requested());
        guard.wait().await;
    }
}
