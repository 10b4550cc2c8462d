use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-shot cancellation flag, checked at the two suspension points a
/// worker's poll loop has (post-lease, post-execution). Never used to
/// interrupt a running subprocess wait directly.
#[derive(Clone)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that waits for SIGINT/SIGTERM (Ctrl+C on Windows) and sets
/// `token` when one arrives. The worker loop itself only polls the token;
/// it never awaits the signal directly, so it stays free to finish a
/// subprocess wait uninterrupted.
pub fn install(token: ShutdownToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested, finishing current job before exit");
        token.set();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
