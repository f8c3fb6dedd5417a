use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

pub type ShutdownCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Something that runs registered callbacks when the host shuts down.
///
/// A callback is invoked at most once, during orderly shutdown. Nothing runs
/// if the process is killed outright.
pub trait ShutdownCoordinator: Send + Sync {
    fn on_shutdown(&self, name: &str, callback: ShutdownCallback);
}

/// The host's shutdown sequence: traps SIGINT/SIGTERM, stops the HTTP
/// server through [`ShutdownHooks::token`] and then runs the callbacks in
/// registration order.
#[derive(Clone, Default)]
pub struct ShutdownHooks {
    inner: Arc<HooksInner>,
}

#[derive(Default)]
struct HooksInner {
    pending: Mutex<Vec<(String, ShutdownCallback)>>,
    // held while callbacks run so a second run() waits for the first
    running: tokio::sync::Mutex<()>,
    token: CancellationToken,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<(String, ShutdownCallback)>> {
        match self.inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Cancelled as soon as shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn pending(&self) -> usize {
        self.lock_pending().len()
    }

    /// Resolves on SIGINT, SIGTERM or an explicit cancellation of the token.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = self.inner.token.cancelled() => {}
        }
        self.inner.token.cancel();
    }

    /// Runs every registered callback once, in registration order. Callbacks
    /// already run are never invoked again, whether `run` is called twice or
    /// concurrently.
    pub async fn run(&self) {
        self.inner.token.cancel();
        let _running = self.inner.running.lock().await;

        let callbacks: Vec<_> = self.lock_pending().drain(..).collect();
        for (name, callback) in callbacks {
            tracing::info!(client = %name, "Lifecycle: running shutdown callback");
            callback().await;
        }
    }
}

impl ShutdownCoordinator for ShutdownHooks {
    fn on_shutdown(&self, name: &str, callback: ShutdownCallback) {
        if self.inner.token.is_cancelled() {
            tracing::warn!(
                client = %name,
                "Lifecycle: shutdown callback registered after shutdown began"
            );
        }
        self.lock_pending().push((name.to_string(), callback));
    }
}
