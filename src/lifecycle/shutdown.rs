//! Shutdown coordination for the proxy.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks subscribe to, and
/// tracks their join handles so the process can wait for every background
/// task to exit before completing shutdown.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
    /// Set once the signal has fired, for loops that poll between retries.
    triggered: AtomicBool,
    /// Handles of background tasks spawned through this coordinator.
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// Whether the signal has already fired. Receivers subscribed after the
    /// fact never see the broadcast, so retry loops check this instead.
    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Spawn a named background task whose handle is joined on shutdown.
    ///
    /// The task is responsible for watching a subscribed receiver and exiting
    /// at its next loop boundary once the signal fires.
    pub fn spawn<F>(&self, name: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.tasks
            .lock()
            .expect("shutdown task registry poisoned")
            .push((name.to_string(), handle));
    }

    /// Wait for all spawned background tasks to exit.
    ///
    /// Call after `trigger()`. In-flight requests are not interrupted; only
    /// background loops are collected here.
    pub async fn join_all(&self) {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .expect("shutdown task registry poisoned"),
        );
        for (name, handle) in tasks {
            if handle.await.is_err() {
                tracing::error!(task = %name, "Background task panicked during shutdown");
            } else {
                tracing::debug!(task = %name, "Background task exited");
            }
        }
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
