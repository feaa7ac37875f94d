/// Graceful shutdown handling for the cloudq servers and background loops
use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown signal broadcaster
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Underlying sender, for components that subscribe themselves
    pub fn sender(&self) -> &broadcast::Sender<()> {
        &self.sender
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGINT or SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

/// Broadcast shutdown and wait up to `timeout` for `tasks` to finish
pub async fn drain(shutdown_signal: &ShutdownSignal, tasks: Vec<JoinHandle<()>>, timeout: Duration) {
    info!("Broadcasting shutdown signal to {} tasks", tasks.len());
    shutdown_signal.shutdown();

    let join_all = async {
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally during shutdown");
            }
        }
    };

    if tokio::time::timeout(timeout, join_all).await.is_err() {
        warn!(?timeout, "Tasks did not stop in time, exiting anyway");
    } else {
        info!("Shutdown complete");
    }
}

/// Wait for an OS signal, then drain `tasks`
pub async fn shutdown_with_timeout(
    shutdown_signal: ShutdownSignal,
    tasks: Vec<JoinHandle<()>>,
    timeout: Duration,
) {
    info!("Waiting for shutdown signal...");
    wait_for_signal().await;
    drain(&shutdown_signal, tasks, timeout).await;
}

/// Complete when shutdown is triggered
pub async fn shutdown_receiver(mut rx: broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}
