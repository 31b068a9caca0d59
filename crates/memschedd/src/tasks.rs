use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use memsched::{Regulator, ThrottleGate};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// Background tasks of the daemon, stopped together on shutdown.
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Periodically writes every unit's statistics to the metrics target.
    pub fn spawn_metrics_task<G: ThrottleGate + 'static>(
        &mut self,
        regulator: Arc<Regulator<G>>,
        interval: Duration,
        node_name: String,
    ) {
        let token = self.cancellation_token.clone();
        let task = tokio::spawn(async move {
            tracing::info!("Starting metrics task");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = metrics::current_time();
                        for snapshot in regulator.snapshot() {
                            if !snapshot.regulated {
                                continue;
                            }
                            let line = metrics::encode_unit(&snapshot, &node_name, now);
                            tracing::info!(target: "metrics.memsched_unit", msg = %line);
                        }
                    }
                    _ = token.cancelled() => {
                        tracing::info!("Metrics task cancelled");
                        break;
                    }
                }
            }
        });
        self.tasks.push(task);
    }

    /// Waits for a shutdown signal or for any task to end on its own.
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        if self.tasks.is_empty() {
            let _ = signal_handler.await;
            return Ok(());
        }

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.shutdown(Duration::from_secs(5)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    /// Cancels every task and waits up to `timeout` for them to finish.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.cancellation_token.cancel();
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}
