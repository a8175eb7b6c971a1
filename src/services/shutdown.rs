use tokio::sync::watch;

/// Held by the binary; triggering it tells every [`ShutdownSignal`] to stop.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Cloned into every long-running loop that must stop cleanly.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn new_pair() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // Fails only when no signal is left to hear it.
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Resolves once shutdown was triggered, immediately if it already was.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|&stopped| stopped).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Wait for Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
                    _ = sigterm.recv() => tracing::info!("SIGTERM received"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("SIGINT received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_observed_after_trigger() {
        let (handle, mut signal) = new_pair();
        assert!(!signal.is_triggered());
        handle.trigger();
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert!(signal.is_triggered());
    }
}
