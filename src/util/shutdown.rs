//! Shutdown signalling shared by the watch loops and health checks.

use tokio::sync::broadcast;

/// Broadcasts a one-shot stop request to every subscribed task.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal manager.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_shutdown() {
        let signal = ShutdownSignal::new();
        let mut a = signal.subscribe();
        let mut b = signal.subscribe();

        signal.shutdown();
        signal.shutdown();

        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
