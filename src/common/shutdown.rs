//! # Shutdown Signalling
//!
//! Long-running loops block on sockets. Each loop races its socket call
//! against [`Shutdown::wait`] in a `tokio::select!`; when the trigger fires the
//! socket future is dropped and the loop returns, dropping (closing) the
//! socket itself. Loops that sleep between iterations race the sleep against
//! [`Shutdown::wait`] the same way.

use tokio::sync::watch;

/// Owner side of the stop flag.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Flip the stop flag. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener side of the stop flag, one per task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolve once the flag is set (or its owner is gone).
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let trigger = ShutdownTrigger::new();
        let mut shutdown = trigger.subscribe();

        let waiter = tokio::spawn(async move { shutdown.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        assert!(!trigger.is_triggered());
        trigger.trigger();

        let done = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(done, Ok(Ok(()))));
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn late_subscribers_see_the_flag() {
        let trigger = ShutdownTrigger::new();
        trigger.trigger();
        let mut shutdown = trigger.subscribe();
        let done = tokio::time::timeout(Duration::from_millis(100), shutdown.wait()).await;
        assert!(done.is_ok());
    }
}
