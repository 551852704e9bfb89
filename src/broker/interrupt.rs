//! Cooperative cancellation for the farm wait and readiness polling.

use std::future;
use std::sync::Arc;

use tokio::sync::watch;

/// Shared flag raised when the job is interrupted.
///
/// Clones observe the same flag. Raising is sticky.
#[derive(Clone, Debug)]
pub struct Interrupt {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    /// Creates a flag that is not raised.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Raises the flag, waking every waiter.
    pub fn raise(&self) {
        self.sender.send_modify(|flag| *flag = true);
    }

    /// Returns `true` once the flag has been raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes when the flag is raised.
    pub async fn raised(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|flag| *flag).await.is_err() {
            future::pending::<()>().await;
        }
    }
}
