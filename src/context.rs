//! Deadline-carrying cancellation contexts.
//!
//! Every potentially-blocking protocol operation takes a [Ctx]. Cancelling the
//! context (or reaching its deadline) aborts pending I/O; state-machine
//! mutations are rolled back before the error surfaces, never left half
//! applied.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Ctx {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Ctx {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Ctx {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Ctx {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derives a child context that is cancelled with its parent but may
    /// carry a tighter deadline.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Ctx {
            cancel: self.cancel.child_token(),
            deadline: Some(match self.deadline {
                Some(d) if d < deadline => d,
                _ => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes. Pends
    /// forever on a background context.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => (),
                _ = tokio::time::sleep_until(deadline) => (),
            },
            None => self.cancel.cancelled().await,
        }
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::background()
    }
}
