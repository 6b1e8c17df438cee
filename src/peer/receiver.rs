use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Peer, PeerError};
use crate::context::Ctx;
use crate::messages::Msg;
use crate::types::Address;

// How many messages can be queued before producers block.
const RECEIVER_BUFFER_SIZE: usize = 16;

/// A bounded subscription sink over one or more peers.
///
/// Each subscription pairs a peer with a predicate; the peer enqueues every
/// matching message here. A receiver must only be consumed by one task at a
/// time.
pub struct Receiver {
    tx: mpsc::Sender<(Address, Msg)>,
    rx: Mutex<Option<mpsc::Receiver<(Address, Msg)>>>,
    closed: CancellationToken,
}

impl Receiver {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(RECEIVER_BUFFER_SIZE);
        Receiver {
            tx,
            rx: Mutex::new(Some(rx)),
            closed: CancellationToken::new(),
        }
    }

    pub fn subscribe<P>(&self, peer: &Arc<Peer>, predicate: P) -> Result<(), PeerError>
    where
        P: Fn(&Msg) -> bool + Send + Sync + 'static,
    {
        peer.subscribe(Box::new(predicate), self.tx.clone())
    }

    /// Dequeues the next message and its sender, or None once the context
    /// fires or the receiver is closed.
    pub async fn next(&self, ctx: &Ctx) -> Option<(Address, Msg)> {
        let mut guard = self.rx.lock().await;
        let rx = guard.as_mut()?;
        tokio::select! {
            _ = ctx.done() => None,
            _ = self.closed.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    /// Drops the queue so producers stop blocking on a full buffer.
    pub async fn close(&self) {
        self.closed.cancel();
        self.rx.lock().await.take();
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}
