//! Peers: authenticated links to remote clients, with predicate-based
//! message subscriptions, and the registry coordinating them.

mod broadcaster;
mod identity;
mod receiver;
mod registry;

pub use broadcaster::Broadcaster;
pub use identity::{exchange_addrs, AuthError};
pub use receiver::Receiver;
pub use registry::{Registry, RegistryError};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::Ctx;
use crate::messages::Msg;
use crate::types::Address;
use crate::wire::{Conn, TransportError};

pub(crate) type Predicate = Box<dyn Fn(&Msg) -> bool + Send + Sync>;
type DefaultHandler = Arc<dyn Fn(Msg) + Send + Sync>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer closed")]
    Closed,
    #[error("peer already closed")]
    AlreadyClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Connecting,
    Open,
    Closed,
}

struct Subscription {
    id: u64,
    predicate: Predicate,
    tx: mpsc::Sender<(Address, Msg)>,
}

/// An authenticated link to a remote client.
///
/// A peer is created either with a live connection (inbound accept) or as a
/// placeholder for an in-flight dial; [Peer::create] fills the placeholder
/// exactly once and starts the receive loop. Inbound messages go to the
/// first subscription whose predicate matches, with bounded queues applying
/// back-pressure; unmatched messages go to the default handler.
pub struct Peer {
    addr: Address,
    conn: StdMutex<Option<Arc<Conn>>>,
    subs: StdMutex<Vec<Subscription>>,
    next_sub_id: AtomicU64,
    default_handler: StdMutex<DefaultHandler>,
    state: watch::Sender<PeerState>,
    shutdown: CancellationToken,
}

impl Peer {
    pub(crate) fn new(addr: Address, conn: Option<Conn>) -> Arc<Peer> {
        let peer = Arc::new(Peer {
            addr,
            conn: StdMutex::new(None),
            subs: StdMutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(0),
            default_handler: StdMutex::new(Arc::new(move |msg| {
                debug!(peer = %addr, tag = ?msg.tag(), "message without subscription");
            })),
            state: watch::Sender::new(PeerState::Connecting),
            shutdown: CancellationToken::new(),
        });
        if let Some(conn) = conn {
            peer.create(conn);
        }
        peer
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    /// Attaches a connection to a placeholder peer and starts receiving.
    /// Returns false (dropping `conn`) if the peer already has a connection
    /// or is closed.
    pub(crate) fn create(self: &Arc<Self>, conn: Conn) -> bool {
        let conn = {
            let mut slot = self.conn.lock().unwrap();
            if slot.is_some() || *self.state.borrow() == PeerState::Closed {
                return false;
            }
            let conn = Arc::new(conn);
            *slot = Some(conn.clone());
            conn
        };

        self.state.send_replace(PeerState::Open);
        let peer = Arc::clone(self);
        tokio::spawn(async move { peer.recv_loop(conn).await });
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.state.borrow() == PeerState::Closed
    }

    pub(crate) fn has_conn(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }

    /// Waits until the peer has a live connection.
    pub(crate) async fn wait_open(&self, ctx: &Ctx) -> Result<(), PeerError> {
        let mut state = self.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                PeerState::Open => return Ok(()),
                PeerState::Closed => return Err(PeerError::Closed),
                PeerState::Connecting => {}
            }
            tokio::select! {
                _ = ctx.done() => return Err(TransportError::Expired.into()),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(PeerError::Closed);
                    }
                }
            }
        }
    }

    /// Sends a message; sends on one peer are serialized by the connection.
    pub async fn send(&self, ctx: &Ctx, msg: Msg) -> Result<(), PeerError> {
        self.wait_open(ctx).await?;
        let conn = self
            .conn
            .lock()
            .unwrap()
            .clone()
            .ok_or(PeerError::Closed)?;

        tokio::select! {
            _ = ctx.done() => Err(TransportError::Expired.into()),
            res = conn.send(&msg) => res.map_err(PeerError::from),
        }
    }

    pub(crate) fn subscribe(
        &self,
        predicate: Predicate,
        tx: mpsc::Sender<(Address, Msg)>,
    ) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().unwrap().push(Subscription { id, predicate, tx });
        Ok(())
    }

    /// Runs for every message no subscription predicate matched.
    pub fn set_default_handler<F>(&self, handler: F)
    where
        F: Fn(Msg) + Send + Sync + 'static,
    {
        *self.default_handler.lock().unwrap() = Arc::new(handler);
    }

    /// Closes the peer exactly once; a second close is an error. A failing
    /// connection close is propagated.
    pub async fn close(&self) -> Result<(), PeerError> {
        if self.state.send_replace(PeerState::Closed) == PeerState::Closed {
            return Err(PeerError::AlreadyClosed);
        }
        self.shutdown.cancel();
        let conn = self.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            conn.close().await?;
        }
        Ok(())
    }

    async fn recv_loop(self: Arc<Self>, conn: Arc<Conn>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                res = conn.recv() => match res {
                    Ok(msg) => self.dispatch(msg).await,
                    Err(err) => {
                        debug!(peer = %self.addr, error = %err, "receive loop terminated");
                        self.close_on_error().await;
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, msg: Msg) {
        let matched = {
            let subs = self.subs.lock().unwrap();
            subs.iter()
                .find(|s| (s.predicate)(&msg))
                .map(|s| (s.id, s.tx.clone()))
        };

        match matched {
            Some((id, tx)) => {
                // Blocks when the receiver's queue is full; a dead receiver
                // drops the message and its subscription.
                if tx.send((self.addr, msg)).await.is_err() {
                    self.subs.lock().unwrap().retain(|s| s.id != id);
                }
            }
            None => {
                let handler = self.default_handler.lock().unwrap().clone();
                handler(msg);
            }
        }
    }

    async fn close_on_error(&self) {
        if self.state.send_replace(PeerState::Closed) == PeerState::Closed {
            return;
        }
        self.shutdown.cancel();
        let conn = self.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            let _ = conn.close().await;
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::AuthResponse;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::time::Duration;

    fn peer_pair(rng: &mut StdRng) -> (Arc<Peer>, Arc<Peer>) {
        let (a, b) = tokio::io::duplex(4096);
        (
            Peer::new(rng.gen(), Some(Conn::new(a))),
            Peer::new(rng.gen(), Some(Conn::new(b))),
        )
    }

    fn ctx() -> Ctx {
        Ctx::with_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn subscription_receives_matching_messages() {
        let mut rng = StdRng::seed_from_u64(50);
        let (a, b) = peer_pair(&mut rng);

        let rec = Receiver::new();
        rec.subscribe(&b, |m| matches!(m, Msg::Ping)).unwrap();

        a.send(&ctx(), Msg::Ping).await.unwrap();
        let (from, msg) = rec.next(&ctx()).await.unwrap();
        assert_eq!(from, b.addr());
        assert_eq!(msg, Msg::Ping);
    }

    #[tokio::test]
    async fn first_matching_subscription_wins() {
        let mut rng = StdRng::seed_from_u64(51);
        let (a, b) = peer_pair(&mut rng);

        let first = Receiver::new();
        let second = Receiver::new();
        first.subscribe(&b, |m| matches!(m, Msg::Ping)).unwrap();
        second.subscribe(&b, |m| matches!(m, Msg::Ping)).unwrap();

        a.send(&ctx(), Msg::Ping).await.unwrap();
        assert!(first.next(&ctx()).await.is_some());
        assert!(second
            .next(&Ctx::with_timeout(Duration::from_millis(50)))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn unmatched_messages_hit_default_handler() {
        let mut rng = StdRng::seed_from_u64(52);
        let (a, b) = peer_pair(&mut rng);

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_default_handler(move |msg| {
            let _ = tx.send(msg);
        });

        let rec = Receiver::new();
        rec.subscribe(&b, |m| matches!(m, Msg::Ping)).unwrap();

        a.send(&ctx(), Msg::Pong).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Msg::Pong);
    }

    #[tokio::test]
    async fn per_peer_order_is_preserved() {
        let mut rng = StdRng::seed_from_u64(53);
        let (a, b) = peer_pair(&mut rng);

        let rec = Receiver::new();
        rec.subscribe(&b, |m| matches!(m, Msg::AuthResponse(_)))
            .unwrap();

        let addrs: Vec<Address> = (0..8).map(|_| rng.gen()).collect();
        for addr in &addrs {
            a.send(&ctx(), Msg::AuthResponse(AuthResponse { addr: *addr }))
                .await
                .unwrap();
        }
        for addr in &addrs {
            let (_, msg) = rec.next(&ctx()).await.unwrap();
            assert_eq!(msg, Msg::AuthResponse(AuthResponse { addr: *addr }));
        }
    }

    #[tokio::test]
    async fn double_close_is_an_error() {
        let mut rng = StdRng::seed_from_u64(54);
        let (a, _b) = peer_pair(&mut rng);

        a.close().await.unwrap();
        assert!(matches!(a.close().await, Err(PeerError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let mut rng = StdRng::seed_from_u64(55);
        let (a, _b) = peer_pair(&mut rng);

        a.close().await.unwrap();
        assert!(a.send(&ctx(), Msg::Ping).await.is_err());
    }

    #[tokio::test]
    async fn create_fills_placeholder_once() {
        let mut rng = StdRng::seed_from_u64(56);
        let addr = rng.gen();
        let placeholder = Peer::new(addr, None);
        assert!(!placeholder.has_conn());

        let (x, _y) = tokio::io::duplex(64);
        let (x2, _y2) = tokio::io::duplex(64);
        assert!(placeholder.create(Conn::new(x)));
        assert!(!placeholder.create(Conn::new(x2)));
        placeholder.wait_open(&ctx()).await.unwrap();
    }
}
