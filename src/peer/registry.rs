use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tracing::{debug, warn};

use super::identity::{exchange_addrs, AuthError};
use super::{Peer, PeerError};
use crate::context::Ctx;
use crate::types::Address;
use crate::wire::{Conn, Dialer, Listener, TransportError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry closed")]
    Closed,
    #[error("registry already closed")]
    AlreadyClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

type NewPeerHook = Box<dyn Fn(&Arc<Peer>) + Send + Sync>;

/// Directory of live peers, keyed by address.
///
/// Concurrent dials and inbound accepts for the same address are collapsed
/// onto one peer: the first reference creates a placeholder, and whichever
/// connection authenticates first fills it; the loser is discarded. Peers
/// whose connection died are swept out on the next lookup, so the directory
/// never holds two peers for one address and a reconnect starts fresh. The
/// hook passed at construction runs for every new peer before it receives
/// any message.
pub struct Registry {
    id: Address,
    dialer: Arc<dyn Dialer>,
    on_new_peer: NewPeerHook,
    peers: StdMutex<Vec<Arc<Peer>>>,
    listeners: StdMutex<Vec<Arc<dyn Listener>>>,
    closed: AtomicBool,
}

impl Registry {
    pub fn new(id: Address, dialer: Arc<dyn Dialer>, on_new_peer: NewPeerHook) -> Registry {
        Registry {
            id,
            dialer,
            on_new_peer,
            peers: StdMutex::new(Vec::new()),
            listeners: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> Address {
        self.id
    }

    // A peer whose connection died marks itself closed in place; every
    // lookup sweeps such entries out so the address slot is free again.
    fn sweep(peers: &mut Vec<Arc<Peer>>) {
        peers.retain(|p| !p.is_closed());
    }

    /// Whether a live peer for `addr` is registered.
    pub fn has(&self, addr: Address) -> bool {
        let mut peers = self.peers.lock().unwrap();
        Self::sweep(&mut peers);
        peers.iter().any(|p| p.addr() == addr)
    }

    pub fn num_peers(&self) -> usize {
        let mut peers = self.peers.lock().unwrap();
        Self::sweep(&mut peers);
        peers.len()
    }

    /// Returns the peer for `addr`, dialing it if absent or if the previous
    /// peer's connection died. Concurrent gets for one address share a
    /// single peer and at most one outstanding dial.
    pub async fn get(&self, ctx: &Ctx, addr: Address) -> Result<Arc<Peer>, RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }

        let (peer, dial) = {
            let mut peers = self.peers.lock().unwrap();
            Self::sweep(&mut peers);
            match peers.iter().find(|p| p.addr() == addr).cloned() {
                Some(p) => (p, false),
                None => {
                    let p = Peer::new(addr, None);
                    peers.push(p.clone());
                    (p, true)
                }
            }
        };

        if dial {
            (self.on_new_peer)(&peer);
            self.authenticated_dial(ctx, &peer, addr).await?;
        } else {
            peer.wait_open(ctx).await?;
        }
        Ok(peer)
    }

    /// Accepts connections until the listener fails or the registry closes.
    /// Each inbound connection is authenticated and registered concurrently.
    pub async fn listen(self: &Arc<Self>, listener: Arc<dyn Listener>) {
        if self.closed.load(Ordering::Acquire) {
            let _ = listener.close().await;
            return;
        }
        self.listeners.lock().unwrap().push(listener.clone());

        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let registry = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = registry.setup_conn(conn).await {
                            warn!(error = %err, "could not authenticate peer");
                        }
                    });
                }
                Err(err) => {
                    debug!(error = %err, "peer listener closed");
                    return;
                }
            }
        }
    }

    pub(crate) async fn setup_conn(&self, conn: Conn) -> Result<(), RegistryError> {
        let addr = exchange_addrs(&Ctx::background(), self.id, &conn).await?;
        if addr == self.id {
            return Err(AuthError::SelfConnection.into());
        }
        self.register(addr, conn);
        Ok(())
    }

    /// Registers an authenticated inbound connection. An existing live
    /// connection for the address wins; a placeholder is filled.
    fn register(&self, addr: Address, conn: Conn) -> Arc<Peer> {
        let existing = {
            let mut peers = self.peers.lock().unwrap();
            Self::sweep(&mut peers);
            peers.iter().find(|p| p.addr() == addr).cloned()
        };
        if let Some(p) = existing {
            if !p.create(conn) {
                debug!(peer = %addr, "duplicate connection discarded");
            }
            return p;
        }

        let p = Peer::new(addr, None);
        self.peers.lock().unwrap().push(p.clone());
        (self.on_new_peer)(&p);
        p.create(conn);
        p
    }

    async fn authenticated_dial(
        &self,
        ctx: &Ctx,
        peer: &Arc<Peer>,
        addr: Address,
    ) -> Result<(), RegistryError> {
        match self.dialer.dial(ctx, addr).await {
            Ok(conn) => match exchange_addrs(ctx, self.id, &conn).await {
                Ok(peer_addr) if peer_addr == addr => {
                    // A racing inbound connection may already have filled
                    // the slot; then the dialed connection is discarded.
                    peer.create(conn);
                    Ok(())
                }
                Ok(_) => self.abort_dial(peer, AuthError::AddressMismatch.into()).await,
                Err(err) => self.abort_dial(peer, err.into()).await,
            },
            Err(err) => self.abort_dial(peer, RegistryError::Transport(err)).await,
        }
    }

    // A failed dial only matters if nothing else connected the peer in the
    // meantime; otherwise the existing connection stands.
    async fn abort_dial(&self, peer: &Arc<Peer>, err: RegistryError) -> Result<(), RegistryError> {
        let removed = {
            let mut peers = self.peers.lock().unwrap();
            if peer.has_conn() {
                false
            } else {
                if let Some(i) = peers.iter().position(|p| Arc::ptr_eq(p, peer)) {
                    peers.remove(i);
                }
                true
            }
        };
        if removed {
            let _ = peer.close().await;
            Err(err)
        } else {
            Ok(())
        }
    }

    /// Closes the listener, every peer and the dialer. Errors are collected
    /// and the first one is returned; double-close is an error.
    pub async fn close(&self) -> Result<(), RegistryError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RegistryError::AlreadyClosed);
        }
        let mut first_err: Option<RegistryError> = None;

        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap());
        for listener in listeners {
            if let Err(err) = listener.close().await {
                first_err.get_or_insert(RegistryError::Transport(err));
            }
        }

        let peers = std::mem::take(&mut *self.peers.lock().unwrap());
        for peer in peers {
            match peer.close().await {
                Ok(()) | Err(PeerError::AlreadyClosed) => {}
                Err(err) => {
                    first_err.get_or_insert(err.into());
                }
            }
        }

        if let Err(err) = self.dialer.close().await {
            first_err.get_or_insert(RegistryError::Transport(err));
        }

        first_err.map_or(Ok(()), Err)
    }
}
