//! The client ties identity, peer registry, proposal handling and the
//! on-chain adapters together.

mod channel;
mod proposal;
mod update;


pub use channel::{Channel, ChannelError, ProtocolError};
pub use proposal::{ProposalAcc, ProposalError, ProposalHandler, ProposalResponder};
pub use update::{UpdateError, UpdateHandler, UpdateResponder};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{App, Funder, Settler};
use crate::peer::{Peer, Registry, RegistryError};
use crate::sig::Signer;
use crate::types::Address;
use crate::wire::{Dialer, Listener};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client already closed")]
    AlreadyClosed,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A payment-channel client.
///
/// One client serves one identity. It dials and accepts peers through its
/// registry, hands inbound channel proposals to the configured
/// [ProposalHandler], and inbound updates of open channels to the configured
/// [UpdateHandler].
pub struct Client {
    identity: Arc<Signer>,
    app: Arc<dyn App>,
    peers: Arc<Registry>,
    prop_handler: Arc<dyn ProposalHandler>,
    update_handler: Arc<dyn UpdateHandler>,
    funder: Arc<dyn Funder>,
    settler: Arc<dyn Settler>,
    quit: CancellationToken,
    closed: AtomicBool,
}

impl Client {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<Signer>,
        dialer: Arc<dyn Dialer>,
        prop_handler: Arc<dyn ProposalHandler>,
        update_handler: Arc<dyn UpdateHandler>,
        funder: Arc<dyn Funder>,
        settler: Arc<dyn Settler>,
        app: Arc<dyn App>,
    ) -> Arc<Client> {
        Arc::new_cyclic(|weak: &Weak<Client>| {
            let hook = weak.clone();
            let peers = Arc::new(Registry::new(
                identity.address(),
                dialer,
                Box::new(move |peer| {
                    if let Some(client) = hook.upgrade() {
                        client.subscribe_peer(peer);
                    }
                }),
            ));
            Client {
                identity,
                app,
                peers,
                prop_handler,
                update_handler,
                funder,
                settler,
                quit: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }
        })
    }

    pub fn addr(&self) -> Address {
        self.identity.address()
    }

    /// Accepts inbound connections on `listener` until the client closes.
    /// Run this as its own task.
    pub async fn listen(self: &Arc<Self>, listener: Arc<dyn Listener>) {
        self.peers.listen(listener).await
    }

    /// Closes the registry with every peer and listener. Open channels stop
    /// serving updates. Double-close is an error.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyClosed);
        }
        self.quit.cancel();
        self.peers.close().await?;
        Ok(())
    }

    // Runs for every new peer before it receives its first message, so the
    // proposal subscription cannot miss anything.
    fn subscribe_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        debug!(peer = %peer.addr(), "setting up default subscriptions");
        self.sub_channel_proposals(peer);

        let addr = peer.addr();
        peer.set_default_handler(move |msg| {
            debug!(peer = %addr, tag = ?msg.tag(), "received message without subscription");
        });
    }
}
