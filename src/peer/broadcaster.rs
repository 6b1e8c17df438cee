use std::sync::Arc;

use futures::future::try_join_all;

use super::{Peer, PeerError};
use crate::context::Ctx;
use crate::messages::Msg;

/// Fans a message out to a fixed set of peers.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    peers: Vec<Arc<Peer>>,
}

impl Broadcaster {
    pub fn new(peers: Vec<Arc<Peer>>) -> Self {
        Broadcaster { peers }
    }

    /// Sends to all peers in parallel, returning the first error or Ok once
    /// every send succeeded. Cancelling the context aborts in-flight sends.
    pub async fn send(&self, ctx: &Ctx, msg: &Msg) -> Result<(), PeerError> {
        try_join_all(self.peers.iter().map(|p| p.send(ctx, msg.clone())))
            .await
            .map(|_| ())
    }
}
