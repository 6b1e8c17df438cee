use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{
    Allocation, ChainError, Funder, MachineError, Params, PartIdx, Phase, PhaseTransition,
    Settler, State, StateMachine,
};
use crate::context::Ctx;
use crate::messages::{ChannelUpdate, ChannelUpdateAcc, Msg};
use crate::peer::{Broadcaster, Peer, PeerError, Receiver};
use crate::sig::Signer;
use crate::types::{Address, Hash, Signature};
use crate::wire::TransportError;

/// The counter-party broke the protocol; the staged transaction has been
/// discarded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected message type")]
    UnexpectedMsg,
    #[error("reply does not match the proposed update")]
    ReplyMismatch,
    #[error("actor index does not match the sending peer")]
    ActorMismatch,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("on-chain adapter: {0}")]
    Chain(#[from] ChainError),
    #[error("channel already closed")]
    AlreadyClosed,
}

/// The channel controller: progresses the state machine and runs the update
/// protocol against the channel's peers.
///
/// The machine is guarded by one mutex, held for the duration of a signing
/// round-trip, so concurrent updates on one channel serialize while distinct
/// channels run independently.
pub struct Channel {
    idx: PartIdx,
    params: Params,
    pub(super) conn: ChannelConn,
    pub(super) machine: Mutex<StateMachine>,
    funder: Arc<dyn Funder>,
    settler: Arc<dyn Settler>,
    pub(super) quit: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("idx", &self.idx)
            .field("params", &self.params)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(super) fn new(
        params: Params,
        acc: Arc<Signer>,
        peers: Vec<Arc<Peer>>,
        idx: PartIdx,
        funder: Arc<dyn Funder>,
        settler: Arc<dyn Settler>,
        quit: CancellationToken,
    ) -> Result<Arc<Channel>, ChannelError> {
        let machine = StateMachine::new(acc, params.clone())?;
        let conn = ChannelConn::new(params.id(), &peers, idx)?;
        Ok(Arc::new(Channel {
            idx,
            params,
            conn,
            machine: Mutex::new(machine),
            funder,
            settler,
            quit,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> Hash {
        self.params.id()
    }

    /// Our index in the channel participant list.
    pub fn idx(&self) -> PartIdx {
        self.idx
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub async fn phase(&self) -> Phase {
        self.machine.lock().await.phase()
    }

    /// A snapshot of the current (fully signed) state.
    pub async fn state(&self) -> Option<State> {
        self.machine.lock().await.state().cloned()
    }

    /// Subscribes to entries of `phase`; a same-named subscription to the
    /// phase is overwritten.
    pub async fn subscribe_phase(
        &self,
        phase: Phase,
        who: &str,
    ) -> mpsc::UnboundedReceiver<PhaseTransition> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.machine.lock().await.subscribe(phase, who, tx);
        rx
    }

    /// Settles the final state on chain. Legal only in the `Final` phase;
    /// the settler is called exactly once per channel.
    pub async fn settle(&self, ctx: &Ctx) -> Result<(), ChannelError> {
        let req = self.machine.lock().await.settle_req()?;
        self.settler.settle(ctx, req).await?;
        self.machine.lock().await.set_settled()?;
        debug!(channel = %self.id(), "channel settled");
        Ok(())
    }

    /// Stops serving updates and releases the channel's subscriptions.
    /// Double-close is an error.
    pub async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AlreadyClosed);
        }
        self.quit.cancel();
        self.conn.close().await;
        Ok(())
    }

    // Runs the version-0 exchange: both sides stage the initial state, swap
    // acceptance messages carrying their signatures and promote. The
    // proposer sends first; the responder echoes after verifying.
    pub(super) async fn exchange_init(
        &self,
        ctx: &Ctx,
        init_bals: Allocation,
        init_data: Vec<u8>,
        initiator: bool,
    ) -> Result<(), ChannelError> {
        let mut m = self.machine.lock().await;
        m.init(init_bals, init_data)?;

        if initiator {
            let sig = m.sig()?;
            self.send_init_acc(ctx, sig).await?;
            let (pidx, acc) = self.recv_init_acc(ctx).await?;
            m.add_sig(pidx, acc.sig)?;
        } else {
            let (pidx, acc) = self.recv_init_acc(ctx).await?;
            m.add_sig(pidx, acc.sig)?;
            let sig = m.sig()?;
            self.send_init_acc(ctx, sig).await?;
        }

        m.enable_init()?;
        debug!(channel = %self.id(), "initial state signed by all participants");
        Ok(())
    }

    async fn send_init_acc(&self, ctx: &Ctx, sig: Signature) -> Result<(), ChannelError> {
        let acc = ChannelUpdateAcc {
            id: self.id(),
            version: 0,
            sig,
        };
        Ok(self.conn.send(ctx, Msg::ChannelUpdateAcc(acc)).await?)
    }

    async fn recv_init_acc(&self, ctx: &Ctx) -> Result<(PartIdx, ChannelUpdateAcc), ChannelError> {
        match self.conn.recv_response(ctx).await {
            Some((pidx, Msg::ChannelUpdateAcc(acc))) if acc.id == self.id() && acc.version == 0 => {
                Ok((pidx, acc))
            }
            Some(_) => Err(ProtocolError::UnexpectedMsg.into()),
            None => Err(PeerError::from(TransportError::Expired).into()),
        }
    }

    /// Funds the channel and transitions it into `Acting`.
    pub(super) async fn complete_funding(&self, ctx: &Ctx) -> Result<(), ChannelError> {
        let req = self.machine.lock().await.funding_req()?;
        self.funder.fund(ctx, req).await?;
        self.machine.lock().await.set_funded()?;
        debug!(channel = %self.id(), "channel funded");
        Ok(())
    }
}

/// Binds a channel to its peer set: a broadcaster for sends, two filtered
/// receivers for inbound traffic, and the peer → participant-index mapping.
///
/// Update requests and update replies are split into separate subscriptions
/// so the responder path and an in-flight proposer cannot steal each other's
/// messages; together the predicates cover exactly the channel's messages.
pub(super) struct ChannelConn {
    requests: Receiver,
    responses: Receiver,
    broadcaster: Broadcaster,
    peer_idx: HashMap<Address, PartIdx>,
}

impl ChannelConn {
    // The order of `peers` matters: a peer at slot `i` of the external list
    // occupies participant slot `i`, shifted up by one from `idx` on, since
    // the local participant is not in the list.
    fn new(id: Hash, peers: &[Arc<Peer>], idx: PartIdx) -> Result<Self, PeerError> {
        let requests = Receiver::new();
        let responses = Receiver::new();
        let mut peer_idx = HashMap::new();

        for (i, peer) in peers.iter().enumerate() {
            let mut pidx = i as PartIdx;
            if pidx >= idx {
                pidx += 1;
            }
            peer_idx.insert(peer.addr(), pidx);

            requests.subscribe(peer, move |m| {
                matches!(m, Msg::ChannelUpdate(_)) && m.channel_id() == Some(id)
            })?;
            responses.subscribe(peer, move |m| {
                matches!(m, Msg::ChannelUpdateAcc(_) | Msg::ChannelUpdateRej(_))
                    && m.channel_id() == Some(id)
            })?;
        }

        Ok(ChannelConn {
            requests,
            responses,
            broadcaster: Broadcaster::new(peers.to_vec()),
            peer_idx,
        })
    }

    pub(super) async fn send(&self, ctx: &Ctx, msg: Msg) -> Result<(), PeerError> {
        self.broadcaster.send(ctx, &msg).await
    }

    /// The next inbound update request and its sender's participant index.
    pub(super) async fn recv_update(&self, ctx: &Ctx) -> Option<(PartIdx, ChannelUpdate)> {
        let (addr, msg) = self.requests.next(ctx).await?;
        match msg {
            Msg::ChannelUpdate(update) => Some((self.index_of(addr), update)),
            _ => unreachable!("filtered by subscription predicate"),
        }
    }

    /// The next inbound update reply and its sender's participant index.
    pub(super) async fn recv_response(&self, ctx: &Ctx) -> Option<(PartIdx, Msg)> {
        let (addr, msg) = self.responses.next(ctx).await?;
        Some((self.index_of(addr), msg))
    }

    fn index_of(&self, addr: Address) -> PartIdx {
        match self.peer_idx.get(&addr) {
            Some(idx) => *idx,
            None => panic!("channel connection received message from unknown peer {addr}"),
        }
    }

    pub(super) async fn close(&self) {
        self.requests.close().await;
        self.responses.close().await;
    }
}
