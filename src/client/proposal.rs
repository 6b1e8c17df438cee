use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelError};
use super::Client;
use crate::channel::{Params, ValidationError};
use crate::context::Ctx;
use crate::messages::{ChannelProposal, ChannelProposalAcc, ChannelProposalRej, Msg};
use crate::peer::{Peer, PeerError, Receiver, RegistryError};
use crate::sig::Signer;
use crate::wire::{TransportError, WireError};

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("challenge duration must be nonzero")]
    NoChallengeDuration,
    #[error("proposal must name exactly two peers")]
    PeerCount,
    #[error("own address missing from the proposal peers")]
    SelfNotIncluded,
    #[error("no remote peer in the proposal")]
    NoRemotePeer,
    #[error("participant address does not match the provided account")]
    ParticipantMismatch,
    #[error("proposal names an unsupported app")]
    UnknownApp,
    #[error("proposal rejected: {0}")]
    Rejected(String),
    #[error("proposal handling aborted")]
    Aborted,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// The user's answer to an accepted channel proposal: the account that will
/// sign states as this client's participant.
pub struct ProposalAcc {
    pub participant: Arc<Signer>,
}

/// Receives inbound channel proposals for the user to accept or reject.
#[async_trait]
pub trait ProposalHandler: Send + Sync {
    async fn handle(&self, proposal: ChannelProposal, responder: Arc<ProposalResponder>);
}

enum ProposalResponse {
    Accept {
        ctx: Ctx,
        acc: ProposalAcc,
        result: oneshot::Sender<Result<Arc<Channel>, ProposalError>>,
    },
    Reject {
        ctx: Ctx,
        reason: String,
        result: oneshot::Sender<Result<(), ProposalError>>,
    },
}

/// Lets the user answer one channel proposal. Exactly one of [accept] and
/// [reject] may be called, once; any further call panics. Accepting runs the
/// opening protocol and hands back the opened channel.
///
/// [accept]: ProposalResponder::accept
/// [reject]: ProposalResponder::reject
pub struct ProposalResponder {
    called: AtomicBool,
    tx: StdMutex<Option<oneshot::Sender<ProposalResponse>>>,
}

impl ProposalResponder {
    fn new() -> (Arc<Self>, oneshot::Receiver<ProposalResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(ProposalResponder {
                called: AtomicBool::new(false),
                tx: StdMutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn take(&self) -> oneshot::Sender<ProposalResponse> {
        if self.called.swap(true, Ordering::AcqRel) {
            panic!("multiple calls on proposal responder");
        }
        self.tx
            .lock()
            .unwrap()
            .take()
            .expect("responder consumed only once")
    }

    pub async fn accept(&self, ctx: &Ctx, acc: ProposalAcc) -> Result<Arc<Channel>, ProposalError> {
        let (result, outcome) = oneshot::channel();
        self.take()
            .send(ProposalResponse::Accept {
                ctx: ctx.clone(),
                acc,
                result,
            })
            .map_err(|_| ProposalError::Aborted)?;
        outcome.await.map_err(|_| ProposalError::Aborted)?
    }

    pub async fn reject(
        &self,
        ctx: &Ctx,
        reason: impl Into<String> + Send,
    ) -> Result<(), ProposalError> {
        let (result, outcome) = oneshot::channel();
        self.take()
            .send(ProposalResponse::Reject {
                ctx: ctx.clone(),
                reason: reason.into(),
                result,
            })
            .map_err(|_| ProposalError::Aborted)?;
        outcome.await.map_err(|_| ProposalError::Aborted)?
    }
}

impl Client {
    /// Proposes opening a channel to the remote peer named in
    /// `proposal.peers` and runs the opening protocol to completion:
    /// proposal round-trip, version-0 exchange, funding. `participant` is
    /// the account that signs states for us; it must match
    /// `proposal.participant`.
    pub async fn propose_channel(
        self: &Arc<Self>,
        ctx: &Ctx,
        participant: Arc<Signer>,
        proposal: ChannelProposal,
    ) -> Result<Arc<Channel>, ProposalError> {
        self.validate_proposal(&proposal)?;
        if proposal.participant != participant.address() {
            return Err(ProposalError::ParticipantMismatch);
        }

        let own = self.identity.address();
        let peer_addr = proposal
            .peers
            .iter()
            .copied()
            .find(|a| *a != own)
            .ok_or(ProposalError::NoRemotePeer)?;
        let peer = self.peers.get(ctx, peer_addr).await?;

        let sess_id = proposal.sess_id()?;
        let replies = Receiver::new();
        replies.subscribe(&peer, move |m| match m {
            Msg::ChannelProposalAcc(acc) => acc.sess_id == sess_id,
            Msg::ChannelProposalRej(rej) => rej.sess_id == sess_id,
            _ => false,
        })?;

        peer.send(ctx, Msg::ChannelProposal(proposal.clone())).await?;
        let reply = replies.next(ctx).await;
        replies.close().await;

        match reply {
            Some((_, Msg::ChannelProposalAcc(acc))) => {
                let params = Params::new(
                    proposal.challenge_duration,
                    vec![proposal.participant, acc.participant],
                    Arc::clone(&self.app),
                    proposal.nonce,
                )?;
                let channel = Channel::new(
                    params,
                    participant,
                    vec![peer],
                    0,
                    Arc::clone(&self.funder),
                    Arc::clone(&self.settler),
                    self.quit.child_token(),
                )?;
                channel
                    .exchange_init(ctx, proposal.init_bals.clone(), proposal.init_data.clone(), true)
                    .await?;
                channel.complete_funding(ctx).await?;
                channel.start(Arc::clone(&self.update_handler));
                info!(channel = %channel.id(), peer = %peer_addr, "channel opened");
                Ok(channel)
            }
            Some((_, Msg::ChannelProposalRej(rej))) => Err(ProposalError::Rejected(rej.reason)),
            Some(_) => unreachable!("filtered by subscription predicate"),
            None => Err(PeerError::from(TransportError::Expired).into()),
        }
    }

    // Subscribes the proposal receiver on a new peer and serves it until the
    // client closes.
    pub(super) fn sub_channel_proposals(self: &Arc<Self>, peer: &Arc<Peer>) {
        let proposals = Receiver::new();
        if let Err(err) = proposals.subscribe(peer, |m| matches!(m, Msg::ChannelProposal(_))) {
            warn!(peer = %peer.addr(), error = %err, "failed to subscribe to channel proposals");
            return;
        }

        let client = Arc::clone(self);
        let peer = Arc::clone(peer);
        let quit = self.quit.clone();
        tokio::spawn(async move {
            let ctx = Ctx::background();
            loop {
                tokio::select! {
                    _ = quit.cancelled() => {
                        proposals.close().await;
                        return;
                    }
                    next = proposals.next(&ctx) => {
                        let Some((_, msg)) = next else { return };
                        let Msg::ChannelProposal(proposal) = msg else { continue };
                        let client = Arc::clone(&client);
                        let peer = Arc::clone(&peer);
                        tokio::spawn(async move {
                            client.handle_channel_proposal(peer, proposal).await
                        });
                    }
                }
            }
        });
    }

    async fn handle_channel_proposal(
        self: Arc<Self>,
        peer: Arc<Peer>,
        proposal: ChannelProposal,
    ) {
        if let Err(err) = self.validate_proposal(&proposal) {
            debug!(peer = %peer.addr(), error = %err, "received invalid channel proposal");
            return;
        }

        let (responder, rx) = ProposalResponder::new();
        {
            let handler = Arc::clone(&self.prop_handler);
            let proposal = proposal.clone();
            tokio::spawn(async move { handler.handle(proposal, responder).await });
        }

        match rx.await {
            Err(_) => debug!(peer = %peer.addr(), "proposal responder dropped without decision"),
            Ok(ProposalResponse::Accept { ctx, acc, result }) => {
                let outcome = self.accept_proposal(&ctx, &peer, &proposal, acc).await;
                if let Err(err) = &outcome {
                    warn!(peer = %peer.addr(), error = %err, "accepting channel proposal failed");
                }
                let _ = result.send(outcome);
            }
            Ok(ProposalResponse::Reject { ctx, reason, result }) => {
                let outcome = self.reject_proposal(&ctx, &peer, &proposal, reason).await;
                let _ = result.send(outcome);
            }
        }
    }

    async fn accept_proposal(
        self: &Arc<Self>,
        ctx: &Ctx,
        peer: &Arc<Peer>,
        proposal: &ChannelProposal,
        acc: ProposalAcc,
    ) -> Result<Arc<Channel>, ProposalError> {
        let participant_addr = acc.participant.address();
        let params = Params::new(
            proposal.challenge_duration,
            vec![proposal.participant, participant_addr],
            Arc::clone(&self.app),
            proposal.nonce,
        )?;
        // The channel subscribes its receivers before the acceptance leaves,
        // so the proposer's version-0 message cannot be missed.
        let channel = Channel::new(
            params,
            acc.participant,
            vec![Arc::clone(peer)],
            1,
            Arc::clone(&self.funder),
            Arc::clone(&self.settler),
            self.quit.child_token(),
        )?;

        let msg = Msg::ChannelProposalAcc(ChannelProposalAcc {
            sess_id: proposal.sess_id()?,
            participant: participant_addr,
        });
        peer.send(ctx, msg).await?;

        channel
            .exchange_init(ctx, proposal.init_bals.clone(), proposal.init_data.clone(), false)
            .await?;
        channel.complete_funding(ctx).await?;
        channel.start(Arc::clone(&self.update_handler));
        info!(channel = %channel.id(), peer = %peer.addr(), "channel opened");
        Ok(channel)
    }

    async fn reject_proposal(
        &self,
        ctx: &Ctx,
        peer: &Arc<Peer>,
        proposal: &ChannelProposal,
        reason: String,
    ) -> Result<(), ProposalError> {
        let msg = Msg::ChannelProposalRej(ChannelProposalRej {
            sess_id: proposal.sess_id()?,
            reason,
        });
        peer.send(ctx, msg).await?;
        Ok(())
    }

    fn validate_proposal(&self, proposal: &ChannelProposal) -> Result<(), ProposalError> {
        if proposal.challenge_duration == 0 {
            return Err(ProposalError::NoChallengeDuration);
        }
        if proposal.peers.len() != 2 {
            return Err(ProposalError::PeerCount);
        }
        if !proposal.peers.contains(&self.identity.address()) {
            return Err(ProposalError::SelfNotIncluded);
        }
        if proposal.app != self.app.def() {
            return Err(ProposalError::UnknownApp);
        }
        proposal.init_bals.valid()?;
        if proposal.init_bals.of_parts.len() != 2 {
            return Err(ValidationError::Allocation("participant count mismatch").into());
        }
        Ok(())
    }
}
