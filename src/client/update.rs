use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::channel::{Channel, ProtocolError};
use crate::channel::{MachineError, PartIdx, State, StateMachine};
use crate::context::Ctx;
use crate::messages::{ChannelUpdate, ChannelUpdateAcc, ChannelUpdateRej, Msg};
use crate::peer::PeerError;
use crate::wire::TransportError;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("only the proposing participant may be the actor")]
    ActorNotProposer,
    #[error("locked sub-allocations cannot be updated")]
    LockedFunds,
    #[error("update rejected: {0}")]
    Rejected(String),
    #[error("no current state to answer with")]
    NoCurrentState,
    #[error("update handling aborted")]
    Aborted,
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Receives inbound channel updates for the user to accept or reject.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, update: ChannelUpdate, responder: Arc<UpdateResponder>);
}

enum UpdateResponse {
    Accept {
        ctx: Ctx,
        result: oneshot::Sender<Result<(), UpdateError>>,
    },
    Reject {
        ctx: Ctx,
        reason: String,
        result: oneshot::Sender<Result<(), UpdateError>>,
    },
}

/// Lets the user answer one channel update. Exactly one of [accept] and
/// [reject] may be called, once; any further call panics.
///
/// [accept]: UpdateResponder::accept
/// [reject]: UpdateResponder::reject
pub struct UpdateResponder {
    called: AtomicBool,
    tx: StdMutex<Option<oneshot::Sender<UpdateResponse>>>,
}

impl UpdateResponder {
    fn new() -> (Arc<Self>, oneshot::Receiver<UpdateResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(UpdateResponder {
                called: AtomicBool::new(false),
                tx: StdMutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn take(&self) -> oneshot::Sender<UpdateResponse> {
        if self.called.swap(true, Ordering::AcqRel) {
            panic!("multiple calls on update responder");
        }
        self.tx
            .lock()
            .unwrap()
            .take()
            .expect("responder consumed only once")
    }

    pub async fn accept(&self, ctx: &Ctx) -> Result<(), UpdateError> {
        let (result, outcome) = oneshot::channel();
        self.take()
            .send(UpdateResponse::Accept {
                ctx: ctx.clone(),
                result,
            })
            .map_err(|_| UpdateError::Aborted)?;
        outcome.await.map_err(|_| UpdateError::Aborted)?
    }

    pub async fn reject(&self, ctx: &Ctx, reason: impl Into<String> + Send) -> Result<(), UpdateError> {
        let (result, outcome) = oneshot::channel();
        self.take()
            .send(UpdateResponse::Reject {
                ctx: ctx.clone(),
                reason: reason.into(),
                result,
            })
            .map_err(|_| UpdateError::Aborted)?;
        outcome.await.map_err(|_| UpdateError::Aborted)?
    }
}

impl Channel {
    /// Proposes `new_state` to the counter-party and drives the signing
    /// round to completion: stage, sign, send, await the single reply, then
    /// promote or discard. The machine stays locked for the round-trip.
    pub async fn update(
        &self,
        ctx: &Ctx,
        new_state: &State,
        actor_idx: PartIdx,
    ) -> Result<(), UpdateError> {
        self.valid_two_party_update(new_state, actor_idx)?;

        let mut m = self.machine.lock().await;
        m.update(new_state, actor_idx)?;
        let sig = match m.sig() {
            Ok(sig) => sig,
            Err(err) => {
                let _ = m.discard_update();
                return Err(err.into());
            }
        };

        let msg = Msg::ChannelUpdate(ChannelUpdate {
            state: new_state.clone(),
            actor_idx,
            sig,
        });
        if let Err(err) = self.conn.send(ctx, msg).await {
            let _ = m.discard_update();
            return Err(err.into());
        }

        match self.conn.recv_response(ctx).await {
            Some((pidx, Msg::ChannelUpdateAcc(acc)))
                if acc.id == self.id() && acc.version == new_state.version() =>
            {
                if let Err(err) = m.add_sig(pidx, acc.sig) {
                    let _ = m.discard_update();
                    return Err(err.into());
                }
                if new_state.is_final {
                    m.enable_final()?;
                } else {
                    m.enable_update()?;
                }
                Ok(())
            }
            Some((_, Msg::ChannelUpdateAcc(_))) => {
                let _ = m.discard_update();
                Err(ProtocolError::ReplyMismatch.into())
            }
            Some((_, Msg::ChannelUpdateRej(rej))) => {
                let _ = m.discard_update();
                Err(UpdateError::Rejected(rej.reason))
            }
            Some(_) => {
                let _ = m.discard_update();
                Err(ProtocolError::UnexpectedMsg.into())
            }
            None => {
                let _ = m.discard_update();
                Err(PeerError::from(TransportError::Expired).into())
            }
        }
    }

    // Protocol checks beyond the machine's: only the proposer may act, and
    // locked sub-allocations are not updatable.
    fn valid_two_party_update(&self, state: &State, actor_idx: PartIdx) -> Result<(), UpdateError> {
        if actor_idx != self.idx() {
            return Err(UpdateError::ActorNotProposer);
        }
        if !state.alloc.locked.is_empty() {
            return Err(UpdateError::LockedFunds);
        }
        Ok(())
    }

    /// Spawns the responder pump serving inbound update requests until the
    /// channel closes.
    pub(super) fn start(self: &Arc<Self>, handler: Arc<dyn UpdateHandler>) {
        let channel = Arc::clone(self);
        let quit = self.quit.clone();
        tokio::spawn(async move {
            let ctx = Ctx::background();
            loop {
                tokio::select! {
                    _ = quit.cancelled() => return,
                    next = channel.conn.recv_update(&ctx) => {
                        let Some((pidx, update)) = next else { return };
                        channel.handle_update(pidx, update, &handler).await;
                    }
                }
            }
        });
    }

    async fn handle_update(
        &self,
        pidx: PartIdx,
        update: ChannelUpdate,
        handler: &Arc<dyn UpdateHandler>,
    ) {
        debug!(
            channel = %self.id(),
            version = update.state.version(),
            "received channel update"
        );
        let mut m = self.machine.lock().await;
        let (responder, rx) = UpdateResponder::new();
        {
            let handler = Arc::clone(handler);
            let update = update.clone();
            tokio::spawn(async move { handler.handle(update, responder).await });
        }

        tokio::select! {
            _ = self.quit.cancelled() => (),
            response = rx => match response {
                Err(_) => debug!(channel = %self.id(), "update responder dropped without decision"),
                Ok(UpdateResponse::Accept { ctx, result }) => {
                    let outcome = self.accept_update(&ctx, &mut m, pidx, &update).await;
                    if let Err(err) = &outcome {
                        warn!(channel = %self.id(), error = %err, "accepting update failed");
                    }
                    let _ = result.send(outcome);
                }
                Ok(UpdateResponse::Reject { ctx, reason, result }) => {
                    let outcome = self.reject_update(&ctx, &mut m, reason).await;
                    let _ = result.send(outcome);
                }
            }
        }
    }

    // Verifies the predecessor relation by staging the update, collects both
    // signatures, replies, then promotes. Failures roll the staging back.
    async fn accept_update(
        &self,
        ctx: &Ctx,
        m: &mut StateMachine,
        pidx: PartIdx,
        update: &ChannelUpdate,
    ) -> Result<(), UpdateError> {
        if update.actor_idx != pidx {
            return Err(ProtocolError::ActorMismatch.into());
        }

        m.update(&update.state, update.actor_idx)?;
        if let Err(err) = m.add_sig(pidx, update.sig) {
            let _ = m.discard_update();
            return Err(err.into());
        }
        let sig = match m.sig() {
            Ok(sig) => sig,
            Err(err) => {
                let _ = m.discard_update();
                return Err(err.into());
            }
        };

        let acc = ChannelUpdateAcc {
            id: self.id(),
            version: update.state.version(),
            sig,
        };
        if let Err(err) = self.conn.send(ctx, Msg::ChannelUpdateAcc(acc)).await {
            let _ = m.discard_update();
            return Err(err.into());
        }

        if update.state.is_final {
            m.enable_final()?;
        } else {
            m.enable_update()?;
        }
        Ok(())
    }

    // Answers with our signed current state as the alternative; the machine
    // phase is left unchanged.
    async fn reject_update(
        &self,
        ctx: &Ctx,
        m: &mut StateMachine,
        reason: String,
    ) -> Result<(), UpdateError> {
        let (alt, sig) = {
            let tx = m.current_tx().ok_or(UpdateError::NoCurrentState)?;
            let sig = tx.sigs[m.idx() as usize].ok_or(UpdateError::NoCurrentState)?;
            (tx.state.clone(), sig)
        };

        let rej = ChannelUpdateRej {
            reason: reason.clone(),
            alt,
            actor_idx: m.idx(),
            sig,
        };
        self.conn.send(ctx, Msg::ChannelUpdateRej(rej)).await?;
        debug!(channel = %self.id(), %reason, "rejected channel update");
        Ok(())
    }
}
