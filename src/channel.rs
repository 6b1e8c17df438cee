//! Channel domain model: allocations, parameters, states and the per-channel
//! pushdown automaton that drives signing rounds.

mod allocation;
mod app;
mod machine;
mod state;

pub use allocation::{Allocation, Asset, SubAlloc};
pub use app::{App, NullApp};
pub use machine::{
    Machine, MachineError, Phase, PhaseTransition, StateMachine, TransitionError, ValidationError,
};
pub use state::{Params, State, Transaction};

use async_trait::async_trait;
use thiserror::Error;

use crate::context::Ctx;

/// ID (index) of a participant in the channel. `0` is the channel proposer.
pub type PartIdx = u16;

/// Failure reported by an on-chain adapter.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ChainError(pub String);

/// Asks a funder to deposit the initial balances on chain.
#[derive(Debug, Clone)]
pub struct FundingReq {
    pub params: Params,
    pub idx: PartIdx,
    pub alloc: Allocation,
}

/// Asks a settler to enforce the final transaction on chain.
#[derive(Debug, Clone)]
pub struct SettleReq {
    pub params: Params,
    pub idx: PartIdx,
    pub tx: Transaction,
}

/// On-chain funding adapter, called once after a channel enters `Funding`.
#[async_trait]
pub trait Funder: Send + Sync {
    async fn fund(&self, ctx: &Ctx, req: FundingReq) -> Result<(), ChainError>;
}

/// On-chain settlement adapter, called once after a channel enters `Final`.
#[async_trait]
pub trait Settler: Send + Sync {
    async fn settle(&self, ctx: &Ctx, req: SettleReq) -> Result<(), ChainError>;
}
