use std::fmt::Debug;

use super::machine::ValidationError;
use super::state::{Params, State};
use super::PartIdx;
use crate::types::Address;

/// Application plug-in validating the semantics of state transitions.
///
/// The common machine checks ids, versions and balance preservation; the app
/// decides whether the change in `data` (and the balance movement) is a legal
/// move by `actor`.
pub trait App: Send + Sync + Debug {
    /// On-chain definition address identifying the application.
    fn def(&self) -> Address;

    fn valid_transition(
        &self,
        params: &Params,
        from: &State,
        to: &State,
        actor: PartIdx,
    ) -> Result<(), ValidationError>;
}

/// The trivial payment app: any balance-preserving transition is legal.
#[derive(Debug, Default)]
pub struct NullApp;

impl App for NullApp {
    fn def(&self) -> Address {
        Address::default()
    }

    fn valid_transition(
        &self,
        _params: &Params,
        _from: &State,
        _to: &State,
        _actor: PartIdx,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}
