use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use super::allocation::Allocation;
use super::state::{Params, State, Transaction};
use super::{FundingReq, PartIdx, SettleReq};
use crate::sig::{self, Signer};
use crate::types::{Hash, Signature};
use crate::wire::{self, WireError};

/// A phase of the channel pushdown automaton.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    InitActing,
    InitSigning,
    Funding,
    Acting,
    Signing,
    Final,
    Settled,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::InitActing => "InitActing",
            Phase::InitSigning => "InitSigning",
            Phase::Funding => "Funding",
            Phase::Acting => "Acting",
            Phase::Signing => "Signing",
            Phase::Final => "Final",
            Phase::Settled => "Settled",
        })
    }
}

/// A transition between two phases.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
}

impl fmt::Display for PhaseTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

const SIGNING_PHASES: [Phase; 2] = [Phase::InitSigning, Phase::Signing];

fn valid_phase_transition(t: PhaseTransition) -> bool {
    use Phase::*;
    matches!(
        (t.from, t.to),
        (InitActing, InitSigning)
            | (InitSigning, Funding)
            | (Funding, Acting)
            | (Acting, Signing)
            | (Signing, Acting)
            | (Signing, Final)
            | (Final, Settled)
    )
}

/// An operation was illegal in the machine's current phase. The machine is
/// left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("channel {id}: cannot transition {attempted} while in {current}: {reason}")]
pub struct TransitionError {
    pub id: Hash,
    pub current: Phase,
    pub attempted: PhaseTransition,
    pub reason: &'static str,
}

/// A proposed state failed the transition checks. The machine is left
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("new state's channel id does not match")]
    IdMismatch,
    #[error("new state's app does not match")]
    AppMismatch,
    #[error("cannot advance a final state")]
    FinalState,
    #[error("version must increase by one")]
    Version,
    #[error("actor index out of range")]
    Actor,
    #[error("malformed allocation: {0}")]
    Allocation(&'static str),
    #[error("balance sum overflow")]
    Overflow,
    #[error("allocations must preserve the per-asset totals")]
    SumMismatch,
    #[error("app rejected the transition: {0}")]
    App(String),
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("signature for participant {0} already present")]
    AlreadySigned(PartIdx),
    #[error("invalid signature for participant {0}")]
    InvalidSignature(PartIdx),
    #[error("signature {0} missing from staging transaction")]
    MissingSignature(PartIdx),
    #[error("account not part of the participant set")]
    NotParticipant,
    #[error("signature backend: {0}")]
    Sig(#[from] sig::Error),
    #[error("encoding state: {0}")]
    Wire(#[from] WireError),
}

/// The channel pushdown automaton. It checks for correct signatures and valid
/// phase transitions.
///
/// The machine only implements the transitions common to all machine kinds:
/// signature collection, promotion of the staged transaction, and the
/// externally signaled funding/settlement transitions. Staging itself is done
/// by the wrapping [StateMachine], which also runs the app-specific checks.
#[derive(Debug)]
pub struct Machine {
    phase: Phase,
    acc: Arc<Signer>,
    idx: PartIdx,
    params: Params,
    staging_tx: Option<Transaction>,
    current_tx: Option<Transaction>,
    prev_txs: Vec<Transaction>,

    // Subscribers per phase, notified on entering the phase.
    subs: HashMap<Phase, HashMap<String, mpsc::UnboundedSender<PhaseTransition>>>,
}

impl Machine {
    fn new(acc: Arc<Signer>, params: Params) -> Result<Self, MachineError> {
        let idx = params
            .index_of(acc.address())
            .ok_or(MachineError::NotParticipant)?;

        Ok(Machine {
            phase: Phase::InitActing,
            acc,
            idx,
            params,
            staging_tx: None,
            current_tx: None,
            prev_txs: Vec::new(),
            subs: HashMap::new(),
        })
    }

    pub fn id(&self) -> Hash {
        self.params.id()
    }

    /// Our index in the channel participant list.
    pub fn idx(&self) -> PartIdx {
        self.idx
    }

    pub fn n(&self) -> PartIdx {
        self.params.n()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The current (fully signed) state, if a transaction has been promoted.
    pub fn state(&self) -> Option<&State> {
        self.current_tx.as_ref().map(|tx| &tx.state)
    }

    pub fn staging_state(&self) -> Option<&State> {
        self.staging_tx.as_ref().map(|tx| &tx.state)
    }

    pub fn current_tx(&self) -> Option<&Transaction> {
        self.current_tx.as_ref()
    }

    /// Every previously current transaction, oldest first.
    pub fn prev_txs(&self) -> &[Transaction] {
        &self.prev_txs
    }

    /// The funding request for the promoted initial state. Only available
    /// while the machine awaits funding.
    pub fn funding_req(&self) -> Result<FundingReq, MachineError> {
        self.expect(PhaseTransition {
            from: Phase::Funding,
            to: Phase::Acting,
        })?;
        let alloc = match self.current_tx.as_ref() {
            Some(tx) => tx.state.alloc.clone(),
            None => return Err(self.error_self("no current transaction").into()),
        };
        Ok(FundingReq {
            params: self.params.clone(),
            idx: self.idx,
            alloc,
        })
    }

    /// The settlement request for the current transaction. Only available
    /// once the machine is in the `Final` phase.
    pub fn settle_req(&self) -> Result<SettleReq, MachineError> {
        self.expect(PhaseTransition {
            from: Phase::Final,
            to: Phase::Settled,
        })?;
        let tx = match self.current_tx.as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(self.error_self("no current transaction").into()),
        };
        Ok(SettleReq {
            params: self.params.clone(),
            idx: self.idx,
            tx,
        })
    }

    /// Returns our own signature on the staged state, computing and caching
    /// it in the staging transaction on first use.
    pub fn sig(&mut self) -> Result<Signature, MachineError> {
        if !SIGNING_PHASES.contains(&self.phase) {
            return Err(self
                .error_self("can only create own signature in a signing phase")
                .into());
        }

        let idx = self.idx as usize;
        let (id, current) = (self.params.id(), self.phase);
        let staging = match self.staging_tx.as_mut() {
            Some(tx) => tx,
            None => {
                return Err(TransitionError {
                    id,
                    current,
                    attempted: PhaseTransition {
                        from: current,
                        to: current,
                    },
                    reason: "no staged transaction",
                }
                .into())
            }
        };

        match staging.sigs[idx] {
            Some(sig) => Ok(sig),
            None => {
                let hash = wire::to_hash(&staging.state)?;
                let sig = self.acc.sign(hash);
                staging.sigs[idx] = Some(sig);
                Ok(sig)
            }
        }
    }

    /// Verifies `sig` as participant `idx`'s signature on the staged state
    /// and records it. Errors if the slot is already filled or verification
    /// fails; panics if `idx` is out of range, which is a usage bug.
    pub fn add_sig(&mut self, idx: PartIdx, sig: Signature) -> Result<(), MachineError> {
        assert!(idx < self.n(), "participant index {idx} out of range");

        if !SIGNING_PHASES.contains(&self.phase) {
            return Err(self
                .error_self("can only add signatures in a signing phase")
                .into());
        }

        let part = self.params.parts()[idx as usize];
        let (id, current) = (self.params.id(), self.phase);
        let staging = match self.staging_tx.as_mut() {
            Some(tx) => tx,
            None => {
                return Err(TransitionError {
                    id,
                    current,
                    attempted: PhaseTransition {
                        from: current,
                        to: current,
                    },
                    reason: "no staged transaction",
                }
                .into())
            }
        };

        if staging.sigs[idx as usize].is_some() {
            return Err(MachineError::AlreadySigned(idx));
        }
        let hash = wire::to_hash(&staging.state)?;
        if !sig::verify(hash, sig, part)? {
            return Err(MachineError::InvalidSignature(idx));
        }

        staging.sigs[idx as usize] = Some(sig);
        Ok(())
    }

    /// Promotes the initial staging state; the channel awaits funding next.
    pub fn enable_init(&mut self) -> Result<(), MachineError> {
        self.enable_staged(PhaseTransition {
            from: Phase::InitSigning,
            to: Phase::Funding,
        })
    }

    /// Promotes the staged update to the current state.
    pub fn enable_update(&mut self) -> Result<(), MachineError> {
        self.enable_staged(PhaseTransition {
            from: Phase::Signing,
            to: Phase::Acting,
        })
    }

    /// Promotes the staged final state; the channel can be settled next.
    pub fn enable_final(&mut self) -> Result<(), MachineError> {
        self.enable_staged(PhaseTransition {
            from: Phase::Signing,
            to: Phase::Final,
        })
    }

    // Checks the phase, the staged state's finality flag and the presence of
    // all signatures, then promotes staging to current.
    fn enable_staged(&mut self, expected: PhaseTransition) -> Result<(), MachineError> {
        self.expect(expected)?;

        {
            let staging = match self.staging_tx.as_ref() {
                Some(tx) => tx,
                None => return Err(self.error(expected, "no staged transaction").into()),
            };
            if (expected.to == Phase::Final) != staging.state.is_final {
                return Err(self
                    .error(expected, "staged state finality does not match the target phase")
                    .into());
            }
            if let Some(i) = staging.sigs.iter().position(Option::is_none) {
                return Err(MachineError::MissingSignature(i as PartIdx));
            }
        }

        let staging = self.staging_tx.take();
        if let Some(current) = self.current_tx.take() {
            self.prev_txs.push(current);
        }
        self.current_tx = staging;
        self.set_phase(expected.to);
        Ok(())
    }

    /// Discards the staged update after a rejection, reverting to `Acting`.
    pub fn discard_update(&mut self) -> Result<(), MachineError> {
        self.expect(PhaseTransition {
            from: Phase::Signing,
            to: Phase::Acting,
        })?;

        self.staging_tx = None;
        self.set_phase(Phase::Acting);
        Ok(())
    }

    /// Signals that the channel got funded on chain.
    pub fn set_funded(&mut self) -> Result<(), MachineError> {
        self.expect(PhaseTransition {
            from: Phase::Funding,
            to: Phase::Acting,
        })?;

        self.set_phase(Phase::Acting);
        Ok(())
    }

    /// Signals that the final state was settled on chain.
    pub fn set_settled(&mut self) -> Result<(), MachineError> {
        self.expect(PhaseTransition {
            from: Phase::Final,
            to: Phase::Settled,
        })?;

        self.set_phase(Phase::Settled);
        Ok(())
    }

    /// Subscribes `sub` to entries of `phase` under the name `who`. A
    /// subscription of the same name to the same phase is overwritten.
    pub fn subscribe(
        &mut self,
        phase: Phase,
        who: &str,
        sub: mpsc::UnboundedSender<PhaseTransition>,
    ) {
        self.subs
            .entry(phase)
            .or_default()
            .insert(who.to_string(), sub);
    }

    fn set_phase(&mut self, p: Phase) {
        let transition = PhaseTransition {
            from: self.phase,
            to: p,
        };
        trace!(id = %self.params.id(), %transition, "phase transition");
        self.phase = p;
        self.notify_subs(transition);
    }

    fn notify_subs(&mut self, transition: PhaseTransition) {
        let id = self.params.id();
        if let Some(subs) = self.subs.get_mut(&self.phase) {
            subs.retain(|who, sub| {
                trace!(%id, %transition, subscriber = %who, "notifying subscriber");
                sub.send(transition).is_ok()
            });
        }
    }

    fn expect(&self, tr: PhaseTransition) -> Result<(), TransitionError> {
        if self.phase != tr.from {
            return Err(self.error(tr, "not in the expected phase"));
        }
        if !valid_phase_transition(PhaseTransition {
            from: self.phase,
            to: tr.to,
        }) {
            return Err(self.error(tr, "forbidden phase transition"));
        }
        Ok(())
    }

    // Common transition checks, run against the current state before the
    // app-specific check.
    fn valid_transition(&self, from: &State, to: &State) -> Result<(), ValidationError> {
        if to.id() != self.params.id() {
            return Err(ValidationError::IdMismatch);
        }
        if to.app() != self.params.app().def() {
            return Err(ValidationError::AppMismatch);
        }
        if from.is_final {
            return Err(ValidationError::FinalState);
        }
        if from.version() + 1 != to.version() {
            return Err(ValidationError::Version);
        }
        to.alloc.valid()?;
        if !Allocation::equal_sum(&from.alloc, &to.alloc)? {
            return Err(ValidationError::SumMismatch);
        }
        Ok(())
    }

    fn set_staging(&mut self, phase: Phase, state: State) {
        self.staging_tx = Some(Transaction::new(state, self.n()));
        self.set_phase(phase);
    }

    fn error(&self, attempted: PhaseTransition, reason: &'static str) -> TransitionError {
        TransitionError {
            id: self.params.id(),
            current: self.phase,
            attempted,
            reason,
        }
    }

    fn error_self(&self, reason: &'static str) -> TransitionError {
        self.error(
            PhaseTransition {
                from: self.phase,
                to: self.phase,
            },
            reason,
        )
    }
}

/// A machine that stages whole states proposed by an actor and validates
/// them with the app's transition check.
#[derive(Debug)]
pub struct StateMachine {
    m: Machine,
}

impl StateMachine {
    pub fn new(acc: Arc<Signer>, params: Params) -> Result<Self, MachineError> {
        Ok(StateMachine {
            m: Machine::new(acc, params)?,
        })
    }

    /// Stages the version-0 state built from the parameters and the initial
    /// balances, entering `InitSigning`.
    pub fn init(&mut self, init_bals: Allocation, init_data: Vec<u8>) -> Result<(), MachineError> {
        self.m.expect(PhaseTransition {
            from: Phase::InitActing,
            to: Phase::InitSigning,
        })?;

        init_bals.valid()?;
        if init_bals.of_parts.len() != self.m.params.parts().len() {
            return Err(ValidationError::Allocation("participant count mismatch").into());
        }

        let init = State::new(&self.m.params, init_bals, init_data);
        self.m.set_staging(Phase::InitSigning, init);
        Ok(())
    }

    /// Stages `to` as the next state, entering `Signing`. Runs the common
    /// transition checks and the app's semantic check for `actor`.
    pub fn update(&mut self, to: &State, actor: PartIdx) -> Result<(), MachineError> {
        self.m.expect(PhaseTransition {
            from: Phase::Acting,
            to: Phase::Signing,
        })?;
        if actor >= self.m.n() {
            return Err(ValidationError::Actor.into());
        }

        {
            let current = match self.m.current_tx.as_ref() {
                Some(tx) => &tx.state,
                None => return Err(self.m.error_self("no current transaction").into()),
            };
            self.m.valid_transition(current, to)?;
            self.m
                .params
                .app()
                .valid_transition(&self.m.params, current, to, actor)?;
        }

        self.m.set_staging(Phase::Signing, to.clone());
        Ok(())
    }
}

impl Deref for StateMachine {
    type Target = Machine;

    fn deref(&self) -> &Machine {
        &self.m
    }
}

impl DerefMut for StateMachine {
    fn deref_mut(&mut self) -> &mut Machine {
        &mut self.m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Asset, NullApp};
    use crate::types::U256;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn alloc(bals: &[u64]) -> Allocation {
        Allocation::new(
            vec![Asset::default()],
            bals.iter().map(|b| vec![U256::from(*b)]).collect(),
        )
    }

    fn two_machines(seed: u64) -> (StateMachine, StateMachine) {
        let mut rng = StdRng::seed_from_u64(seed);
        let a = Arc::new(Signer::new(&mut rng));
        let b = Arc::new(Signer::new(&mut rng));
        let params = Params::new(
            10,
            vec![a.address(), b.address()],
            Arc::new(NullApp),
            rng.gen(),
        )
        .unwrap();
        (
            StateMachine::new(a, params.clone()).unwrap(),
            StateMachine::new(b, params).unwrap(),
        )
    }

    fn cross_sign(ma: &mut StateMachine, mb: &mut StateMachine) {
        let sa = ma.sig().unwrap();
        let sb = mb.sig().unwrap();
        ma.add_sig(1, sb).unwrap();
        mb.add_sig(0, sa).unwrap();
    }

    fn open(ma: &mut StateMachine, mb: &mut StateMachine) {
        ma.init(alloc(&[100, 100]), vec![]).unwrap();
        mb.init(alloc(&[100, 100]), vec![]).unwrap();
        cross_sign(ma, mb);
        ma.enable_init().unwrap();
        mb.enable_init().unwrap();
        ma.set_funded().unwrap();
        mb.set_funded().unwrap();
    }

    #[test]
    fn account_must_be_participant() {
        let mut rng = StdRng::seed_from_u64(10);
        let outsider = Arc::new(Signer::new(&mut rng));
        let params = Params::new(
            10,
            vec![rng.gen(), rng.gen()],
            Arc::new(NullApp),
            rng.gen(),
        )
        .unwrap();
        assert!(matches!(
            StateMachine::new(outsider, params),
            Err(MachineError::NotParticipant)
        ));
    }

    #[test]
    fn init_stages_version_zero() {
        let (mut ma, _) = two_machines(11);
        assert_eq!(ma.phase(), Phase::InitActing);
        ma.init(alloc(&[100, 100]), vec![]).unwrap();
        assert_eq!(ma.phase(), Phase::InitSigning);
        assert_eq!(ma.staging_state().unwrap().version(), 0);
        assert!(ma.state().is_none());
    }

    #[test]
    fn init_rejects_malformed_allocation() {
        let (mut ma, _) = two_machines(12);
        assert!(ma.init(alloc(&[100]), vec![]).is_err());
        assert_eq!(ma.phase(), Phase::InitActing);
    }

    #[test]
    fn open_promotes_and_funds() {
        let (mut ma, mut mb) = two_machines(13);
        open(&mut ma, &mut mb);

        for m in [&ma, &mb] {
            assert_eq!(m.phase(), Phase::Acting);
            let tx = m.current_tx().unwrap();
            assert_eq!(tx.state.version(), 0);
            assert!(tx.sigs.iter().all(Option::is_some));
            assert!(m.staging_state().is_none());
        }
    }

    #[test]
    fn sig_is_memoized() {
        let (mut ma, _) = two_machines(14);
        ma.init(alloc(&[100, 100]), vec![]).unwrap();
        assert_eq!(ma.sig().unwrap(), ma.sig().unwrap());
    }

    #[test]
    fn update_round_preserves_funds() {
        let (mut ma, mut mb) = two_machines(15);
        open(&mut ma, &mut mb);

        let mut next = ma.state().unwrap().make_next_state();
        next.alloc = alloc(&[90, 110]);
        ma.update(&next, 0).unwrap();
        mb.update(&next, 0).unwrap();
        cross_sign(&mut ma, &mut mb);
        ma.enable_update().unwrap();
        mb.enable_update().unwrap();

        for m in [&ma, &mb] {
            assert_eq!(m.phase(), Phase::Acting);
            let state = m.state().unwrap();
            assert_eq!(state.version(), 1);
            assert_eq!(state.alloc.sum().unwrap(), vec![U256::from(200)]);
            assert_eq!(m.prev_txs().len(), 1);
            assert_eq!(m.prev_txs()[0].state.version(), 0);
        }
    }

    #[test]
    fn update_rejects_sum_change() {
        let (mut ma, mut mb) = two_machines(16);
        open(&mut ma, &mut mb);

        let mut next = ma.state().unwrap().make_next_state();
        next.alloc = alloc(&[100, 110]);
        assert!(matches!(
            ma.update(&next, 0),
            Err(MachineError::Validation(ValidationError::SumMismatch))
        ));
        assert_eq!(ma.phase(), Phase::Acting);
    }

    #[test]
    fn update_rejects_version_jump() {
        let (mut ma, mut mb) = two_machines(17);
        open(&mut ma, &mut mb);

        let mut next = ma.state().unwrap().make_next_state().make_next_state();
        next.alloc = alloc(&[90, 110]);
        assert!(matches!(
            ma.update(&next, 0),
            Err(MachineError::Validation(ValidationError::Version))
        ));
    }

    #[test]
    fn update_rejects_foreign_channel_state() {
        let (mut ma, mut mb) = two_machines(18);
        let (other_a, _) = two_machines(19);
        open(&mut ma, &mut mb);

        let foreign = State::new(other_a.params(), alloc(&[100, 100]), vec![]).make_next_state();
        assert!(matches!(
            ma.update(&foreign, 0),
            Err(MachineError::Validation(ValidationError::IdMismatch))
        ));
    }

    #[test]
    fn update_rejects_out_of_range_actor() {
        let (mut ma, mut mb) = two_machines(20);
        open(&mut ma, &mut mb);

        let next = ma.state().unwrap().make_next_state();
        assert!(matches!(
            ma.update(&next, 2),
            Err(MachineError::Validation(ValidationError::Actor))
        ));
    }

    #[test]
    fn enable_update_in_acting_is_phase_error() {
        let (mut ma, mut mb) = two_machines(21);
        open(&mut ma, &mut mb);

        let version = ma.state().unwrap().version();
        let err = ma.enable_update().unwrap_err();
        assert!(matches!(err, MachineError::Transition(_)));
        assert_eq!(ma.phase(), Phase::Acting);
        assert_eq!(ma.state().unwrap().version(), version);
    }

    #[test]
    fn enable_update_requires_all_sigs() {
        let (mut ma, mut mb) = two_machines(22);
        open(&mut ma, &mut mb);

        let next = ma.state().unwrap().make_next_state();
        ma.update(&next, 0).unwrap();
        ma.sig().unwrap();
        assert!(matches!(
            ma.enable_update(),
            Err(MachineError::MissingSignature(1))
        ));
        assert_eq!(ma.phase(), Phase::Signing);
        let _ = mb;
    }

    #[test]
    fn discard_update_reverts_to_acting() {
        let (mut ma, mut mb) = two_machines(23);
        open(&mut ma, &mut mb);

        let next = ma.state().unwrap().make_next_state();
        ma.update(&next, 0).unwrap();
        ma.discard_update().unwrap();
        assert_eq!(ma.phase(), Phase::Acting);
        assert!(ma.staging_state().is_none());
        assert_eq!(ma.state().unwrap().version(), 0);
        let _ = mb;
    }

    #[test]
    fn add_sig_rejects_wrong_signer() {
        let (mut ma, mut mb) = two_machines(24);
        let mut rng = StdRng::seed_from_u64(25);
        let mallory = Signer::new(&mut rng);
        open(&mut ma, &mut mb);

        let next = ma.state().unwrap().make_next_state();
        ma.update(&next, 0).unwrap();
        let hash = wire::to_hash(&next).unwrap();
        assert!(matches!(
            ma.add_sig(1, mallory.sign(hash)),
            Err(MachineError::InvalidSignature(1))
        ));
        assert!(ma.staging_state().is_some());
    }

    #[test]
    fn add_sig_rejects_duplicate() {
        let (mut ma, mut mb) = two_machines(26);
        open(&mut ma, &mut mb);

        let next = ma.state().unwrap().make_next_state();
        ma.update(&next, 0).unwrap();
        mb.update(&next, 0).unwrap();
        let sb = mb.sig().unwrap();
        ma.add_sig(1, sb).unwrap();
        assert!(matches!(
            ma.add_sig(1, sb),
            Err(MachineError::AlreadySigned(1))
        ));
    }

    #[test]
    #[should_panic(expected = "participant index 2 out of range")]
    fn add_sig_out_of_range_panics() {
        let (mut ma, mut mb) = two_machines(27);
        open(&mut ma, &mut mb);
        let next = ma.state().unwrap().make_next_state();
        ma.update(&next, 0).unwrap();
        let sig = ma.sig().unwrap();
        let _ = ma.add_sig(2, sig);
    }

    #[test]
    fn finality_flag_must_match_target_phase() {
        let (mut ma, mut mb) = two_machines(28);
        open(&mut ma, &mut mb);

        let mut next = ma.state().unwrap().make_next_state();
        next.is_final = true;
        ma.update(&next, 0).unwrap();
        mb.update(&next, 0).unwrap();
        cross_sign(&mut ma, &mut mb);

        assert!(matches!(
            ma.enable_update(),
            Err(MachineError::Transition(_))
        ));
        assert_eq!(ma.phase(), Phase::Signing);
        ma.enable_final().unwrap();
        assert_eq!(ma.phase(), Phase::Final);
    }

    #[test]
    fn settle_after_final() {
        let (mut ma, mut mb) = two_machines(29);
        open(&mut ma, &mut mb);

        assert!(ma.settle_req().is_err());

        let mut next = ma.state().unwrap().make_next_state();
        next.is_final = true;
        ma.update(&next, 0).unwrap();
        mb.update(&next, 0).unwrap();
        cross_sign(&mut ma, &mut mb);
        ma.enable_final().unwrap();

        let req = ma.settle_req().unwrap();
        assert_eq!(req.tx.state.version(), 1);
        assert_eq!(req.idx, 0);

        ma.set_settled().unwrap();
        assert_eq!(ma.phase(), Phase::Settled);
        assert!(matches!(ma.set_settled(), Err(MachineError::Transition(_))));
    }

    #[test]
    fn phase_subscribers_are_notified() {
        let (mut ma, mut mb) = two_machines(30);
        let (tx, mut rx) = mpsc::unbounded_channel();
        ma.subscribe(Phase::Funding, "funder", tx);

        ma.init(alloc(&[100, 100]), vec![]).unwrap();
        mb.init(alloc(&[100, 100]), vec![]).unwrap();
        cross_sign(&mut ma, &mut mb);
        ma.enable_init().unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            PhaseTransition {
                from: Phase::InitSigning,
                to: Phase::Funding
            }
        );
    }

    #[test]
    fn same_name_subscription_overwrites() {
        let (mut ma, mut mb) = two_machines(31);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        ma.subscribe(Phase::Funding, "funder", tx1);
        ma.subscribe(Phase::Funding, "funder", tx2);

        ma.init(alloc(&[100, 100]), vec![]).unwrap();
        mb.init(alloc(&[100, 100]), vec![]).unwrap();
        cross_sign(&mut ma, &mut mb);
        ma.enable_init().unwrap();

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }
}
