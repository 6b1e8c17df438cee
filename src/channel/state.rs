use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut};

use super::allocation::Allocation;
use super::app::App;
use super::PartIdx;
use crate::types::{Address, Hash, Signature, U256};
use crate::wire::{self, get_bytes, put_bytes, put_list, Decode, Encode, WireError};

/// Immutable channel parameters. Their digest is the channel id.
#[derive(Clone)]
pub struct Params {
    challenge_duration: u64,
    parts: Vec<Address>,
    app: Arc<dyn App>,
    nonce: U256,
    id: Hash,
}

impl Params {
    pub fn new(
        challenge_duration: u64,
        parts: Vec<Address>,
        app: Arc<dyn App>,
        nonce: U256,
    ) -> Result<Self, WireError> {
        let mut params = Params {
            challenge_duration,
            parts,
            app,
            nonce,
            id: Hash::default(),
        };
        params.id = wire::to_hash(&params)?;
        Ok(params)
    }

    pub fn id(&self) -> Hash {
        self.id
    }

    pub fn challenge_duration(&self) -> u64 {
        self.challenge_duration
    }

    pub fn parts(&self) -> &[Address] {
        &self.parts
    }

    pub fn n(&self) -> PartIdx {
        self.parts.len() as PartIdx
    }

    pub fn app(&self) -> &Arc<dyn App> {
        &self.app
    }

    pub fn nonce(&self) -> U256 {
        self.nonce
    }

    /// Position of `addr` in the participant list.
    pub fn index_of(&self, addr: Address) -> Option<PartIdx> {
        self.parts
            .iter()
            .position(|p| *p == addr)
            .map(|i| i as PartIdx)
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Params")
            .field("id", &self.id)
            .field("challenge_duration", &self.challenge_duration)
            .field("parts", &self.parts)
            .field("app", &self.app.def())
            .field("nonce", &self.nonce)
            .finish()
    }
}

impl PartialEq for Params {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Encode for Params {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.challenge_duration.encode(buf)?;
        put_list(buf, &self.parts)?;
        self.app.def().encode(buf)?;
        self.nonce.encode(buf)
    }
}

/// A versioned snapshot of the channel's allocation plus application data.
///
/// States handed to the machine are cloned before staging; build successors
/// with [State::make_next_state] and mutate the clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    id: Hash,
    version: u64,
    app: Address,
    pub alloc: Allocation,
    pub data: Vec<u8>,
    pub is_final: bool,
}

impl State {
    /// The version-0 state for the given parameters.
    pub fn new(params: &Params, init_bals: Allocation, init_data: Vec<u8>) -> Self {
        State {
            id: params.id(),
            version: 0,
            app: params.app().def(),
            alloc: init_bals,
            data: init_data,
            is_final: false,
        }
    }

    pub fn id(&self) -> Hash {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn app(&self) -> Address {
        self.app
    }

    /// Clones the state with the version advanced by one.
    pub fn make_next_state(&self) -> State {
        let mut next = self.clone();
        next.version += 1;
        next
    }
}

impl Encode for State {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.id.encode(buf)?;
        self.version.encode(buf)?;
        self.app.encode(buf)?;
        self.alloc.encode(buf)?;
        put_bytes(buf, &self.data)?;
        self.is_final.encode(buf)
    }
}

impl Decode for State {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(State {
            id: Hash::decode(buf)?,
            version: u64::decode(buf)?,
            app: Address::decode(buf)?,
            alloc: Allocation::decode(buf)?,
            data: get_bytes(buf)?,
            is_final: bool::decode(buf)?,
        })
    }
}

/// A state together with the participants' signatures over it.
///
/// `sigs[i]` is either absent or a signature by `parts[i]`.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub state: State,
    pub sigs: Vec<Option<Signature>>,
}

impl Transaction {
    pub(crate) fn new(state: State, n: PartIdx) -> Self {
        Transaction {
            state,
            sigs: vec![None; n as usize],
        }
    }
}
