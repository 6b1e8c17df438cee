use bytes::{Buf, BufMut};

use crate::channel::{PartIdx, State};
use crate::types::{Hash, Signature};
use crate::wire::{Decode, Encode, WireError};

/// Proposes a new channel state, signed by the sender.
///
/// `actor_idx` is the participant whose action produced the new state; in the
/// two-party protocol it must be the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    pub state: State,
    pub actor_idx: PartIdx,
    pub sig: Signature,
}

impl Encode for ChannelUpdate {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.state.encode(buf)?;
        self.actor_idx.encode(buf)?;
        self.sig.encode(buf)
    }
}

impl Decode for ChannelUpdate {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(ChannelUpdate {
            state: State::decode(buf)?,
            actor_idx: PartIdx::decode(buf)?,
            sig: Signature::decode(buf)?,
        })
    }
}

/// Positive reply to a [ChannelUpdate], carrying the sender's signature on
/// the accepted state. Version 0 doubles as the initial-state exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelUpdateAcc {
    pub id: Hash,
    pub version: u64,
    pub sig: Signature,
}

impl Encode for ChannelUpdateAcc {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.id.encode(buf)?;
        self.version.encode(buf)?;
        self.sig.encode(buf)
    }
}

impl Decode for ChannelUpdateAcc {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(ChannelUpdateAcc {
            id: Hash::decode(buf)?,
            version: u64::decode(buf)?,
            sig: Signature::decode(buf)?,
        })
    }
}

/// Negative reply to a [ChannelUpdate]. `alt` is the sender's current state
/// with the sender's signature over it, as dispute material for the
/// proposer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdateRej {
    pub reason: String,
    pub alt: State,
    pub actor_idx: PartIdx,
    pub sig: Signature,
}

impl Encode for ChannelUpdateRej {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.reason.encode(buf)?;
        self.alt.encode(buf)?;
        self.actor_idx.encode(buf)?;
        self.sig.encode(buf)
    }
}

impl Decode for ChannelUpdateRej {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(ChannelUpdateRej {
            reason: String::decode(buf)?,
            alt: State::decode(buf)?,
            actor_idx: PartIdx::decode(buf)?,
            sig: Signature::decode(buf)?,
        })
    }
}
