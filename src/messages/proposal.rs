use bytes::{Buf, BufMut};

use crate::channel::Allocation;
use crate::types::{Address, Hash, U256};
use crate::wire::{self, get_bytes, get_list, put_bytes, put_list, Decode, Encode, WireError};

/// Proposes opening a channel.
///
/// `participant` is the proposer's fresh participant address (slot 0 of the
/// resulting parameter set); `peers` are the wire identities of both clients,
/// proposer first.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelProposal {
    pub challenge_duration: u64,
    pub nonce: U256,
    pub participant: Address,
    pub app: Address,
    pub init_data: Vec<u8>,
    pub init_bals: Allocation,
    pub peers: Vec<Address>,
}

impl ChannelProposal {
    /// Digest binding replies to this proposal.
    pub fn sess_id(&self) -> Result<Hash, WireError> {
        wire::to_hash(self)
    }
}

impl Encode for ChannelProposal {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.challenge_duration.encode(buf)?;
        self.nonce.encode(buf)?;
        self.participant.encode(buf)?;
        self.app.encode(buf)?;
        put_bytes(buf, &self.init_data)?;
        self.init_bals.encode(buf)?;
        put_list(buf, &self.peers)
    }
}

impl Decode for ChannelProposal {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(ChannelProposal {
            challenge_duration: u64::decode(buf)?,
            nonce: U256::decode(buf)?,
            participant: Address::decode(buf)?,
            app: Address::decode(buf)?,
            init_data: get_bytes(buf)?,
            init_bals: Allocation::decode(buf)?,
            peers: get_list(buf)?,
        })
    }
}

/// Positive reply to a [ChannelProposal], carrying the accepting
/// participant's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelProposalAcc {
    pub sess_id: Hash,
    pub participant: Address,
}

impl Encode for ChannelProposalAcc {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.sess_id.encode(buf)?;
        self.participant.encode(buf)
    }
}

impl Decode for ChannelProposalAcc {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(ChannelProposalAcc {
            sess_id: Hash::decode(buf)?,
            participant: Address::decode(buf)?,
        })
    }
}

/// Negative reply to a [ChannelProposal].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProposalRej {
    pub sess_id: Hash,
    pub reason: String,
}

impl Encode for ChannelProposalRej {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        self.sess_id.encode(buf)?;
        self.reason.encode(buf)
    }
}

impl Decode for ChannelProposalRej {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        Ok(ChannelProposalRej {
            sess_id: Hash::decode(buf)?,
            reason: String::decode(buf)?,
        })
    }
}
