//! Messages exchanged between channel clients.
//!
//! Every message starts with a 1-byte type tag followed by its payload. The
//! `ChannelUpdate*` family exposes the channel id it refers to, which the
//! receive path uses to route messages to their channel.

mod proposal;
mod update;

pub use proposal::{ChannelProposal, ChannelProposalAcc, ChannelProposalRej};
pub use update::{ChannelUpdate, ChannelUpdateAcc, ChannelUpdateRej};

use bytes::{Buf, BufMut};

use crate::types::{Address, Hash};
use crate::wire::{Decode, Encode, WireError};

/// Wire message type tags. Stable within a deployment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Ping = 0,
    Pong = 1,
    AuthResponse = 2,
    ChannelProposal = 3,
    ChannelProposalAcc = 4,
    ChannelProposalRej = 5,
    ChannelUpdate = 6,
    ChannelUpdateAcc = 7,
    ChannelUpdateRej = 8,
}

impl TryFrom<u8> for Tag {
    type Error = WireError;

    fn try_from(tag: u8) -> Result<Self, WireError> {
        Ok(match tag {
            0 => Tag::Ping,
            1 => Tag::Pong,
            2 => Tag::AuthResponse,
            3 => Tag::ChannelProposal,
            4 => Tag::ChannelProposalAcc,
            5 => Tag::ChannelProposalRej,
            6 => Tag::ChannelUpdate,
            7 => Tag::ChannelUpdateAcc,
            8 => Tag::ChannelUpdateRej,
            other => return Err(WireError::UnknownTag(other)),
        })
    }
}

/// Sent during the authentication handshake; carries the sender's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResponse {
    pub addr: Address,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Ping,
    Pong,
    AuthResponse(AuthResponse),
    ChannelProposal(ChannelProposal),
    ChannelProposalAcc(ChannelProposalAcc),
    ChannelProposalRej(ChannelProposalRej),
    ChannelUpdate(ChannelUpdate),
    ChannelUpdateAcc(ChannelUpdateAcc),
    ChannelUpdateRej(ChannelUpdateRej),
}

impl Msg {
    pub fn tag(&self) -> Tag {
        match self {
            Msg::Ping => Tag::Ping,
            Msg::Pong => Tag::Pong,
            Msg::AuthResponse(_) => Tag::AuthResponse,
            Msg::ChannelProposal(_) => Tag::ChannelProposal,
            Msg::ChannelProposalAcc(_) => Tag::ChannelProposalAcc,
            Msg::ChannelProposalRej(_) => Tag::ChannelProposalRej,
            Msg::ChannelUpdate(_) => Tag::ChannelUpdate,
            Msg::ChannelUpdateAcc(_) => Tag::ChannelUpdateAcc,
            Msg::ChannelUpdateRej(_) => Tag::ChannelUpdateRej,
        }
    }

    /// The channel this message is routed to, for the update family.
    pub fn channel_id(&self) -> Option<Hash> {
        match self {
            Msg::ChannelUpdate(m) => Some(m.state.id()),
            Msg::ChannelUpdateAcc(m) => Some(m.id),
            Msg::ChannelUpdateRej(m) => Some(m.alt.id()),
            _ => None,
        }
    }
}

impl Encode for Msg {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        buf.put_u8(self.tag() as u8);
        match self {
            Msg::Ping | Msg::Pong => Ok(()),
            Msg::AuthResponse(m) => m.addr.encode(buf),
            Msg::ChannelProposal(m) => m.encode(buf),
            Msg::ChannelProposalAcc(m) => m.encode(buf),
            Msg::ChannelProposalRej(m) => m.encode(buf),
            Msg::ChannelUpdate(m) => m.encode(buf),
            Msg::ChannelUpdateAcc(m) => m.encode(buf),
            Msg::ChannelUpdateRej(m) => m.encode(buf),
        }
    }
}

impl Decode for Msg {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < 1 {
            return Err(WireError::UnexpectedEnd);
        }
        Ok(match Tag::try_from(buf.get_u8())? {
            Tag::Ping => Msg::Ping,
            Tag::Pong => Msg::Pong,
            Tag::AuthResponse => Msg::AuthResponse(AuthResponse {
                addr: Address::decode(buf)?,
            }),
            Tag::ChannelProposal => Msg::ChannelProposal(ChannelProposal::decode(buf)?),
            Tag::ChannelProposalAcc => Msg::ChannelProposalAcc(ChannelProposalAcc::decode(buf)?),
            Tag::ChannelProposalRej => Msg::ChannelProposalRej(ChannelProposalRej::decode(buf)?),
            Tag::ChannelUpdate => Msg::ChannelUpdate(ChannelUpdate::decode(buf)?),
            Tag::ChannelUpdateAcc => Msg::ChannelUpdateAcc(ChannelUpdateAcc::decode(buf)?),
            Tag::ChannelUpdateRej => Msg::ChannelUpdateRej(ChannelUpdateRej::decode(buf)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Allocation, Asset, NullApp, Params, State};
    use crate::types::{Signature, U256};
    use bytes::BytesMut;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::Arc;

    fn roundtrip(msg: Msg) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf).unwrap();
        let mut read = &buf[..];
        assert_eq!(Msg::decode(&mut read).unwrap(), msg);
        assert_eq!(read.len(), 0);
    }

    fn test_state(rng: &mut StdRng) -> State {
        let params = Params::new(
            10,
            vec![rng.gen(), rng.gen()],
            Arc::new(NullApp),
            rng.gen(),
        )
        .unwrap();
        let alloc = Allocation::new(
            vec![Asset::default()],
            vec![vec![U256::from(100)], vec![U256::from(100)]],
        );
        State::new(&params, alloc, b"data".to_vec())
    }

    #[test]
    fn roundtrip_every_message_type() {
        let mut rng = StdRng::seed_from_u64(40);
        let state = test_state(&mut rng);

        roundtrip(Msg::Ping);
        roundtrip(Msg::Pong);
        roundtrip(Msg::AuthResponse(AuthResponse { addr: rng.gen() }));
        roundtrip(Msg::ChannelProposal(ChannelProposal {
            challenge_duration: 10,
            nonce: rng.gen(),
            participant: rng.gen(),
            app: rng.gen(),
            init_data: b"init".to_vec(),
            init_bals: state.alloc.clone(),
            peers: vec![rng.gen(), rng.gen()],
        }));
        roundtrip(Msg::ChannelProposalAcc(ChannelProposalAcc {
            sess_id: rng.gen(),
            participant: rng.gen(),
        }));
        roundtrip(Msg::ChannelProposalRej(ChannelProposalRej {
            sess_id: rng.gen(),
            reason: "no thanks".into(),
        }));
        roundtrip(Msg::ChannelUpdate(ChannelUpdate {
            state: state.clone(),
            actor_idx: 1,
            sig: rng.gen(),
        }));
        roundtrip(Msg::ChannelUpdateAcc(ChannelUpdateAcc {
            id: state.id(),
            version: 3,
            sig: rng.gen(),
        }));
        roundtrip(Msg::ChannelUpdateRej(ChannelUpdateRej {
            reason: "too large".into(),
            alt: state,
            actor_idx: 0,
            sig: rng.gen(),
        }));
    }

    #[test]
    fn channel_id_projection() {
        let mut rng = StdRng::seed_from_u64(41);
        let state = test_state(&mut rng);
        let id = state.id();

        assert_eq!(Msg::Ping.channel_id(), None);
        assert_eq!(
            Msg::ChannelUpdate(ChannelUpdate {
                state: state.clone(),
                actor_idx: 0,
                sig: Signature::default(),
            })
            .channel_id(),
            Some(id)
        );
        assert_eq!(
            Msg::ChannelUpdateAcc(ChannelUpdateAcc {
                id,
                version: 1,
                sig: Signature::default(),
            })
            .channel_id(),
            Some(id)
        );
        assert_eq!(
            Msg::ChannelUpdateRej(ChannelUpdateRej {
                reason: String::new(),
                alt: state,
                actor_idx: 0,
                sig: Signature::default(),
            })
            .channel_id(),
            Some(id)
        );
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut read = &[0xffu8][..];
        assert_eq!(Msg::decode(&mut read), Err(WireError::UnknownTag(0xff)));
    }
}
