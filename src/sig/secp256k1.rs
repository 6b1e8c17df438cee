//! Signer using the secp256k1 C library.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, Secp256k1, SecretKey};

use super::{prefixed_msg_hash, pubkey_to_address};
use crate::types::{Address, Hash, Signature};

pub use secp256k1::Error;

#[derive(Debug)]
pub struct Signer {
    secp: Secp256k1<All>,
    key: SecretKey,
    addr: Address,
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let secp = Secp256k1::new();
        let (key, pk) = secp.generate_keypair(rng);
        let addr = pubkey_to_address(&pk.serialize_uncompressed());
        Signer { secp, key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Signs a hash, producing a 65-byte recoverable signature with the
    /// recovery id offset by 27 in the last byte.
    pub fn sign(&self, msg: Hash) -> Signature {
        let hash = prefixed_msg_hash(msg);

        let sig = self
            .secp
            .sign_ecdsa_recoverable(&Message::from_digest(hash.0), &self.key);
        let (recid, rs) = sig.serialize_compact();

        Signature::new(&rs, recid.to_i32() as u8 + 27)
    }
}

/// Recovers the signer address from a signature over `msg`.
pub fn recover(msg: Hash, sig: Signature) -> Result<Address, Error> {
    let hash = prefixed_msg_hash(msg);

    let recid = RecoveryId::from_i32(sig.0[64].wrapping_sub(27).into())?;
    let signature = RecoverableSignature::from_compact(&sig.0[..64], recid)?;

    let secp = Secp256k1::verification_only();
    let pk = secp.recover_ecdsa(&Message::from_digest(hash.0), &signature)?;

    Ok(pubkey_to_address(&pk.serialize_uncompressed()))
}
