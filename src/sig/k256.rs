//! Signer using the pure-Rust `k256` ECDSA implementation.

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;

use super::{prefixed_msg_hash, pubkey_to_address};
use crate::types::{Address, Hash, Signature};

pub use k256::ecdsa::Error;

#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = pubkey_to_address(key.verifying_key().to_encoded_point(false).as_bytes());
        Signer { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Signs a hash, producing a 65-byte recoverable signature with the
    /// recovery id offset by 27 in the last byte.
    pub fn sign(&self, msg: Hash) -> Signature {
        let hash = prefixed_msg_hash(msg);

        // Signing a 32-byte prehash with a valid key cannot fail.
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(&hash.0)
            .expect("signing 32-byte prehash");

        let mut rs = [0u8; 64];
        rs.copy_from_slice(&sig.to_bytes());
        Signature::new(&rs, recid.to_byte() + 27)
    }
}

/// Recovers the signer address from a signature over `msg`.
pub fn recover(msg: Hash, sig: Signature) -> Result<Address, Error> {
    let hash = prefixed_msg_hash(msg);

    let recid = RecoveryId::from_byte(sig.0[64].wrapping_sub(27)).ok_or_else(Error::new)?;
    let signature = EcdsaSignature::from_slice(&sig.0[..64])?;
    let key = VerifyingKey::recover_from_prehash(&hash.0, &signature, recid)?;

    Ok(pubkey_to_address(key.to_encoded_point(false).as_bytes()))
}
