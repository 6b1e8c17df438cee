//! Creation and verification of recoverable ECDSA signatures.
//!
//! The backends can be enabled/disabled with the equally named feature flags.
//! [Error] and [Signer] are re-exported from the selected backend; if both
//! feature flags are present, [secp256k1] wins over the default [k256].

use sha3::{Digest, Keccak256};

use crate::types::{Address, Hash, Signature};

#[cfg(feature = "k256")]
pub mod k256;
#[cfg(feature = "secp256k1")]
pub mod secp256k1;

#[cfg(not(any(feature = "secp256k1", feature = "k256")))]
compile_error!(
    "Signature dependency needed, use one of the following feature flags: 'secp256k1', 'k256'"
);

#[cfg(all(not(feature = "secp256k1"), feature = "k256"))]
pub use self::k256::{recover, Error, Signer};
#[cfg(feature = "secp256k1")]
pub use self::secp256k1::{recover, Error, Signer};

/// Checks that `sig` was produced over `hash` by the holder of `addr`.
pub fn verify(hash: Hash, sig: Signature, addr: Address) -> Result<bool, Error> {
    Ok(recover(hash, sig)? == addr)
}

/// Prefixes a hash with `\x19Ethereum Signed Message\n<length>` and rehashes,
/// the format the on-chain adjudicator verifies against.
fn prefixed_msg_hash(hash: Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Derives the address from an uncompressed (65-byte) public key encoding.
fn pubkey_to_address(uncompressed: &[u8]) -> Address {
    // The first byte is the SEC1 encoding prefix, not part of the key.
    let hash: [u8; 32] = Keccak256::digest(&uncompressed[1..]).into();
    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash[32 - 20..]);
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn sign_and_recover() {
        let mut rng = StdRng::seed_from_u64(0);
        let signer = Signer::new(&mut rng);
        let msg: Hash = rng.gen();

        let sig = signer.sign(msg);
        assert_eq!(recover(msg, sig).unwrap(), signer.address());
        assert!(verify(msg, sig, signer.address()).unwrap());
    }

    #[test]
    fn tampered_message_does_not_verify() {
        let mut rng = StdRng::seed_from_u64(1);
        let signer = Signer::new(&mut rng);
        let msg: Hash = rng.gen();
        let other: Hash = rng.gen();

        let sig = signer.sign(msg);
        assert!(!verify(other, sig, signer.address()).unwrap());
    }

    #[test]
    fn wrong_signer_does_not_verify() {
        let mut rng = StdRng::seed_from_u64(2);
        let alice = Signer::new(&mut rng);
        let bob = Signer::new(&mut rng);
        assert_ne!(alice.address(), bob.address());

        let msg: Hash = rng.gen();
        let sig = alice.sign(msg);
        assert!(!verify(msg, sig, bob.address()).unwrap());
    }

    #[cfg(all(feature = "secp256k1", feature = "k256"))]
    #[test]
    fn backends_agree() {
        let mut rng = StdRng::seed_from_u64(3);
        let signer = super::k256::Signer::new(&mut rng);
        let msg: Hash = rng.gen();

        let sig = signer.sign(msg);
        assert_eq!(
            super::secp256k1::recover(msg, sig).unwrap(),
            signer.address()
        );
    }
}
