//! Wire serialization: length-prefixed, tagged binary messages over a duplex
//! byte stream.
//!
//! Integers are big-endian fixed-width, byte strings carry a u16 length
//! prefix. The same canonical encoding doubles as the input to [to_hash],
//! which produces channel ids, session ids and the digests that get signed.

mod conn;
mod encoding;

pub use conn::{Conn, Dialer, Listener, TransportError, MAX_MSG_SIZE};
pub use encoding::{get_bytes, get_list, put_bytes, put_list, Decode, Encode, WireError};

use bytes::BytesMut;
use sha3::{Digest, Keccak256};

use crate::types::Hash;

/// Hashes the canonical encoding of `value` with Keccak256.
pub fn to_hash<T: Encode>(value: &T) -> Result<Hash, WireError> {
    let mut buf = BytesMut::new();
    value.encode(&mut buf)?;
    Ok(Hash(Keccak256::digest(&buf).into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::U256;

    #[test]
    fn hash_is_deterministic() {
        let a = U256::from(0x1234);
        let b = U256::from(0x1235);
        assert_eq!(to_hash(&a).unwrap(), to_hash(&a).unwrap());
        assert_ne!(to_hash(&a).unwrap(), to_hash(&b).unwrap());
    }
}
