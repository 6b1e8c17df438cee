use core::fmt::{self, Debug, Display};

use rand::{distributions::Standard, prelude::Distribution};
use uint::construct_uint;

macro_rules! impl_hex_fmt {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! bytes_newtype {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl $T {
            pub const LEN: usize = $N;
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                let mut buf = [0u8; $N];
                rng.fill_bytes(&mut buf);
                $T(buf)
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_fmt!($T);
    };
}

/// Identifies a participant (or a peer on the wire). Derived from the
/// participant's public key.
bytes_newtype!(Address, 20);

/// 32-byte digest. Channel IDs and session IDs are hashes over canonical
/// encodings.
bytes_newtype!(Hash, 32);

/// 65-byte recoverable signature, `r ‖ s ‖ v`.
bytes_newtype!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

construct_uint! {
    /// Unsigned 256-bit integer used for balances and nonces.
    pub struct U256(4);
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}
