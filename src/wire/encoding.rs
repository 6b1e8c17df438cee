use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::types::{Address, Hash, Signature, U256};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("length {0} exceeds the wire limit")]
    TooLong(usize),
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
}

/// Objects that can write themselves into the canonical wire encoding.
pub trait Encode {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError>;
}

/// Objects that can read themselves back from the canonical wire encoding.
pub trait Decode: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError>;
}

fn need<B: Buf>(buf: &B, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::UnexpectedEnd)
    } else {
        Ok(())
    }
}

/// Writes a u16 length prefix followed by the raw bytes.
pub fn put_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) -> Result<(), WireError> {
    let len = u16::try_from(bytes.len()).map_err(|_| WireError::TooLong(bytes.len()))?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

pub fn get_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, WireError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// Writes a u16 element count followed by the encoded elements.
pub fn put_list<T: Encode, B: BufMut>(buf: &mut B, items: &[T]) -> Result<(), WireError> {
    let len = u16::try_from(items.len()).map_err(|_| WireError::TooLong(items.len()))?;
    buf.put_u16(len);
    for item in items {
        item.encode(buf)?;
    }
    Ok(())
}

pub fn get_list<T: Decode, B: Buf>(buf: &mut B) -> Result<Vec<T>, WireError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        items.push(T::decode(buf)?);
    }
    Ok(items)
}

impl Encode for u16 {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        buf.put_u16(*self);
        Ok(())
    }
}

impl Decode for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, 2)?;
        Ok(buf.get_u16())
    }
}

impl Encode for u64 {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        buf.put_u64(*self);
        Ok(())
    }
}

impl Decode for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, 8)?;
        Ok(buf.get_u64())
    }
}

impl Encode for bool {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        buf.put_u8(*self as u8);
        Ok(())
    }
}

impl Decode for bool {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, 1)?;
        Ok(buf.get_u8() != 0)
    }
}

impl Encode for U256 {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        buf.put_slice(&bytes);
        Ok(())
    }
}

impl Decode for U256 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        need(buf, 32)?;
        let mut bytes = [0u8; 32];
        buf.copy_to_slice(&mut bytes);
        Ok(U256::from_big_endian(&bytes))
    }
}

impl Encode for String {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        put_bytes(buf, self.as_bytes())
    }
}

impl Decode for String {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        String::from_utf8(get_bytes(buf)?).map_err(|_| WireError::InvalidUtf8)
    }
}

macro_rules! impl_fixed_bytes_codec {
    ($T:ident) => {
        impl Encode for $T {
            fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
                buf.put_slice(&self.0);
                Ok(())
            }
        }

        impl Decode for $T {
            fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
                need(buf, $T::LEN)?;
                let mut bytes = [0u8; $T::LEN];
                buf.copy_to_slice(&mut bytes);
                Ok($T(bytes))
            }
        }
    };
}

impl_fixed_bytes_codec!(Address);
impl_fixed_bytes_codec!(Hash);
impl_fixed_bytes_codec!(Signature);

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn roundtrip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = BytesMut::new();
        value.encode(&mut buf).unwrap();
        let mut read = &buf[..];
        assert_eq!(T::decode(&mut read).unwrap(), value);
        assert_eq!(read.remaining(), 0);
    }

    #[test]
    fn primitive_roundtrips() {
        let mut rng = StdRng::seed_from_u64(7);
        roundtrip(0xbeefu16);
        roundtrip(0xdead_beef_cafe_f00du64);
        roundtrip(true);
        roundtrip(rng.gen::<U256>());
        roundtrip(rng.gen::<Address>());
        roundtrip(rng.gen::<Hash>());
        roundtrip(rng.gen::<Signature>());
        roundtrip(String::from("rejected: too large"));
    }

    #[test]
    fn bytes_roundtrip() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, b"hello").unwrap();
        let mut read = &buf[..];
        assert_eq!(get_bytes(&mut read).unwrap(), b"hello");
    }

    #[test]
    fn oversized_bytes_rejected() {
        let big = vec![0u8; (u16::MAX as usize) + 1];
        let mut buf = BytesMut::new();
        assert_eq!(
            put_bytes(&mut buf, &big),
            Err(WireError::TooLong(big.len()))
        );
    }

    #[test]
    fn truncated_input_errors() {
        let mut buf = BytesMut::new();
        U256::from(7).encode(&mut buf).unwrap();
        let mut read = &buf[..16];
        assert_eq!(U256::decode(&mut read), Err(WireError::UnexpectedEnd));

        let mut buf = BytesMut::new();
        put_bytes(&mut buf, b"abcdef").unwrap();
        let mut read = &buf[..4];
        assert_eq!(get_bytes(&mut read), Err(WireError::UnexpectedEnd));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, &[0xff, 0xfe]).unwrap();
        let mut read = &buf[..];
        assert_eq!(String::decode(&mut read), Err(WireError::InvalidUtf8));
    }
}
