use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::encoding::{Decode, Encode, WireError};
use crate::context::Ctx;
use crate::messages::Msg;
use crate::types::Address;

/// Maximum encoded message size; the frame header is a u16 payload length.
pub const MAX_MSG_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("context expired")]
    Expired,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A framed message connection over any duplex byte stream.
///
/// Sends and receives are serialized independently, so one task may sit in
/// `recv` while others send.
pub struct Conn {
    send: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    recv: Mutex<Box<dyn AsyncRead + Send + Unpin>>,
    closed: AtomicBool,
}

impl Conn {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Conn {
            send: Mutex::new(Box::new(w)),
            recv: Mutex::new(Box::new(r)),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn send(&self, msg: &Msg) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut buf = BytesMut::new();
        msg.encode(&mut buf)?;
        if buf.len() > MAX_MSG_SIZE {
            return Err(WireError::TooLong(buf.len()).into());
        }

        let mut w = self.send.lock().await;
        w.write_all(&(buf.len() as u16).to_be_bytes()).await?;
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn recv(&self) -> Result<Msg, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut r = self.recv.lock().await;
        let mut header = [0u8; 2];
        r.read_exact(&mut header).await?;
        let len = u16::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;
        drop(r);

        let mut read = &payload[..];
        Ok(Msg::decode(&mut read)?)
    }

    /// Shuts down the write side. Exactly once; a second close is an error.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Closed);
        }
        self.send.lock().await.shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Establishes outbound connections to peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, ctx: &Ctx, addr: Address) -> Result<Conn, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// Accepts inbound connections from peers.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Conn, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AuthResponse, Msg};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn conn_pair() -> (Conn, Conn) {
        let (a, b) = tokio::io::duplex(4096);
        (Conn::new(a), Conn::new(b))
    }

    #[tokio::test]
    async fn send_and_recv() {
        let mut rng = StdRng::seed_from_u64(1);
        let (a, b) = conn_pair();
        let msg = Msg::AuthResponse(AuthResponse { addr: rng.gen() });
        a.send(&msg).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (a, b) = conn_pair();
        a.send(&Msg::Ping).await.unwrap();
        a.send(&Msg::Pong).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Msg::Ping);
        assert_eq!(b.recv().await.unwrap(), Msg::Pong);
    }

    #[tokio::test]
    async fn double_close_errors() {
        let (a, _b) = conn_pair();
        a.close().await.unwrap();
        assert!(matches!(a.close().await, Err(TransportError::Closed)));
        assert!(matches!(a.send(&Msg::Ping).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn recv_fails_after_remote_close() {
        let (a, b) = conn_pair();
        drop(a);
        assert!(matches!(b.recv().await, Err(TransportError::Io(_))));
    }
}
