use thiserror::Error;

use crate::context::Ctx;
use crate::messages::{AuthResponse, Msg};
use crate::types::Address;
use crate::wire::{Conn, TransportError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unexpected message during address exchange")]
    UnexpectedMsg,
    #[error("peer address does not match the dialed address")]
    AddressMismatch,
    #[error("connection to own address rejected")]
    SelfConnection,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Authenticates a fresh connection by mutual address exchange: both sides
/// send their own address and receive the peer's. Runs before the connection
/// is registered, so an imposter cannot hijack an existing peer slot.
pub async fn exchange_addrs(ctx: &Ctx, own: Address, conn: &Conn) -> Result<Address, AuthError> {
    let exchange = async {
        let msg = Msg::AuthResponse(AuthResponse { addr: own });
        tokio::try_join!(conn.send(&msg), conn.recv())
    };

    let (_, reply) = tokio::select! {
        _ = ctx.done() => return Err(TransportError::Expired.into()),
        res = exchange => res?,
    };

    match reply {
        Msg::AuthResponse(AuthResponse { addr }) => Ok(addr),
        _ => Err(AuthError::UnexpectedMsg),
    }
}
