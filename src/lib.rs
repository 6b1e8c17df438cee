//! Off-chain two-party payment channels.
//!
//! A channel is a shared balance allocation two participants update
//! cooperatively: every update produces a new fully-signed state either
//! party could submit on-chain to enforce settlement. This crate provides
//! the per-channel signing automaton, the proposal and update protocols
//! driving it, and the peer registry the protocols run on. Signing,
//! funding, settlement and the byte transport are pluggable.

pub mod channel;
pub mod client;
mod context;
pub mod messages;
pub mod peer;
pub mod sig;
mod types;
pub mod wire;

pub use client::Client;
pub use context::Ctx;
pub use types::{Address, Hash, Signature, U256};
