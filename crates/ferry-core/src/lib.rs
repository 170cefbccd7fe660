//! ferry-core: wire format, configuration, and the shared error taxonomy.
//! All other Ferry crates depend on this one.

pub mod config;
pub mod error;
pub mod wire;

pub use error::TransferError;
pub use wire::{Chunk, Message, PeerIdentity, SessionId};
