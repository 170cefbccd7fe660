//! Error taxonomy shared by the transport, sessions, and orchestrator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{SessionId, WireError};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Socket failure. Fatal to the current operation, never to the process.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Nothing arrived in time. Drives retry and abort decisions.
    #[error("no datagram within {0:?}")]
    Timeout(Duration),

    #[error("peer {0} unreachable: no discovery reply")]
    PeerUnreachable(SocketAddr),

    #[error("peer {peer} unresponsive: {reason}")]
    PeerUnresponsive { peer: SocketAddr, reason: String },

    #[error("session {session_id} from {peer} is already active")]
    DuplicateSession {
        peer: SocketAddr,
        session_id: SessionId,
    },

    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("transfer rejected by {peer}: {reason}")]
    Rejected { peer: SocketAddr, reason: String },

    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    #[error("failed to persist payload to {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed datagram: {0}")]
    Wire(#[from] WireError),
}

impl TransferError {
    /// Timeouts are expected and feed retry logic; everything else is a
    /// failure worth surfacing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout(_))
    }
}
