//! Peer record types.

use crate::Timestamp;
use std::net::SocketAddr;

/// Where a peer is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Record created, nothing attempted yet.
    Initialized,
    /// A dial or handshake is in flight.
    Connecting,
    /// A previous connection failed; waiting out the retry delay.
    Reconnecting,
    /// Handshake complete; messages are flowing.
    Peered,
    /// Gone, deliberately or not; terminal after an unpeer.
    Disconnected,
    /// State cannot be determined.
    Unknown,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PeerStatus::Initialized => "initialized",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Reconnecting => "reconnecting",
            PeerStatus::Peered => "peered",
            PeerStatus::Disconnected => "disconnected",
            PeerStatus::Unknown => "unknown",
        })
    }
}

/// A snapshot of one peer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The address this peer is (or was) reachable at.
    pub addr: SocketAddr,
    /// Where the peer is in its lifecycle.
    pub status: PeerStatus,
    /// When the most recent handshake completed, if one ever did.
    pub last_handshake: Option<Timestamp>,
}
