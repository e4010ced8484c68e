//! The address-supply boundary toward LAN peer discovery. Grounded on the
//! first `GameAnnouncement`-shaped lines of
//! `original_source/protocol/broadcast.py`; the UDP broadcast/listen loop
//! itself stays external to the core (spec.md §1), which only needs a
//! host address to hand the joiner.

use crate::model::PeerAddr;

/// `GAME_ANNOUNCEMENT {host_name, game_port}` as broadcast by a host
/// advertising an open game. The host's IP comes from the UDP sender
/// address, not the payload, so only the port travels on the wire. The core
/// never sends or parses this datagram itself; it is the shape a
/// [`PeerLocator`] resolves into a [`PeerAddr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameAnnouncement {
    pub host_name: String,
    pub game_port: u16,
}

/// Supplies a host address to a joiner, decoupling the core from however
/// that address was actually found (LAN broadcast listener, a typed-in
/// address, a lobby service). The core depends only on this trait.
pub trait PeerLocator: Send + Sync {
    /// Resolve the address of a host to join, or `None` if none is
    /// currently known.
    fn locate(&self) -> Option<PeerAddr>;
}

/// A [`PeerLocator`] that always returns a fixed, pre-known address —
/// useful for tests and for CLI invocations where the host address was
/// supplied directly on the command line.
pub struct StaticPeerLocator(PeerAddr);

impl StaticPeerLocator {
    pub fn new(addr: PeerAddr) -> Self {
        StaticPeerLocator(addr)
    }
}

impl PeerLocator for StaticPeerLocator {
    fn locate(&self) -> Option<PeerAddr> {
        Some(self.0.clone())
    }
}
