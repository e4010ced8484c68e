//! PokeProtocol battle session engine.
//!
//! This crate implements the protocol core shared by two battling trainer
//! peers and any number of read-mostly spectators: a text codec over
//! datagrams, a retransmitting reliability layer, a deterministic shared
//! RNG, the damage-calculation engine, and the turn-based state machine
//! that ties them together. External collaborators the core depends on
//! but does not implement — a creature/move catalog, LAN peer discovery,
//! sticker validation — are expressed as traits in [`model`], [`discovery`]
//! and [`chat`].

pub mod chat;
pub mod codec;
pub mod damage;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod model;
pub mod reliability;
pub mod rng;
pub mod session;
pub mod transport;

pub mod prelude {
    pub use crate::chat::{ChatContentType, NoOpStickerPolicy, StickerPolicy};
    pub use crate::discovery::{GameAnnouncement, PeerLocator, StaticPeerLocator};
    pub use crate::engine::{Engine, EngineSnapshot};
    pub use crate::error::{CodecError, EngineError, ReliabilityError};
    pub use crate::model::{Creature, DamageCategory, InMemoryMoveCatalog, Move, MoveCatalog, PeerAddr, Role, TurnOwner};
    pub use crate::session::Phase;
    pub use crate::transport::{Transport, UdpTransport};
}
