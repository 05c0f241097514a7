//! Relay World client engine
//!
//! A multiplayer world client whose only backend is a set of public Nostr
//! relays: player positions, map chunks, tileset definitions and profiles
//! are signed events. This crate turns those loosely-ordered, at-most-once
//! streams into consistent in-memory game state, and turns local state
//! changes into deduplicated, rate-limited outbound events.
//!
//! ## Architecture
//!
//! ```text
//! Session  (session.rs)                ← identity, publishing, caches, fan-out
//!   ├── RelayTransport  (transport.rs) ← relay pool / in-memory seam
//!   ├── LocationSync    (location.rs)  ← roster, dedup, outbound throttle
//!   └── ChunkSync       (chunk.rs)     ← residency window, tile layers
//!         └── TilesetDefinition  (protocol.rs)
//! ```
//!
//! `Session` owns connectivity and caches; the two synchronizers are plain
//! state machines fed by the session's typed listener bus, so a renderer
//! (or a test) can drive them without touching the network.

pub mod chunk;
pub mod error;
pub mod events;
pub mod location;
pub mod protocol;
pub mod session;
pub mod tiled;
pub mod transport;
pub mod types;

// Convenience re-exports
pub use chunk::{ChunkFetch, ChunkSync, TileLayerSet};
pub use error::WorldClientError;
pub use events::{ListenerId, Listeners};
pub use location::{LocationSync, MovementStep, PositionPublisher, SeenCache};
pub use protocol::{ChunkPayload, EventDraft, LocationUpdate, Profile, TilesetDefinition};
pub use session::{LocalSigner, Session, Signer};
pub use transport::{MemoryRelay, RelayPool, RelayTransport, Subscription};
pub use types::{ChunkCoord, Facing, Vec2, WorldClientConfig, CHUNK_SIDE};
