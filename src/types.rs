//! Core world types shared across all modules.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tiles per chunk side. Chunk keys embed world-tile offsets (`cx * 16`),
/// so this is part of the wire contract, not a tuning knob.
pub const CHUNK_SIDE: i32 = 16;

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn distance(&self, other: Vec2) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Round to the integer grid used for outbound position events.
    pub fn rounded(&self) -> (i32, i32) {
        (self.x.round() as i32, self.y.round() as i32)
    }
}

impl std::fmt::Display for Vec2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.y)
    }
}

// ---------------------------------------------------------------------------
// Facing
// ---------------------------------------------------------------------------

/// Cardinal facing of a player sprite. Diagonal displacement snaps to the
/// dominant axis; exact ties keep the previous facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facing {
    Up,
    Down,
    Left,
    Right,
}

impl Default for Facing {
    fn default() -> Self {
        Facing::Down
    }
}

// ---------------------------------------------------------------------------
// Spatial chunking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub cx: i32,
    pub cy: i32,
}

impl ChunkCoord {
    pub fn new(cx: i32, cy: i32) -> Self {
        Self { cx, cy }
    }

    /// Chunk containing a continuous world position.
    pub fn from_world(pos: Vec2, tile_size: u32) -> Self {
        let span = (tile_size as i32 * CHUNK_SIDE) as f32;
        Self {
            cx: (pos.x / span).floor() as i32,
            cy: (pos.y / span).floor() as i32,
        }
    }

    /// Relay-side chunk key: `"<cx*16>:<cy*16>"`.
    ///
    /// The key embeds world-tile offsets, not chunk indices, so every producer
    /// and consumer must derive it identically to hit the same `d` filter.
    pub fn key(&self) -> String {
        format!("{}:{}", self.cx * CHUNK_SIDE, self.cy * CHUNK_SIDE)
    }

    /// Invert [`ChunkCoord::key`]. Returns `None` for anything that is not
    /// a pair of tile offsets on the chunk grid.
    pub fn parse_key(key: &str) -> Option<Self> {
        let (x, y) = key.split_once(':')?;
        let x: i32 = x.parse().ok()?;
        let y: i32 = y.parse().ok()?;
        if x % CHUNK_SIDE != 0 || y % CHUNK_SIDE != 0 {
            return None;
        }
        Some(Self::new(x / CHUNK_SIDE, y / CHUNK_SIDE))
    }

    /// Chebyshev distance to another chunk.
    pub fn chebyshev(&self, other: ChunkCoord) -> i32 {
        (self.cx - other.cx).abs().max((self.cy - other.cy).abs())
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.cx, self.cy)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldClientConfig {
    /// Shared world identifier: the `d` tag scope for every location event.
    pub world_id: String,
    /// Relay endpoints. Events fan out to all of them; inbound frames are
    /// deduplicated by event id across connections.
    pub relays: Vec<String>,
    /// Width/height of a single tile in world units.
    pub tile_size: u32,
    /// How many chunks to load around the viewer (Chebyshev radius).
    pub load_distance: i32,
    /// Chunks further than this (Chebyshev) from the viewer are evicted.
    /// Must exceed `load_distance` or visible chunks would churn.
    pub retention_distance: i32,
    /// Tile layer names, in draw order.
    pub layers: Vec<String>,
    /// Layer whose tiles participate in collision.
    pub collision_layer: String,
    /// Movement speed used to derive remote interpolation durations
    /// (world units per second).
    pub move_speed: f32,
    /// Minimum seconds between outbound position publishes.
    pub publish_interval_secs: u64,
    /// Seconds an observed event id stays in the dedup window.
    pub dedup_ttl_secs: u64,
    /// Deadline for one-shot relay queries.
    pub query_timeout_secs: u64,
    /// Tileset name used to form the bootstrap `d` tag.
    pub tileset_name: String,
    /// Deadline for the tileset bootstrap fetch.
    pub tileset_timeout_secs: u64,
    /// Default spawn position before the first self location event arrives.
    pub spawn: Vec2,
}

impl Default for WorldClientConfig {
    fn default() -> Self {
        Self {
            world_id: "test".into(),
            relays: vec![
                "wss://relay.damus.io".into(),
                "wss://nos.lol".into(),
                "wss://relay.nostr.band".into(),
                "wss://nostr-pub.wellorder.net".into(),
                "wss://relay.snort.social".into(),
            ],
            tile_size: 32,
            load_distance: 1,
            retention_distance: 3,
            layers: vec![
                "Below Player".into(),
                "World".into(),
                "Above Player".into(),
            ],
            collision_layer: "World".into(),
            move_speed: 200.0,
            publish_interval_secs: 1,
            dedup_ttl_secs: 60,
            query_timeout_secs: 10,
            tileset_name: "default".into(),
            tileset_timeout_secs: 10,
            spawn: Vec2::new(1400.0, 2400.0),
        }
    }
}

impl WorldClientConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn tileset_timeout(&self) -> Duration {
        Duration::from_secs(self.tileset_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
