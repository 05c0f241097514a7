//! Chunk synchronization – the loaded window of map tiles around a moving
//! viewpoint.
//!
//! `ChunkSync` is deliberately transport-free: `poll_position` returns the
//! `d` tags to fetch when the viewer crosses a chunk boundary, the session
//! performs the query, and decoded payloads come back through `apply`. The
//! same separation the server side of this architecture uses between
//! computing tick events and publishing them.

use std::collections::HashMap;

use crate::protocol::{chunk_d_tag, ChunkPayload, TilesetDefinition};
use crate::types::{ChunkCoord, Vec2, WorldClientConfig, CHUNK_SIDE};

// ---------------------------------------------------------------------------
// Tile storage
// ---------------------------------------------------------------------------

/// Sparse tile grids for a fixed set of named layers, keyed by world-tile
/// coordinates. Empty cells are simply absent.
pub struct TileLayerSet {
    layers: HashMap<String, HashMap<(i32, i32), u32>>,
}

impl TileLayerSet {
    pub fn new(layer_names: &[String]) -> Self {
        Self {
            layers: layer_names
                .iter()
                .map(|name| (name.clone(), HashMap::new()))
                .collect(),
        }
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    /// Write a decoded chunk into its layer. A `None` cell clears whatever
    /// was there: a rewritten chunk fully replaces its footprint.
    pub fn apply_chunk(&mut self, payload: &ChunkPayload) -> bool {
        let Some(grid) = self.layers.get_mut(&payload.layer) else {
            return false;
        };

        for (row_index, row) in payload.rows().iter().enumerate() {
            for (col_index, cell) in row.iter().enumerate() {
                let at = (
                    payload.x + col_index as i32,
                    payload.y + row_index as i32,
                );
                match cell {
                    Some(code) => {
                        grid.insert(at, *code);
                    }
                    None => {
                        grid.remove(&at);
                    }
                }
            }
        }
        true
    }

    /// Tile code at a world-tile coordinate, if any.
    pub fn tile_at(&self, layer: &str, tx: i32, ty: i32) -> Option<u32> {
        self.layers.get(layer)?.get(&(tx, ty)).copied()
    }

    /// Non-empty tiles across all layers.
    pub fn tile_count(&self) -> usize {
        self.layers.values().map(HashMap::len).sum()
    }

    /// Drop every tile whose chunk lies outside the Chebyshev `retention`
    /// radius of `center`.
    pub fn evict_outside(&mut self, center: ChunkCoord, retention: i32) {
        for grid in self.layers.values_mut() {
            grid.retain(|&(tx, ty), _| {
                let chunk = ChunkCoord::new(tx.div_euclid(CHUNK_SIDE), ty.div_euclid(CHUNK_SIDE));
                chunk.chebyshev(center) <= retention
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk sync
// ---------------------------------------------------------------------------

/// A batch of chunk events to fetch: one scoped query covering every layer
/// of every chunk in the residency window.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFetch {
    /// Relay-side `d` tags (`"<world>:<layer>:<chunkKey>"`).
    pub d_tags: Vec<String>,
    /// The chunk keys the window covers, for logging/diagnostics.
    pub keys: Vec<String>,
}

/// Result of applying one chunk payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkApplied {
    pub layer: String,
    pub origin: (i32, i32),
    pub width: u32,
    pub height: u32,
}

/// Maintains the resident tile window around the viewer and keeps it
/// reactive to chunk events.
///
/// Construction requires a [`TilesetDefinition`]: chunk decoding is
/// structurally blocked until the tileset bootstrap has completed.
pub struct ChunkSync {
    world_id: String,
    tile_size: u32,
    load_distance: i32,
    retention_distance: i32,
    collision_layer: String,
    layer_names: Vec<String>,
    tileset: TilesetDefinition,
    layers: TileLayerSet,
    last_chunk: Option<ChunkCoord>,
}

impl ChunkSync {
    pub fn new(config: &WorldClientConfig, tileset: TilesetDefinition) -> Self {
        Self {
            world_id: config.world_id.clone(),
            tile_size: config.tile_size,
            load_distance: config.load_distance,
            retention_distance: config.retention_distance,
            collision_layer: config.collision_layer.clone(),
            layer_names: config.layers.clone(),
            layers: TileLayerSet::new(&config.layers),
            tileset,
            last_chunk: None,
        }
    }

    pub fn tileset(&self) -> &TilesetDefinition {
        &self.tileset
    }

    pub fn layers(&self) -> &TileLayerSet {
        &self.layers
    }

    /// Chunk currently containing the viewer, if any position was seen.
    pub fn current_chunk(&self) -> Option<ChunkCoord> {
        self.last_chunk
    }

    /// Feed the viewer position for this tick.
    ///
    /// Returns a fetch request when the containing chunk changed (including
    /// the first call); `None` while the viewer stays inside one chunk.
    /// Tiles outside the retention radius are evicted on every boundary
    /// crossing.
    pub fn poll_position(&mut self, viewer: Vec2) -> Option<ChunkFetch> {
        let chunk = ChunkCoord::from_world(viewer, self.tile_size);
        if self.last_chunk == Some(chunk) {
            return None;
        }
        self.last_chunk = Some(chunk);

        self.layers.evict_outside(chunk, self.retention_distance);

        let mut keys = Vec::new();
        for dx in -self.load_distance..=self.load_distance {
            for dy in -self.load_distance..=self.load_distance {
                keys.push(ChunkCoord::new(chunk.cx + dx, chunk.cy + dy).key());
            }
        }

        let mut d_tags = Vec::with_capacity(self.layer_names.len() * keys.len());
        for layer in &self.layer_names {
            for key in &keys {
                d_tags.push(chunk_d_tag(&self.world_id, layer, key));
            }
        }

        Some(ChunkFetch { d_tags, keys })
    }

    /// Apply a decoded chunk event. Unknown layers are dropped with a
    /// diagnostic.
    pub fn apply(&mut self, payload: &ChunkPayload) -> Option<ChunkApplied> {
        if !self.layers.apply_chunk(payload) {
            log::warn!(
                "chunk event for unknown layer '{}' at ({}, {}) – dropped",
                payload.layer,
                payload.x,
                payload.y
            );
            return None;
        }
        log::debug!(
            "applied {}x{} chunk to '{}' at ({}, {})",
            payload.width,
            payload.height,
            payload.layer,
            payload.x,
            payload.y
        );
        Some(ChunkApplied {
            layer: payload.layer.clone(),
            origin: (payload.x, payload.y),
            width: payload.width,
            height: payload.height,
        })
    }

    pub fn tile_at(&self, layer: &str, tx: i32, ty: i32) -> Option<u32> {
        self.layers.tile_at(layer, tx, ty)
    }

    /// True when the collision layer holds a solid tile at this coordinate.
    pub fn collides_at(&self, tx: i32, ty: i32) -> bool {
        self.layers
            .tile_at(&self.collision_layer, tx, ty)
            .map(|code| self.tileset.collides(code))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
