//! Tiled JSON export parsing.
//!
//! The CLI publishing tools read a map exported from the Tiled editor
//! (infinite-map layout, chunked layers) and convert every chunk and
//! tileset into relay events per the wire schema. Only the fields the
//! conversion needs are modelled; everything else in the export is ignored.

use serde::Deserialize;

use crate::protocol::{ChunkPayload, EventDraft, TilesetDefinition};

// ---------------------------------------------------------------------------
// Export shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TiledMap {
    #[serde(default)]
    pub layers: Vec<TiledLayer>,
    #[serde(default)]
    pub tilesets: Vec<TiledTileset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TiledLayer {
    pub name: String,
    /// Present for infinite maps; fixed-size maps carry a flat `data`
    /// array instead, which the publisher does not handle.
    #[serde(default)]
    pub chunks: Option<Vec<TiledChunk>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TiledChunk {
    pub data: Vec<u32>,
    pub width: u32,
    pub height: u32,
    /// World-tile offset of the chunk (multiples of the chunk side).
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TiledTileset {
    pub name: String,
    pub firstgid: u32,
    pub tilewidth: u32,
    pub tileheight: u32,
    #[serde(default)]
    pub margin: u32,
    #[serde(default)]
    pub spacing: u32,
    #[serde(default)]
    pub tiles: Option<Vec<TiledTile>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TiledTile {
    pub id: u32,
    #[serde(default)]
    pub properties: Vec<TiledProperty>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TiledProperty {
    pub name: String,
    pub value: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

impl TiledMap {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// One chunk event draft per chunk of every chunked layer.
    pub fn chunk_drafts(&self, world: &str) -> Vec<EventDraft> {
        self.layers
            .iter()
            .filter_map(|layer| layer.chunks.as_ref().map(|chunks| (layer, chunks)))
            .flat_map(|(layer, chunks)| {
                chunks.iter().map(move |chunk| {
                    ChunkPayload::draft(
                        world,
                        &layer.name,
                        chunk.x,
                        chunk.y,
                        chunk.width,
                        chunk.height,
                        &chunk.data,
                    )
                })
            })
            .collect()
    }

    /// Tileset definitions with the per-tile property maps filtered down
    /// to true-valued booleans (tiles left without one are dropped).
    pub fn tileset_definitions(&self) -> Vec<TilesetDefinition> {
        self.tilesets
            .iter()
            .map(|tileset| {
                let tile_properties = tileset
                    .tiles
                    .iter()
                    .flatten()
                    .filter_map(|tile| {
                        let props: std::collections::BTreeMap<String, bool> = tile
                            .properties
                            .iter()
                            .filter(|p| p.value == serde_json::Value::Bool(true))
                            .map(|p| (p.name.clone(), true))
                            .collect();
                        if props.is_empty() {
                            None
                        } else {
                            Some((tile.id, props))
                        }
                    })
                    .collect();

                TilesetDefinition {
                    name: tileset.name.clone(),
                    firstgid: tileset.firstgid,
                    tile_width: tileset.tilewidth,
                    tile_height: tileset.tileheight,
                    margin: tileset.margin,
                    spacing: tileset.spacing,
                    tile_properties,
                }
            })
            .collect()
    }

    /// One tileset event draft per tileset.
    pub fn tileset_drafts(&self, world: &str) -> Vec<EventDraft> {
        self.tileset_definitions()
            .iter()
            .map(|definition| definition.draft(world))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
