//! Relay wire schema.
//!
//! This module owns **every event shape that crosses the relay boundary**
//! between this client and any other participant (other clients, the CLI
//! publishing tools, pre-existing relay-side data).
//!
//! ## Event kinds
//!
//! | Kind    | Meaning             | Carried in                          |
//! |---------|---------------------|-------------------------------------|
//! | `0`     | profile metadata    | content JSON                        |
//! | `3`     | follow list         | repeated `["p", pubkey]` tags       |
//! | `31111` | player position     | `d`/`x`/`y` tags (replaceable per `d`) |
//! | `31112` | map chunk           | `d`/`layer`/`x`/`y`/`width`/`height` tags + flat tile array content |
//! | `31113` | tileset definition  | geometry tags + tile property map content |
//!
//! ## Design rules
//!
//! 1. Kind numbers and tag names are fixed integers/strings: they must
//!    match byte-for-byte or existing relay-side data becomes unreachable.
//! 2. Decoders return [`WorldClientError::MalformedEvent`] instead of
//!    panicking; a malformed event is dropped, never retried.
//! 3. Every outbound event is built as an [`EventDraft`] and signed by the
//!    session; nothing in this module touches key material.

use std::collections::BTreeMap;

use nostr_sdk::{Event, EventId, PublicKey, Tag, TagKind, Timestamp};

use crate::error::WorldClientError;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

pub const KIND_PROFILE: u16 = 0;
pub const KIND_FOLLOWS: u16 = 3;
pub const KIND_LOCATION: u16 = 31111;
pub const KIND_CHUNK: u16 = 31112;
pub const KIND_TILESET: u16 = 31113;

// ---------------------------------------------------------------------------
// Tag helpers
// ---------------------------------------------------------------------------

/// First value of the first tag named `name`, if any.
pub fn tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        if slice.first().map(String::as_str) == Some(name) {
            slice.get(1).map(String::as_str)
        } else {
            None
        }
    })
}

fn int_tag<T: std::str::FromStr>(event: &Event, name: &str) -> Result<T, WorldClientError> {
    tag_value(event, name)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| WorldClientError::missing_tag(name))
}

fn custom_tag(name: &str, value: impl Into<String>) -> Tag {
    Tag::custom(TagKind::custom(name), [value.into()])
}

/// Address tag for a replaceable location event:
/// `"31111:<pubkey-hex>:<worldId>"`.
pub fn location_address(pubkey: &PublicKey, world: &str) -> String {
    format!("{}:{}:{}", KIND_LOCATION, pubkey.to_hex(), world)
}

/// `d` tag of a chunk event: `"<world>:<layer>:<chunkKey>"` where the chunk
/// key is [`crate::types::ChunkCoord::key`] output.
pub fn chunk_d_tag(world: &str, layer: &str, chunk_key: &str) -> String {
    format!("{world}:{layer}:{chunk_key}")
}

/// `d` tag of a tileset definition event.
pub fn tileset_d_tag(world: &str, tileset_name: &str) -> String {
    format!("{world}:tileset:{tileset_name}")
}

// ---------------------------------------------------------------------------
// Outbound drafts
// ---------------------------------------------------------------------------

/// An unsigned, untimestamped event body. The session stamps `created_at`
/// and the author pubkey, signs, and hands the result to the transport.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Profiles (kind 0)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProfileMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
}

/// Cached profile entry. Overwritten whenever a newer kind-0 event for the
/// same pubkey is observed; never proactively invalidated in-session.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub pubkey: PublicKey,
    pub metadata: ProfileMetadata,
}

impl Profile {
    pub fn from_event(event: &Event) -> Result<Self, WorldClientError> {
        if event.kind.as_u16() != KIND_PROFILE {
            return Err(WorldClientError::MalformedEvent(format!(
                "expected kind {KIND_PROFILE}, got {}",
                event.kind.as_u16()
            )));
        }
        let metadata: ProfileMetadata = serde_json::from_str(&event.content)
            .map_err(|e| WorldClientError::MalformedEvent(format!("profile content: {e}")))?;
        Ok(Self {
            pubkey: event.pubkey,
            metadata,
        })
    }

    /// Name to render above the sprite.
    pub fn display_label(&self) -> &str {
        self.metadata
            .display_name
            .as_deref()
            .or(self.metadata.name.as_deref())
            .unwrap_or("Unknown")
    }
}

/// Pubkeys from the `["p", ...]` tags of a follow-list event. Unparseable
/// entries are skipped.
pub fn parse_follow_list(event: &Event) -> Vec<PublicKey> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let slice = tag.as_slice();
            if slice.first().map(String::as_str) == Some("p") {
                slice.get(1).and_then(|v| PublicKey::parse(v).ok())
            } else {
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Location events (kind 31111)
// ---------------------------------------------------------------------------

/// A decoded player position event.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub event_id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub world: String,
    pub x: i32,
    pub y: i32,
}

impl LocationUpdate {
    pub fn from_event(event: &Event) -> Result<Self, WorldClientError> {
        if event.kind.as_u16() != KIND_LOCATION {
            return Err(WorldClientError::MalformedEvent(format!(
                "expected kind {KIND_LOCATION}, got {}",
                event.kind.as_u16()
            )));
        }
        let world = tag_value(event, "d")
            .ok_or_else(|| WorldClientError::missing_tag("d"))?
            .to_string();
        Ok(Self {
            event_id: event.id,
            pubkey: event.pubkey,
            created_at: event.created_at,
            world,
            x: int_tag(event, "x")?,
            y: int_tag(event, "y")?,
        })
    }

    /// Outbound position event body for the given author.
    pub fn draft(world: &str, pubkey: &PublicKey, x: i32, y: i32) -> EventDraft {
        EventDraft {
            kind: KIND_LOCATION,
            tags: vec![
                custom_tag("a", location_address(pubkey, world)),
                Tag::identifier(world),
                custom_tag("x", x.to_string()),
                custom_tag("y", y.to_string()),
            ],
            content: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk events (kind 31112)
// ---------------------------------------------------------------------------

/// A decoded map-chunk event: a `height × width` grid of tile codes for one
/// named layer, anchored at a world-tile offset. Code `0` on the wire maps
/// to `None` (no tile).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPayload {
    pub layer: String,
    /// World-tile offset of the grid's top-left corner.
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    rows: Vec<Vec<Option<u32>>>,
}

impl ChunkPayload {
    pub fn from_event(event: &Event) -> Result<Self, WorldClientError> {
        if event.kind.as_u16() != KIND_CHUNK {
            return Err(WorldClientError::MalformedEvent(format!(
                "expected kind {KIND_CHUNK}, got {}",
                event.kind.as_u16()
            )));
        }
        let layer = tag_value(event, "layer")
            .ok_or_else(|| WorldClientError::missing_tag("layer"))?
            .to_string();
        let x: i32 = int_tag(event, "x")?;
        let y: i32 = int_tag(event, "y")?;
        let width: u32 = int_tag(event, "width")?;
        let height: u32 = int_tag(event, "height")?;

        let flat: Vec<u32> = serde_json::from_str(&event.content)
            .map_err(|e| WorldClientError::MalformedEvent(format!("chunk content: {e}")))?;
        if flat.len() != (width as usize) * (height as usize) {
            return Err(WorldClientError::MalformedEvent(format!(
                "chunk content has {} codes, expected {}",
                flat.len(),
                width * height
            )));
        }

        // Row stride comes from the width tag, never a hard-coded side.
        let rows = flat
            .chunks(width as usize)
            .map(|row| {
                row.iter()
                    .map(|&code| if code == 0 { None } else { Some(code) })
                    .collect()
            })
            .collect();

        Ok(Self {
            layer,
            x,
            y,
            width,
            height,
            rows,
        })
    }

    /// Decoded grid, `height` rows of `width` cells.
    pub fn rows(&self) -> &[Vec<Option<u32>>] {
        &self.rows
    }

    /// Outbound chunk event body. `codes` is the flat `width*height` array
    /// as exported (zeros included).
    pub fn draft(
        world: &str,
        layer: &str,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        codes: &[u32],
    ) -> EventDraft {
        EventDraft {
            kind: KIND_CHUNK,
            tags: vec![
                Tag::identifier(chunk_d_tag(world, layer, &format!("{x}:{y}"))),
                custom_tag("layer", layer),
                custom_tag("x", x.to_string()),
                custom_tag("y", y.to_string()),
                custom_tag("width", width.to_string()),
                custom_tag("height", height.to_string()),
            ],
            content: serde_json::to_string(codes).expect("tile codes always serialize"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tileset events (kind 31113)
// ---------------------------------------------------------------------------

/// Tileset geometry plus the per-tile boolean property map (local tile id →
/// property name → `true`). Only true-valued boolean properties survive the
/// wire; tiles with no true property are absent.
#[derive(Debug, Clone, PartialEq)]
pub struct TilesetDefinition {
    pub name: String,
    pub firstgid: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub margin: u32,
    pub spacing: u32,
    pub tile_properties: BTreeMap<u32, BTreeMap<String, bool>>,
}

impl TilesetDefinition {
    pub fn from_event(event: &Event) -> Result<Self, WorldClientError> {
        if event.kind.as_u16() != KIND_TILESET {
            return Err(WorldClientError::MalformedEvent(format!(
                "expected kind {KIND_TILESET}, got {}",
                event.kind.as_u16()
            )));
        }
        let name = tag_value(event, "name")
            .ok_or_else(|| WorldClientError::missing_tag("name"))?
            .to_string();

        let raw: BTreeMap<u32, BTreeMap<String, bool>> = serde_json::from_str(&event.content)
            .map_err(|e| WorldClientError::MalformedEvent(format!("tileset content: {e}")))?;

        Ok(Self {
            name,
            firstgid: int_tag(event, "firstgid")?,
            tile_width: int_tag(event, "tilewidth")?,
            tile_height: int_tag(event, "tileheight")?,
            margin: int_tag(event, "margin")?,
            spacing: int_tag(event, "spacing")?,
            tile_properties: filter_tile_properties(raw),
        })
    }

    /// True if the tileset marks this *global* tile id as colliding.
    pub fn collides(&self, global_id: u32) -> bool {
        global_id
            .checked_sub(self.firstgid)
            .and_then(|local| self.tile_properties.get(&local))
            .map(|props| props.get("collides").copied().unwrap_or(false))
            .unwrap_or(false)
    }

    /// Outbound tileset event body.
    pub fn draft(&self, world: &str) -> EventDraft {
        EventDraft {
            kind: KIND_TILESET,
            tags: vec![
                Tag::identifier(tileset_d_tag(world, &self.name)),
                custom_tag("name", &self.name),
                custom_tag("firstgid", self.firstgid.to_string()),
                custom_tag("tilewidth", self.tile_width.to_string()),
                custom_tag("tileheight", self.tile_height.to_string()),
                custom_tag("orientation", "orthogonal"),
                custom_tag("margin", self.margin.to_string()),
                custom_tag("spacing", self.spacing.to_string()),
            ],
            content: serde_json::to_string(&self.tile_properties)
                .expect("tile properties always serialize"),
        }
    }
}

/// Keep only true-valued properties; drop tiles left with none.
fn filter_tile_properties(
    raw: BTreeMap<u32, BTreeMap<String, bool>>,
) -> BTreeMap<u32, BTreeMap<String, bool>> {
    raw.into_iter()
        .filter_map(|(id, props)| {
            let props: BTreeMap<String, bool> =
                props.into_iter().filter(|(_, v)| *v).collect();
            if props.is_empty() {
                None
            } else {
                Some((id, props))
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::{EventBuilder, Keys, Kind};

    fn sign(draft: EventDraft, keys: &Keys) -> Event {
        EventBuilder::new(Kind::from(draft.kind), draft.content)
            .tags(draft.tags)
            .sign_with_keys(keys)
            .expect("test event signs")
    }

    // ---------------------------------------------------------------
    // Location events
    // ---------------------------------------------------------------

    #[test]
    fn location_roundtrip() {
        let keys = Keys::generate();
        let draft = LocationUpdate::draft("test", &keys.public_key(), 1400, -2400);
        let event = sign(draft, &keys);

        let update = LocationUpdate::from_event(&event).unwrap();
        assert_eq!(update.pubkey, keys.public_key());
        assert_eq!(update.world, "test");
        assert_eq!((update.x, update.y), (1400, -2400));
    }

    #[test]
    fn location_address_format() {
        let keys = Keys::generate();
        let a = location_address(&keys.public_key(), "test");
        assert_eq!(a, format!("31111:{}:test", keys.public_key().to_hex()));
    }

    #[test]
    fn location_missing_coordinate_is_malformed() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::from(KIND_LOCATION), "")
            .tags([Tag::identifier("test"), custom_tag("x", "10")])
            .sign_with_keys(&keys)
            .unwrap();
        assert!(matches!(
            LocationUpdate::from_event(&event),
            Err(WorldClientError::MalformedEvent(_))
        ));
    }

    #[test]
    fn location_non_numeric_coordinate_is_malformed() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::from(KIND_LOCATION), "")
            .tags([
                Tag::identifier("test"),
                custom_tag("x", "ten"),
                custom_tag("y", "4"),
            ])
            .sign_with_keys(&keys)
            .unwrap();
        assert!(LocationUpdate::from_event(&event).is_err());
    }

    // ---------------------------------------------------------------
    // Chunk events
    // ---------------------------------------------------------------

    #[test]
    fn chunk_of_zeros_decodes_to_empty_sentinels() {
        let keys = Keys::generate();
        let codes = vec![0u32; 256];
        let event = sign(
            ChunkPayload::draft("test", "World", 0, 0, 16, 16, &codes),
            &keys,
        );

        let chunk = ChunkPayload::from_event(&event).unwrap();
        assert_eq!(chunk.rows().len(), 16);
        for row in chunk.rows() {
            assert_eq!(row.len(), 16);
            assert!(row.iter().all(Option::is_none));
        }
    }

    #[test]
    fn chunk_reshape_uses_width_tag() {
        let keys = Keys::generate();
        // 4 wide, 2 tall: stride must follow the tag, not a fixed side
        let codes = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let event = sign(
            ChunkPayload::draft("test", "World", 32, 48, 4, 2, &codes),
            &keys,
        );

        let chunk = ChunkPayload::from_event(&event).unwrap();
        assert_eq!(chunk.rows().len(), 2);
        assert_eq!(chunk.rows()[0], vec![Some(1), Some(2), Some(3), Some(4)]);
        assert_eq!(chunk.rows()[1], vec![Some(5), Some(6), Some(7), Some(8)]);
        assert_eq!((chunk.x, chunk.y), (32, 48));
    }

    #[test]
    fn chunk_wrong_length_is_malformed() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::from(KIND_CHUNK), "[1,2,3]")
            .tags([
                Tag::identifier(chunk_d_tag("test", "World", "0:0")),
                custom_tag("layer", "World"),
                custom_tag("x", "0"),
                custom_tag("y", "0"),
                custom_tag("width", "16"),
                custom_tag("height", "16"),
            ])
            .sign_with_keys(&keys)
            .unwrap();
        assert!(ChunkPayload::from_event(&event).is_err());
    }

    #[test]
    fn chunk_non_array_content_is_malformed() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::from(KIND_CHUNK), "{\"not\":\"tiles\"}")
            .tags([
                custom_tag("layer", "World"),
                custom_tag("x", "0"),
                custom_tag("y", "0"),
                custom_tag("width", "1"),
                custom_tag("height", "1"),
            ])
            .sign_with_keys(&keys)
            .unwrap();
        assert!(ChunkPayload::from_event(&event).is_err());
    }

    #[test]
    fn chunk_d_tag_matches_fetch_side_derivation() {
        // Producer derives from Tiled chunk offsets, consumer from ChunkCoord
        // keys, and both must land on the same string.
        let coord = crate::types::ChunkCoord::new(2, 4);
        assert_eq!(
            chunk_d_tag("test", "World", &coord.key()),
            "test:World:32:64"
        );
    }

    // ---------------------------------------------------------------
    // Tileset events
    // ---------------------------------------------------------------

    fn tileset_fixture() -> TilesetDefinition {
        TilesetDefinition {
            name: "overworld".into(),
            firstgid: 1,
            tile_width: 32,
            tile_height: 32,
            margin: 1,
            spacing: 2,
            tile_properties: BTreeMap::from([(
                5,
                BTreeMap::from([("collides".to_string(), true)]),
            )]),
        }
    }

    #[test]
    fn tileset_roundtrip_preserves_filtered_properties() {
        let keys = Keys::generate();
        let tileset = tileset_fixture();
        let event = sign(tileset.draft("test"), &keys);

        let decoded = TilesetDefinition::from_event(&event).unwrap();
        assert_eq!(decoded, tileset);
        assert_eq!(decoded.tile_properties.len(), 1);
        assert!(decoded.tile_properties[&5]["collides"]);
    }

    #[test]
    fn tileset_decode_drops_false_properties() {
        let keys = Keys::generate();
        let content = r#"{"5":{"collides":true},"7":{"collides":false},"9":{}}"#;
        let event = EventBuilder::new(Kind::from(KIND_TILESET), content)
            .tags([
                Tag::identifier(tileset_d_tag("test", "overworld")),
                custom_tag("name", "overworld"),
                custom_tag("firstgid", "1"),
                custom_tag("tilewidth", "32"),
                custom_tag("tileheight", "32"),
                custom_tag("margin", "0"),
                custom_tag("spacing", "0"),
            ])
            .sign_with_keys(&keys)
            .unwrap();

        let decoded = TilesetDefinition::from_event(&event).unwrap();
        assert_eq!(decoded.tile_properties.len(), 1);
        assert!(decoded.tile_properties.contains_key(&5));
    }

    #[test]
    fn collides_applies_firstgid_offset() {
        let tileset = tileset_fixture();
        // local id 5 + firstgid 1 → global 6
        assert!(tileset.collides(6));
        assert!(!tileset.collides(5));
        assert!(!tileset.collides(0));
    }

    // ---------------------------------------------------------------
    // Profiles & follows
    // ---------------------------------------------------------------

    #[test]
    fn profile_parse_and_label() {
        let keys = Keys::generate();
        let event = EventBuilder::new(
            Kind::from(KIND_PROFILE),
            r#"{"name":"alice","about":"wanderer"}"#,
        )
        .sign_with_keys(&keys)
        .unwrap();

        let profile = Profile::from_event(&event).unwrap();
        assert_eq!(profile.pubkey, keys.public_key());
        assert_eq!(profile.display_label(), "alice");
    }

    #[test]
    fn profile_prefers_display_name() {
        let keys = Keys::generate();
        let event = EventBuilder::new(
            Kind::from(KIND_PROFILE),
            r#"{"name":"a","display_name":"Alice"}"#,
        )
        .sign_with_keys(&keys)
        .unwrap();
        assert_eq!(Profile::from_event(&event).unwrap().display_label(), "Alice");
    }

    #[test]
    fn profile_bad_json_is_malformed() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::from(KIND_PROFILE), "not json")
            .sign_with_keys(&keys)
            .unwrap();
        assert!(Profile::from_event(&event).is_err());
    }

    #[test]
    fn follow_list_extracts_p_tags() {
        let keys = Keys::generate();
        let a = Keys::generate().public_key();
        let b = Keys::generate().public_key();
        let event = EventBuilder::new(Kind::from(KIND_FOLLOWS), "")
            .tags([
                custom_tag("p", a.to_hex()),
                custom_tag("p", b.to_hex()),
                custom_tag("p", "garbage"),
                custom_tag("e", a.to_hex()),
            ])
            .sign_with_keys(&keys)
            .unwrap();

        let follows = parse_follow_list(&event);
        assert_eq!(follows, vec![a, b]);
    }
}
