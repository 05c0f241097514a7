//! Location synchronization – roster state machines, inbound dedup and the
//! outbound publish throttle.
//!
//! Everything here is pure state-machine code: the session feeds decoded
//! [`LocationUpdate`]s in and publishes what the throttle hands back. No
//! network I/O, no clocks other than the dedup TTL, so the ordering
//! properties are testable without a relay.
//!
//! Conflict policy is **last-processed-wins** per (player, position):
//! whichever update is processed last sticks, regardless of `created_at`.
//! This is a documented property of the system, not an oversight.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nostr_sdk::{EventId, PublicKey};

use crate::protocol::LocationUpdate;
use crate::types::{Facing, Vec2};

// ---------------------------------------------------------------------------
// Dedup cache
// ---------------------------------------------------------------------------

/// Sliding-window dedup of observed event ids.
///
/// Each entry carries its own TTL, refreshed on every sighting; expired
/// entries are pruned opportunistically. A duplicate delivered after its
/// entry expired is treated as new; the window bounds memory, it does not
/// promise exactly-once forever.
pub struct SeenCache {
    ttl: Duration,
    entries: HashMap<EventId, Instant>,
}

impl SeenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record a sighting. Returns `true` when the id has not been seen
    /// within the window (i.e. the event should be processed).
    pub fn observe(&mut self, id: EventId) -> bool {
        let ttl = self.ttl;
        self.entries.retain(|_, seen_at| seen_at.elapsed() < ttl);

        let fresh = !self.entries.contains_key(&id);
        self.entries.insert(id, Instant::now());
        fresh
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Movement
// ---------------------------------------------------------------------------

/// A continuous transition for the presentation layer to animate: move from
/// `from` to `to` over `duration`, facing `facing` while walking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementStep {
    pub from: Vec2,
    pub to: Vec2,
    pub duration: Duration,
    pub facing: Facing,
}

/// Derive the animated transition between two positions.
///
/// Duration comes from Euclidean distance at `speed` (world units/sec).
/// Facing snaps to the dominant displacement axis; an exact tie (which
/// includes perfect diagonals) keeps `last_facing`; there is no diagonal
/// walk animation.
pub fn movement_step(from: Vec2, to: Vec2, speed: f32, last_facing: Facing) -> MovementStep {
    let dx = to.x - from.x;
    let dy = to.y - from.y;

    let facing = if dx.abs() > dy.abs() {
        if dx > 0.0 {
            Facing::Right
        } else {
            Facing::Left
        }
    } else if dy.abs() > dx.abs() {
        if dy > 0.0 {
            Facing::Down
        } else {
            Facing::Up
        }
    } else {
        last_facing
    };

    let distance = from.distance(to);
    let duration = if speed > 0.0 {
        Duration::from_secs_f32(distance / speed)
    } else {
        Duration::ZERO
    };

    MovementStep {
        from,
        to,
        duration,
        facing,
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// A remote participant with a known position.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePlayer {
    pub pubkey: PublicKey,
    pub position: Vec2,
    pub facing: Facing,
}

/// State change produced by applying one location update.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationNotice {
    /// The self player snapped to its first observed self-authored position.
    /// Happens at most once per session.
    SelfAnchored { position: Vec2 },
    /// First event for a remote pubkey: instantiate at the event position.
    RemoteJoined { pubkey: PublicKey, position: Vec2 },
    /// Subsequent event for a known remote: animate to the new position.
    RemoteMoved {
        pubkey: PublicKey,
        step: MovementStep,
    },
}

/// Tracks the self anchor and every remote player observed in the world.
pub struct LocationSync {
    self_pubkey: PublicKey,
    move_speed: f32,
    self_position: Vec2,
    self_anchored: bool,
    remotes: HashMap<PublicKey, RemotePlayer>,
}

impl LocationSync {
    /// `spawn` is the provisional self position used until the first
    /// self-authored location event arrives.
    pub fn new(self_pubkey: PublicKey, spawn: Vec2, move_speed: f32) -> Self {
        Self {
            self_pubkey,
            move_speed,
            self_position: spawn,
            self_anchored: false,
            remotes: HashMap::new(),
        }
    }

    /// Apply one (already deduplicated) location update.
    ///
    /// Self-authored events anchor the self position exactly once;
    /// afterwards they are position no-ops, since local movement originates
    /// locally and the events exist to inform other clients.
    pub fn apply(&mut self, update: &LocationUpdate) -> Option<LocationNotice> {
        let target = Vec2::new(update.x as f32, update.y as f32);

        if update.pubkey == self.self_pubkey {
            if self.self_anchored {
                return None;
            }
            self.self_position = target;
            self.self_anchored = true;
            return Some(LocationNotice::SelfAnchored { position: target });
        }

        match self.remotes.get_mut(&update.pubkey) {
            None => {
                self.remotes.insert(
                    update.pubkey,
                    RemotePlayer {
                        pubkey: update.pubkey,
                        position: target,
                        facing: Facing::default(),
                    },
                );
                Some(LocationNotice::RemoteJoined {
                    pubkey: update.pubkey,
                    position: target,
                })
            }
            Some(player) => {
                let step = movement_step(player.position, target, self.move_speed, player.facing);
                player.position = target;
                player.facing = step.facing;
                Some(LocationNotice::RemoteMoved {
                    pubkey: update.pubkey,
                    step,
                })
            }
        }
    }

    /// Current self position (input-driven once anchored).
    pub fn self_position(&self) -> Vec2 {
        self.self_position
    }

    pub fn self_anchored(&self) -> bool {
        self.self_anchored
    }

    /// Move the self player locally (called by the input layer).
    pub fn set_self_position(&mut self, position: Vec2) {
        self.self_position = position;
    }

    pub fn remote(&self, pubkey: &PublicKey) -> Option<&RemotePlayer> {
        self.remotes.get(pubkey)
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub fn remotes(&self) -> impl Iterator<Item = &RemotePlayer> {
        self.remotes.values()
    }
}

// ---------------------------------------------------------------------------
// Outbound throttle
// ---------------------------------------------------------------------------

/// Decides when the local position is worth publishing.
///
/// The session drives this from a fixed-period timer; between ticks nothing
/// is published, so the rate is bounded by the interval regardless of how
/// often the player moves. A tick publishes only when the rounded position
/// differs from the last published one.
pub struct PositionPublisher {
    interval: Duration,
    last_published: Option<(i32, i32)>,
}

impl PositionPublisher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_published: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Mark `position` as already published (used at spawn so the default
    /// origin is not broadcast before the player moves).
    pub fn prime(&mut self, position: Vec2) {
        self.last_published = Some(position.rounded());
    }

    /// Rounded coordinates to publish this tick, or `None` when the
    /// position is unchanged since the last publish.
    pub fn take_update(&mut self, current: Vec2) -> Option<(i32, i32)> {
        let rounded = current.rounded();
        if self.last_published == Some(rounded) {
            return None;
        }
        self.last_published = Some(rounded);
        Some(rounded)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
