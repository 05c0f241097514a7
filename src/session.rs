//! Session – connection/login lifecycle, identity, caches and outbound
//! publishing.
//!
//! One session per application, constructed explicitly by the application
//! root and shared by reference with every consumer. It owns:
//!
//! - the signing identity (held keys *or* an injected external signer),
//! - the profile cache and follow list,
//! - the standing world-scoped location subscription and its dedup window,
//! - the typed listener registries every consumer hangs off.
//!
//! Publishing mutates no local state: updates come back through the
//! subscription (or are applied optimistically by the caller).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use nostr_sdk::nips::nip19::FromBech32;
use nostr_sdk::{
    Event, EventBuilder, EventId, Filter, Keys, Kind, PublicKey, SecretKey, UnsignedEvent,
};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::WorldClientError;
use crate::events::{ConnectionState, ConnectionUpdate, Listeners};
use crate::location::{PositionPublisher, SeenCache};
use crate::protocol::{
    parse_follow_list, tileset_d_tag, ChunkPayload, EventDraft, LocationUpdate, Profile,
    TilesetDefinition, KIND_CHUNK, KIND_FOLLOWS, KIND_LOCATION, KIND_PROFILE, KIND_TILESET,
};
use crate::transport::RelayTransport;
use crate::types::{Vec2, WorldClientConfig};

// ---------------------------------------------------------------------------
// Signing seam
// ---------------------------------------------------------------------------

/// External signing capability (the browser-extension analogue): something
/// that can reveal a public key and sign events without ever handing the
/// secret to this process.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn public_key(&self) -> Result<PublicKey, WorldClientError>;
    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, WorldClientError>;
}

/// Signer over locally held keys.
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn public_key(&self) -> Result<PublicKey, WorldClientError> {
        Ok(self.keys.public_key())
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, WorldClientError> {
        unsigned
            .sign_with_keys(&self.keys)
            .map_err(|_| WorldClientError::SigningUnavailable)
    }
}

// ---------------------------------------------------------------------------
// Listener registries
// ---------------------------------------------------------------------------

/// All session fan-out points. Notification order follows registration
/// order; every callback runs inside the bus fault boundary.
#[derive(Default)]
pub struct SessionListeners {
    pub connection: Listeners<ConnectionUpdate>,
    pub profile: Listeners<Profile>,
    pub location: Listeners<LocationUpdate>,
    pub chunk: Listeners<ChunkPayload>,
}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

/// State shared between the session handle and its background tasks.
struct Core {
    config: WorldClientConfig,
    transport: Arc<dyn RelayTransport>,
    external_signer: RwLock<Option<Arc<dyn Signer>>>,
    keys: RwLock<Option<Keys>>,
    pubkey: RwLock<Option<PublicKey>>,
    profiles: RwLock<HashMap<PublicKey, Profile>>,
    profile_fetches: Mutex<HashSet<PublicKey>>,
    follows: RwLock<Vec<PublicKey>>,
    seen: Mutex<SeenCache>,
    listeners: SessionListeners,
}

impl Core {
    async fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, WorldClientError> {
        let keys = self.keys.read().clone();
        if let Some(keys) = keys {
            return unsigned
                .sign_with_keys(&keys)
                .map_err(|_| WorldClientError::SigningUnavailable);
        }
        let signer = self.external_signer.read().clone();
        match signer {
            Some(signer) => signer.sign_event(unsigned).await,
            None => Err(WorldClientError::SigningUnavailable),
        }
    }

    async fn publish_event(&self, draft: EventDraft) -> Result<EventId, WorldClientError> {
        let pubkey = (*self.pubkey.read()).ok_or(WorldClientError::NotAuthenticated)?;

        let unsigned = EventBuilder::new(Kind::from(draft.kind), draft.content)
            .tags(draft.tags)
            .build(pubkey);

        let event = self.sign(unsigned).await?;
        self.transport.publish(event).await
    }

    async fn publish_location(&self, x: i32, y: i32) -> Result<EventId, WorldClientError> {
        let pubkey = (*self.pubkey.read()).ok_or(WorldClientError::NotAuthenticated)?;
        let draft = LocationUpdate::draft(&self.config.world_id, &pubkey, x, y);
        self.publish_event(draft).await
    }

    /// One-shot query where a transport failure resolves as an empty
    /// completion instead of propagating, so dependent initialization keeps
    /// going and a later event can still fill the gap.
    async fn query_or_empty(&self, filter: Filter) -> Vec<Event> {
        match self.transport.query(filter).await {
            Ok(events) => events,
            Err(e) => {
                log::warn!("one-shot query failed, treating as empty: {e}");
                Vec::new()
            }
        }
    }

    async fn fetch_profile(&self, pubkey: PublicKey) -> Option<Profile> {
        let filter = Filter::new()
            .kind(Kind::from(KIND_PROFILE))
            .author(pubkey)
            .limit(1);
        let events = self.query_or_empty(filter).await;
        let latest = events.into_iter().max_by_key(|e| e.created_at)?;

        match Profile::from_event(&latest) {
            Ok(profile) => {
                self.profiles.write().insert(pubkey, profile.clone());
                self.listeners.profile.emit(&profile);
                Some(profile)
            }
            Err(e) => {
                log::debug!("dropping malformed profile for {pubkey}: {e}");
                None
            }
        }
    }

    async fn fetch_follow_list(&self, pubkey: PublicKey) -> Vec<PublicKey> {
        let filter = Filter::new()
            .kind(Kind::from(KIND_FOLLOWS))
            .author(pubkey)
            .limit(1);
        let events = self.query_or_empty(filter).await;
        let Some(latest) = events.into_iter().max_by_key(|e| e.created_at) else {
            return Vec::new();
        };

        let list = parse_follow_list(&latest);
        log::debug!("fetched {} followed pubkeys", list.len());
        *self.follows.write() = list.clone();
        list
    }

    /// Dedup, decode and fan out one location event. Returns whether the
    /// listeners were notified.
    fn deliver_location(&self, event: &Event) -> bool {
        if !self.seen.lock().observe(event.id) {
            log::debug!("skipping duplicate location event {}", event.id);
            return false;
        }
        match LocationUpdate::from_event(event) {
            Ok(update) => {
                self.listeners.location.emit(&update);
                true
            }
            Err(e) => {
                log::debug!("dropping malformed location event {}: {e}", event.id);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    core: Arc<Core>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(config: WorldClientConfig, transport: Arc<dyn RelayTransport>) -> Self {
        let seen = SeenCache::new(config.dedup_ttl());
        Self {
            core: Arc::new(Core {
                config,
                transport,
                external_signer: RwLock::new(None),
                keys: RwLock::new(None),
                pubkey: RwLock::new(None),
                profiles: RwLock::new(HashMap::new()),
                profile_fetches: Mutex::new(HashSet::new()),
                follows: RwLock::new(Vec::new()),
                seen: Mutex::new(seen),
                listeners: SessionListeners::default(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Inject an external signing capability. Call before `connect`; a held
    /// private key still takes precedence (the two strategies are mutually
    /// exclusive once connected).
    pub fn install_signer(&self, signer: Arc<dyn Signer>) {
        *self.core.external_signer.write() = Some(signer);
    }

    pub fn config(&self) -> &WorldClientConfig {
        &self.core.config
    }

    pub fn listeners(&self) -> &SessionListeners {
        &self.core.listeners
    }

    pub fn pubkey(&self) -> Option<PublicKey> {
        *self.core.pubkey.read()
    }

    pub fn is_connected(&self) -> bool {
        self.core.pubkey.read().is_some()
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    /// Resolve an identity and bring the session up.
    ///
    /// Identity comes from held keys when present, otherwise from the
    /// injected external signer; with neither available this fails with
    /// [`WorldClientError::SigningUnavailable`]. On success the own profile
    /// and follow list are fetched best-effort in the background, the
    /// standing location subscription is opened, and the resolved public
    /// key is returned without waiting for any network round-trip.
    pub async fn connect(&self) -> Result<PublicKey, WorldClientError> {
        let held = self.core.keys.read().clone();
        let pubkey = match held {
            Some(keys) => keys.public_key(),
            None => {
                let signer = self.core.external_signer.read().clone();
                match signer {
                    Some(signer) => signer.public_key().await?,
                    None => return Err(WorldClientError::SigningUnavailable),
                }
            }
        };

        *self.core.pubkey.write() = Some(pubkey);
        self.core.listeners.connection.emit(&ConnectionUpdate {
            state: ConnectionState::Active,
            pubkey: Some(pubkey),
        });

        self.spawn_profile_fetch(pubkey);
        self.spawn_follow_fetch(pubkey);
        self.spawn_location_pump();

        Ok(pubkey)
    }

    /// Decode a bech32-encoded secret key, store it, and connect.
    ///
    /// The returned public key is derived from the key material itself;
    /// no network round-trip is involved in computing it.
    pub async fn connect_with_encoded_key(
        &self,
        encoded: &str,
    ) -> Result<PublicKey, WorldClientError> {
        let secret = SecretKey::from_bech32(encoded)
            .map_err(|e| WorldClientError::InvalidKeyFormat(e.to_string()))?;
        let keys = Keys::new(secret);
        let pubkey = keys.public_key();
        *self.core.keys.write() = Some(keys);

        self.connect().await?;
        Ok(pubkey)
    }

    /// Tear down background tasks and the transport. Idempotent.
    pub async fn dispose(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let was_connected = self.core.pubkey.write().take().is_some();
        self.core.transport.shutdown().await;
        if was_connected {
            self.core.listeners.connection.emit(&ConnectionUpdate {
                state: ConnectionState::Disconnected,
                pubkey: None,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Sign and broadcast an event draft.
    ///
    /// Fails with [`WorldClientError::NotAuthenticated`] before `connect`
    /// and [`WorldClientError::SigningUnavailable`] when no signing path
    /// exists. Local state is never mutated here.
    pub async fn publish_event(&self, draft: EventDraft) -> Result<EventId, WorldClientError> {
        self.core.publish_event(draft).await
    }

    /// Publish the local player position for this world.
    pub async fn publish_location(&self, x: i32, y: i32) -> Result<EventId, WorldClientError> {
        self.core.publish_location(x, y).await
    }

    // -----------------------------------------------------------------------
    // Profiles & follows
    // -----------------------------------------------------------------------

    /// Own cached profile, if it has arrived.
    pub fn profile(&self) -> Option<Profile> {
        let pubkey = self.pubkey()?;
        self.core.profiles.read().get(&pubkey).cloned()
    }

    /// Cached profile for any pubkey. A miss triggers a background fetch
    /// and returns `None` immediately; the profile listeners deliver the
    /// result later. Callers must not assume synchronous availability.
    pub fn profile_by_pubkey(&self, pubkey: PublicKey) -> Option<Profile> {
        if let Some(profile) = self.core.profiles.read().get(&pubkey) {
            return Some(profile.clone());
        }
        self.spawn_profile_fetch(pubkey);
        None
    }

    /// Pubkeys from the most recently fetched follow list.
    pub fn follows(&self) -> Vec<PublicKey> {
        self.core.follows.read().clone()
    }

    /// Fetch and cache a profile right now (the awaitable form of the
    /// background fetch; for consumers that can wait).
    pub async fn fetch_profile(&self, pubkey: PublicKey) -> Option<Profile> {
        self.core.fetch_profile(pubkey).await
    }

    /// Fetch the follow list for `pubkey` and retain it on the session.
    pub async fn fetch_follow_list(&self, pubkey: PublicKey) -> Vec<PublicKey> {
        self.core.fetch_follow_list(pubkey).await
    }

    // -----------------------------------------------------------------------
    // Locations
    // -----------------------------------------------------------------------

    /// One-shot fetch of every stored location event for this world, used
    /// to seed the roster at scene start. Notifies the location listeners
    /// through the same dedup window as the live subscription. Returns the
    /// number of updates delivered.
    pub async fn fetch_location_snapshot(&self) -> usize {
        let filter = Filter::new()
            .kind(Kind::from(KIND_LOCATION))
            .identifier(self.core.config.world_id.clone());
        let events = self.core.query_or_empty(filter).await;

        let mut delivered = 0;
        for event in events {
            if self.core.deliver_location(&event) {
                delivered += 1;
            }
        }
        log::debug!("fetched {delivered} initial location events");
        delivered
    }

    // -----------------------------------------------------------------------
    // Chunks & tileset
    // -----------------------------------------------------------------------

    /// One scoped one-shot query for the given chunk `d` tags. Decoded
    /// payloads go to the chunk listeners; a transport failure resolves as
    /// an empty completion so level loading is never blocked on it.
    /// Returns the number of chunk payloads delivered.
    pub async fn fetch_chunk_events(&self, d_tags: &[String]) -> usize {
        if d_tags.is_empty() {
            return 0;
        }
        let filter = Filter::new()
            .kind(Kind::from(KIND_CHUNK))
            .identifiers(d_tags.iter().cloned());
        let events = self.core.query_or_empty(filter).await;

        let mut delivered = 0;
        for event in events {
            match ChunkPayload::from_event(&event) {
                Ok(payload) => {
                    self.core.listeners.chunk.emit(&payload);
                    delivered += 1;
                }
                Err(e) => log::debug!("dropping malformed chunk event {}: {e}", event.id),
            }
        }
        log::debug!("fetched {delivered} chunk events");
        delivered
    }

    /// Fetch the tileset definition this deployment is scoped to.
    ///
    /// Chunk decoding depends on the result, so unlike other one-shots this
    /// has an explicit deadline and a hard error instead of an empty
    /// completion.
    pub async fn fetch_tileset(&self) -> Result<TilesetDefinition, WorldClientError> {
        let d_tag = tileset_d_tag(&self.core.config.world_id, &self.core.config.tileset_name);
        let filter = Filter::new()
            .kind(Kind::from(KIND_TILESET))
            .identifier(d_tag.clone());

        let deadline = self.core.config.tileset_timeout();
        let events = tokio::time::timeout(deadline, self.core.transport.query(filter))
            .await
            .map_err(|_| WorldClientError::TilesetTimeout(deadline))??;

        let latest = events
            .into_iter()
            .max_by_key(|e| e.created_at)
            .ok_or_else(|| {
                WorldClientError::Transport(format!("no tileset definition found for `{d_tag}`"))
            })?;
        TilesetDefinition::from_event(&latest)
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Publish the local position at most once per configured interval,
    /// and only when the rounded position changed. `source` is polled on
    /// every tick (the input/physics layer owns the actual position).
    pub fn spawn_position_publisher(
        &self,
        source: impl Fn() -> Vec2 + Send + Sync + 'static,
    ) {
        let core = Arc::clone(&self.core);
        let interval = core.config.publish_interval();
        let handle = tokio::spawn(async move {
            let mut publisher = PositionPublisher::new(interval);
            publisher.prime(source());

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                if let Some((x, y)) = publisher.take_update(source()) {
                    if let Err(e) = core.publish_location(x, y).await {
                        log::warn!("failed to publish position: {e}");
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_profile_fetch(&self, pubkey: PublicKey) {
        if !self.core.profile_fetches.lock().insert(pubkey) {
            return; // fetch already in flight
        }
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            core.fetch_profile(pubkey).await;
            core.profile_fetches.lock().remove(&pubkey);
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_follow_fetch(&self, pubkey: PublicKey) {
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            core.fetch_follow_list(pubkey).await;
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_location_pump(&self) {
        let core = Arc::clone(&self.core);
        let filter = Filter::new()
            .kind(Kind::from(KIND_LOCATION))
            .identifier(self.core.config.world_id.clone());
        let handle = tokio::spawn(async move {
            let mut sub = match core.transport.subscribe(filter).await {
                Ok(sub) => sub,
                Err(e) => {
                    log::warn!("location subscription failed: {e}");
                    return;
                }
            };
            while let Some(event) = sub.next().await {
                core.deliver_location(&event);
            }
            log::debug!("location subscription ended");
        });
        self.tasks.lock().push(handle);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
