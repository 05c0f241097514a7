//! relay-world-client binary
//!
//! Headless observer client: connects a session, performs the tileset
//! bootstrap and location snapshot, keeps the chunk window and player
//! roster in sync, and logs every state change until Ctrl-C.
//!
//! ## Configuration (CLI / env / `relay-world.toml` via the `config` crate)
//!
//! | Key                          | Default          | Description                     |
//! |------------------------------|------------------|---------------------------------|
//! | `RELAY_WORLD_NSEC`           | *(required)*     | bech32 secret key for login     |
//! | `world_id` / `RELAY_WORLD__WORLD_ID` | `test`   | shared world id (`d` tag scope) |
//! | `relays` / `RELAY_WORLD__RELAYS`     | public set | relay endpoints               |
//! | `tileset_name`               | `default`        | tileset bootstrap scope         |
//!
//! With `--wander` the client also walks a simulated player around,
//! exercising the outbound position publisher against real relays.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use rand::Rng;

use relay_world::chunk::ChunkSync;
use relay_world::events::ConnectionUpdate;
use relay_world::location::{LocationNotice, LocationSync};
use relay_world::protocol::{ChunkPayload, LocationUpdate, Profile};
use relay_world::session::Session;
use relay_world::transport::RelayPool;
use relay_world::types::{Vec2, WorldClientConfig};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "relay-world-client", about = "Relay World observer client", version)]
struct Args {
    /// bech32-encoded secret key used to log in
    #[arg(long, env = "RELAY_WORLD_NSEC")]
    nsec: String,

    /// Config file name (TOML, extension optional), layered under env vars
    #[arg(long, default_value = "relay-world")]
    config: String,

    /// Override the world id from config
    #[arg(long)]
    world: Option<String>,

    /// Wander randomly, exercising the outbound position publisher
    #[arg(long)]
    wander: bool,
}

fn load_config(name: &str) -> Result<WorldClientConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(name).required(false))
        .add_source(
            config::Environment::with_prefix("RELAY_WORLD")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("relays"),
        )
        .build()
        .context("assembling configuration")?;
    settings
        .try_deserialize()
        .context("deserializing configuration")
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_world=debug".parse()?)
                .add_directive("relay_world_client=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    if let Some(world) = args.world {
        config.world_id = world;
    }

    log::info!(
        "starting relay-world-client (world='{}', {} relays)",
        config.world_id,
        config.relays.len()
    );

    let transport = Arc::new(
        RelayPool::connect(&config.relays, config.query_timeout())
            .await
            .context("connecting to relays")?,
    );
    let session = Arc::new(Session::new(config.clone(), transport));

    session
        .listeners()
        .connection
        .add(|update: &ConnectionUpdate| {
            log::info!("connection: {:?} ({:?})", update.state, update.pubkey);
        });
    session.listeners().profile.add(|profile: &Profile| {
        log::info!("profile: {} is '{}'", profile.pubkey, profile.display_label());
    });

    let pubkey = session
        .connect_with_encoded_key(&args.nsec)
        .await
        .context("login failed")?;
    log::info!("logged in as {pubkey}");

    // Tileset bootstrap gates everything chunk-related.
    let tileset = session
        .fetch_tileset()
        .await
        .context("tileset bootstrap failed – aborting level load")?;
    log::info!(
        "tileset '{}' ready ({} tiles with properties)",
        tileset.name,
        tileset.tile_properties.len()
    );

    let location = Arc::new(Mutex::new(LocationSync::new(
        pubkey,
        config.spawn,
        config.move_speed,
    )));
    let chunks = Arc::new(Mutex::new(ChunkSync::new(&config, tileset)));

    {
        let location = location.clone();
        let session_for_names = session.clone();
        session
            .listeners()
            .location
            .add(move |update: &LocationUpdate| {
                match location.lock().apply(update) {
                    Some(LocationNotice::SelfAnchored { position }) => {
                        log::info!("self position anchored at {position}");
                    }
                    Some(LocationNotice::RemoteJoined { pubkey, position }) => {
                        let label = session_for_names
                            .profile_by_pubkey(pubkey)
                            .map(|p| p.display_label().to_string())
                            .unwrap_or_else(|| "Unknown".into());
                        log::info!("{label} ({pubkey}) appeared at {position}");
                    }
                    Some(LocationNotice::RemoteMoved { pubkey, step }) => {
                        log::info!(
                            "{pubkey} moving to {} over {:?} facing {:?}",
                            step.to,
                            step.duration,
                            step.facing
                        );
                    }
                    None => {}
                }
            });
    }
    {
        let chunks = chunks.clone();
        session.listeners().chunk.add(move |payload: &ChunkPayload| {
            chunks.lock().apply(payload);
        });
    }

    // Seed the chunk window around the spawn point, then the roster.
    let initial_fetch = chunks.lock().poll_position(config.spawn);
    if let Some(fetch) = initial_fetch {
        let applied = session.fetch_chunk_events(&fetch.d_tags).await;
        log::info!("seeded {applied} chunks around spawn");
    }
    let seeded = session.fetch_location_snapshot().await;
    log::info!("seeded {seeded} player positions");

    // Outbound publisher reads whatever the walker (or nobody) does.
    let position = Arc::new(Mutex::new(config.spawn));
    {
        let position = position.clone();
        session.spawn_position_publisher(move || *position.lock());
    }

    let wander_task = args.wander.then(|| {
        let session = session.clone();
        let chunks = chunks.clone();
        let location = location.clone();
        let position = position.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(250));
            loop {
                ticker.tick().await;
                let next = {
                    let mut rng = rand::thread_rng();
                    let mut pos = position.lock();
                    pos.x += rng.gen_range(-48.0..=48.0_f32);
                    pos.y += rng.gen_range(-48.0..=48.0_f32);
                    *pos
                };
                location.lock().set_self_position(next);

                let fetch = chunks.lock().poll_position(next);
                if let Some(fetch) = fetch {
                    session.fetch_chunk_events(&fetch.d_tags).await;
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down (SIGINT)");

    if let Some(task) = wander_task {
        task.abort();
    }
    session.dispose().await;

    log::info!(
        "session closed – {} remote players seen, {} tiles resident",
        location.lock().remote_count(),
        chunks.lock().layers().tile_count()
    );
    Ok(())
}
