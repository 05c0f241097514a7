//! publish-tileset binary
//!
//! Converts every tileset of a Tiled JSON export into tileset-definition
//! events (geometry tags + filtered tile property map), signs them with the
//! given key and publishes them sequentially.
//!
//! ```text
//! publish-tileset <world> <tilemap.json> <nsec> [--relays wss://…,wss://…] [--dry-run]
//! ```
//!
//! Exits non-zero on malformed arguments, unreadable input or a decode
//! failure; zero on completion.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nostr_sdk::nips::nip19::FromBech32;
use nostr_sdk::{Event, EventBuilder, Keys, Kind, SecretKey};

use relay_world::tiled::TiledMap;
use relay_world::transport::{publish_sequentially, RelayPool, RelayTransport};
use relay_world::types::WorldClientConfig;

const INTER_PUBLISH_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "publish-tileset", about = "Publish Tiled tileset definitions as relay events", version)]
struct Args {
    /// World id: the `d` tag scope shared with the game client
    world: String,

    /// Path to the Tiled JSON export containing the tilesets
    tilemap: PathBuf,

    /// bech32-encoded secret key used to sign the events
    nsec: String,

    /// Relay endpoints (defaults to the client's relay set)
    #[arg(long, env = "RELAY_WORLD_RELAYS", value_delimiter = ',')]
    relays: Vec<String>,

    /// Print the signed events instead of publishing them
    #[arg(long)]
    dry_run: bool,
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
                .add_directive("publish_tileset=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let secret = SecretKey::from_bech32(&args.nsec).context("invalid nsec key")?;
    let keys = Keys::new(secret);

    let json = std::fs::read_to_string(&args.tilemap)
        .with_context(|| format!("reading {}", args.tilemap.display()))?;
    let map = TiledMap::parse(&json).context("parsing Tiled export")?;

    let drafts = map.tileset_drafts(&args.world);
    anyhow::ensure!(!drafts.is_empty(), "no tilesets found in the export");
    log::info!(
        "signing {} tileset events for world '{}'",
        drafts.len(),
        args.world
    );

    let events: Vec<Event> = drafts
        .into_iter()
        .map(|draft| {
            EventBuilder::new(Kind::from(draft.kind), draft.content)
                .tags(draft.tags)
                .sign_with_keys(&keys)
                .context("signing tileset event")
        })
        .collect::<Result<_>>()?;

    if args.dry_run {
        for event in &events {
            println!("{}", serde_json::to_string_pretty(event)?);
        }
        return Ok(());
    }

    let relays = if args.relays.is_empty() {
        WorldClientConfig::default().relays
    } else {
        args.relays
    };
    let pool = RelayPool::connect(&relays, Duration::from_secs(10))
        .await
        .context("connecting to relays")?;

    let published = publish_sequentially(&pool, events, INTER_PUBLISH_DELAY).await?;
    pool.shutdown().await;

    log::info!("finished – {published} events published");
    Ok(())
}
