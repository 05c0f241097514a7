//! Error taxonomy for the world client.

use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong between a relay frame and applied game state.
///
/// Per-event decode failures (`MalformedEvent`) are never fatal: the caller
/// logs and drops the event on the assumption that a well-formed one will
/// arrive later. Transport failures on one-shot queries resolve as empty
/// completions at the session layer so dependent initialization is never
/// blocked indefinitely.
#[derive(Debug, Error)]
pub enum WorldClientError {
    /// The encoded secret key did not decode, or decoded to something other
    /// than a secret key. Fatal to the attempted login; retry with new input.
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// A publish was attempted before any identity was resolved.
    #[error("not authenticated: no identity resolved")]
    NotAuthenticated,

    /// Neither a held private key nor an external signer is available.
    #[error("no signing capability available")]
    SigningUnavailable,

    /// An inbound event was missing required tags or had the wrong content
    /// shape. Dropped per-event, never retried.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A relay query, subscription or publish failed at the transport layer.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The tileset bootstrap event did not arrive within the deadline.
    #[error("tileset bootstrap timed out after {0:?}")]
    TilesetTimeout(Duration),
}

impl WorldClientError {
    /// Shorthand for tag-extraction failures in event decoders.
    pub fn missing_tag(name: &str) -> Self {
        Self::MalformedEvent(format!("missing or unparseable `{name}` tag"))
    }
}
