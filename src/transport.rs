//! Relay transport seam.
//!
//! The session never talks to a relay directly; it goes through
//! [`RelayTransport`], which exposes exactly the three primitives the
//! protocol needs:
//!
//! | Primitive   | Shape                                  | Completion            |
//! |-------------|----------------------------------------|-----------------------|
//! | `query`     | one-shot, finite                       | relay EOSE or timeout |
//! | `subscribe` | live, potentially infinite, cancelable | dropped by consumer   |
//! | `publish`   | fire to every connected relay          | accepted by pool      |
//!
//! [`RelayPool`] adapts the `nostr-sdk` multi-relay client (connection
//! retry and frame dedup live there, not here). [`MemoryRelay`] is an
//! in-process stand-in with the same observable semantics, used by tests
//! and dry runs.

use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::{Client, Event, EventId, Filter, JsonUtil, RelayPoolNotification};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::WorldClientError;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A live event stream. Dropping it cancels the underlying subscription.
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Event>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// Next event, or `None` once the subscription is torn down.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// External pub/sub capability over a set of relays.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// One-shot query for stored events matching `filter`.
    async fn query(&self, filter: Filter) -> Result<Vec<Event>, WorldClientError>;

    /// Standing subscription for events matching `filter` as they arrive
    /// from any connected relay.
    async fn subscribe(&self, filter: Filter) -> Result<Subscription, WorldClientError>;

    /// Broadcast a signed event to every connected relay.
    async fn publish(&self, event: Event) -> Result<EventId, WorldClientError>;

    /// Tear down connections. Idempotent.
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// Relay pool (nostr-sdk adapter)
// ---------------------------------------------------------------------------

/// Multi-relay transport backed by the `nostr-sdk` client pool.
pub struct RelayPool {
    client: Client,
    query_timeout: Duration,
}

impl RelayPool {
    /// Connect to every relay in `relays`. Individual relays may come and
    /// go afterwards; the pool handles per-relay retry internally.
    pub async fn connect(
        relays: &[String],
        query_timeout: Duration,
    ) -> Result<Self, WorldClientError> {
        let client = Client::default();
        for url in relays {
            client
                .add_relay(url.clone())
                .await
                .map_err(|e| WorldClientError::Transport(format!("add relay {url}: {e}")))?;
        }
        client.connect().await;
        Ok(Self {
            client,
            query_timeout,
        })
    }
}

#[async_trait]
impl RelayTransport for RelayPool {
    async fn query(&self, filter: Filter) -> Result<Vec<Event>, WorldClientError> {
        let events = self
            .client
            .fetch_events(filter, self.query_timeout)
            .await
            .map_err(|e| WorldClientError::Transport(e.to_string()))?;
        Ok(events.into_iter().collect())
    }

    async fn subscribe(&self, filter: Filter) -> Result<Subscription, WorldClientError> {
        let output = self
            .client
            .subscribe(filter, None)
            .await
            .map_err(|e| WorldClientError::Transport(e.to_string()))?;
        let sub_id = output.val;

        let mut notifications = self.client.notifications();
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(async move {
            while let Ok(notification) = notifications.recv().await {
                match notification {
                    RelayPoolNotification::Event {
                        subscription_id,
                        event,
                        ..
                    } if subscription_id == sub_id => {
                        if tx.send(*event).await.is_err() {
                            break;
                        }
                    }
                    RelayPoolNotification::Shutdown => break,
                    _ => {}
                }
            }
        });

        Ok(Subscription::new(rx, Some(task)))
    }

    async fn publish(&self, event: Event) -> Result<EventId, WorldClientError> {
        let output = self
            .client
            .send_event(&event)
            .await
            .map_err(|e| WorldClientError::Transport(e.to_string()))?;
        Ok(output.val)
    }

    async fn shutdown(&self) {
        self.client.disconnect().await;
    }
}

// ---------------------------------------------------------------------------
// In-memory relay
// ---------------------------------------------------------------------------

const SUBSCRIBER_BUFFER: usize = 256;

/// In-process relay with store-and-forward semantics: `publish` persists
/// (honoring addressable-event replacement for kinds 30000..40000) and fans
/// out to live subscribers; `query` replays the store.
#[derive(Default)]
pub struct MemoryRelay {
    store: Mutex<Vec<Event>>,
    subscribers: Mutex<Vec<(serde_json::Value, mpsc::Sender<Event>)>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_count(&self) -> usize {
        self.store.lock().len()
    }

    fn insert(&self, event: Event) -> bool {
        let mut store = self.store.lock();
        if store.iter().any(|e| e.id == event.id) {
            return false;
        }

        let kind = event.kind.as_u16();
        if (30_000..40_000).contains(&kind) {
            let d = d_tag_of(&event);
            if let Some(existing) = store
                .iter()
                .position(|e| e.kind == event.kind && e.pubkey == event.pubkey && d_tag_of(e) == d)
            {
                if store[existing].created_at > event.created_at {
                    // A newer replaceable version is already stored.
                    return false;
                }
                store.remove(existing);
            }
        }

        store.push(event);
        true
    }

    fn fan_out(&self, event: &Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(filter, tx)| {
            if !filter_matches(filter, event) {
                return !tx.is_closed();
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("memory relay subscriber buffer full – dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn query(&self, filter: Filter) -> Result<Vec<Event>, WorldClientError> {
        let filter = filter_json(&filter)?;
        Ok(self
            .store
            .lock()
            .iter()
            .filter(|e| filter_matches(&filter, e))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, filter: Filter) -> Result<Subscription, WorldClientError> {
        let filter = filter_json(&filter)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().push((filter, tx));
        Ok(Subscription::new(rx, None))
    }

    async fn publish(&self, event: Event) -> Result<EventId, WorldClientError> {
        let id = event.id;
        if self.insert(event.clone()) {
            self.fan_out(&event);
        }
        Ok(id)
    }

    async fn shutdown(&self) {
        self.subscribers.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Sequential publishing
// ---------------------------------------------------------------------------

/// Publish a batch of signed events one at a time with a fixed delay
/// between them, the pacing public relays expect from bulk writers.
pub async fn publish_sequentially(
    transport: &dyn RelayTransport,
    events: Vec<Event>,
    delay: Duration,
) -> Result<usize, WorldClientError> {
    let total = events.len();
    for (index, event) in events.into_iter().enumerate() {
        log::info!("publishing event {}/{} ({})", index + 1, total, event.id);
        transport.publish(event).await?;
        if index + 1 < total {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Filter matching
// ---------------------------------------------------------------------------

fn filter_json(filter: &Filter) -> Result<serde_json::Value, WorldClientError> {
    serde_json::from_str(&filter.as_json())
        .map_err(|e| WorldClientError::Transport(format!("filter encoding: {e}")))
}

/// Match an event against the JSON form of a relay filter. Covers the
/// fields this client actually sends: `ids`, `kinds`, `authors`, `#d`,
/// `since`, `until`.
fn filter_matches(filter: &serde_json::Value, event: &Event) -> bool {
    let in_str_list = |key: &str, value: &str| -> bool {
        match filter.get(key).and_then(|v| v.as_array()) {
            Some(list) => list.iter().filter_map(|v| v.as_str()).any(|v| v == value),
            None => true,
        }
    };

    if !in_str_list("ids", &event.id.to_hex()) {
        return false;
    }
    if !in_str_list("authors", &event.pubkey.to_hex()) {
        return false;
    }

    if let Some(kinds) = filter.get("kinds").and_then(|v| v.as_array()) {
        let kind = event.kind.as_u16() as u64;
        if !kinds.iter().filter_map(|v| v.as_u64()).any(|k| k == kind) {
            return false;
        }
    }

    if filter.get("#d").is_some() {
        match d_tag_of(event) {
            Some(d) => {
                if !in_str_list("#d", &d) {
                    return false;
                }
            }
            None => return false,
        }
    }

    if let Some(since) = filter.get("since").and_then(|v| v.as_u64()) {
        if event.created_at.as_u64() < since {
            return false;
        }
    }
    if let Some(until) = filter.get("until").and_then(|v| v.as_u64()) {
        if event.created_at.as_u64() > until {
            return false;
        }
    }

    true
}

fn d_tag_of(event: &Event) -> Option<String> {
    crate::protocol::tag_value(event, "d").map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
