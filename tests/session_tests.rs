//! Session integration tests over the in-memory relay.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use nostr_sdk::nips::nip19::ToBech32;
    use nostr_sdk::{Event, EventBuilder, Filter, Keys, Kind};
    use parking_lot::Mutex;

    use relay_world::location::{LocationNotice, LocationSync};
    use relay_world::protocol::{EventDraft, LocationUpdate, KIND_FOLLOWS, KIND_LOCATION};
    use relay_world::session::Session;
    use relay_world::transport::{MemoryRelay, RelayTransport, Subscription};
    use relay_world::types::{Vec2, WorldClientConfig};

    fn make_session(relay: &Arc<MemoryRelay>) -> Session {
        Session::new(WorldClientConfig::default(), relay.clone())
    }

    fn sign(draft: EventDraft, keys: &Keys) -> Event {
        EventBuilder::new(Kind::from(draft.kind), draft.content)
            .tags(draft.tags)
            .sign_with_keys(keys)
            .expect("test event signs")
    }

    fn location_event(keys: &Keys, x: i32, y: i32) -> Event {
        sign(LocationUpdate::draft("test", &keys.public_key(), x, y), keys)
    }

    async fn drain(sub: &mut Subscription) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(10), sub.next()).await
        {
            out.push(event);
        }
        out
    }

    // -----------------------------------------------------------------------
    // Publish → echo → listener
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn published_location_reaches_other_session_listeners() {
        let relay = Arc::new(MemoryRelay::new());

        // Observer session with a live subscription.
        let observer = make_session(&relay);
        let observer_keys = Keys::generate();
        observer
            .connect_with_encoded_key(&observer_keys.secret_key().to_bech32().unwrap())
            .await
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            observer
                .listeners()
                .location
                .add(move |update: &LocationUpdate| received.lock().push(update.clone()));
        }

        // Let the standing subscription register before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Another participant publishes a position.
        let publisher = make_session(&relay);
        let publisher_keys = Keys::generate();
        publisher
            .connect_with_encoded_key(&publisher_keys.secret_key().to_bech32().unwrap())
            .await
            .unwrap();
        publisher.publish_location(1400, 2400).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].pubkey, publisher_keys.public_key());
        assert_eq!((received[0].x, received[0].y), (1400, 2400));

        observer.dispose().await;
        publisher.dispose().await;
    }

    // -----------------------------------------------------------------------
    // Dedup window
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn same_event_id_notifies_listeners_at_most_once() {
        let relay = Arc::new(MemoryRelay::new());
        let other = Keys::generate();
        relay
            .publish(location_event(&other, 10, 10))
            .await
            .unwrap();

        let session = make_session(&relay);
        let notifications = Arc::new(Mutex::new(0usize));
        {
            let notifications = notifications.clone();
            session
                .listeners()
                .location
                .add(move |_: &LocationUpdate| *notifications.lock() += 1);
        }

        // The same stored event is delivered by two snapshot fetches; the
        // dedup window lets only the first through.
        assert_eq!(session.fetch_location_snapshot().await, 1);
        assert_eq!(session.fetch_location_snapshot().await, 0);
        assert_eq!(*notifications.lock(), 1);
    }

    // -----------------------------------------------------------------------
    // Roster semantics through the full stack
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn remote_roster_is_created_once_then_moved() {
        let relay = Arc::new(MemoryRelay::new());

        let session = make_session(&relay);
        let me = Keys::generate();
        let pubkey = session
            .connect_with_encoded_key(&me.secret_key().to_bech32().unwrap())
            .await
            .unwrap();

        let sync = Arc::new(Mutex::new(LocationSync::new(
            pubkey,
            Vec2::new(1400.0, 2400.0),
            200.0,
        )));
        let notices = Arc::new(Mutex::new(Vec::new()));
        {
            let sync = sync.clone();
            let notices = notices.clone();
            session
                .listeners()
                .location
                .add(move |update: &LocationUpdate| {
                    if let Some(notice) = sync.lock().apply(update) {
                        notices.lock().push(notice);
                    }
                });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Two updates for the same remote pubkey, then one self-authored.
        let other = Keys::generate();
        relay
            .publish(location_event(&other, 10, 10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        relay.publish(location_event(&other, 5, 5)).await.unwrap();
        relay.publish(location_event(&me, 777, 888)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let notices = notices.lock();
            assert!(matches!(
                notices[0],
                LocationNotice::RemoteJoined { .. }
            ));
            assert!(matches!(notices[1], LocationNotice::RemoteMoved { .. }));
            assert!(matches!(
                notices[2],
                LocationNotice::SelfAnchored { .. }
            ));
        }

        let sync = sync.lock();
        assert_eq!(sync.remote_count(), 1);
        // Last processed update wins, created_at does not arbitrate.
        assert_eq!(
            sync.remote(&other.public_key()).unwrap().position,
            Vec2::new(5.0, 5.0)
        );
        assert_eq!(sync.self_position(), Vec2::new(777.0, 888.0));

        session.dispose().await;
    }

    // -----------------------------------------------------------------------
    // Outbound throttle end-to-end
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn publisher_emits_at_most_once_per_interval_and_only_on_change() {
        let relay = Arc::new(MemoryRelay::new());
        let session = make_session(&relay);
        let keys = Keys::generate();
        session
            .connect_with_encoded_key(&keys.secret_key().to_bech32().unwrap())
            .await
            .unwrap();

        let mut sub = relay
            .subscribe(
                Filter::new()
                    .kind(Kind::from(KIND_LOCATION))
                    .author(keys.public_key()),
            )
            .await
            .unwrap();

        let position = Arc::new(Mutex::new(Vec2::new(1400.0, 2400.0)));
        {
            let position = position.clone();
            session.spawn_position_publisher(move || *position.lock());
        }

        // Several ticks with no movement: nothing is published (the spawn
        // position was primed as already-published).
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(drain(&mut sub).await.is_empty());

        // Move once: exactly one event on the next tick.
        *position.lock() = Vec2::new(1412.0, 2400.0);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(drain(&mut sub).await.len(), 1);

        // Stationary again: no redundant publishes.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(drain(&mut sub).await.is_empty());

        // Sub-pixel drift rounds to the same coordinates: still nothing.
        *position.lock() = Vec2::new(1412.2, 2399.9);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(drain(&mut sub).await.is_empty());

        session.dispose().await;
    }

    // -----------------------------------------------------------------------
    // Profiles & follows
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn profile_cache_miss_then_hit() {
        let relay = Arc::new(MemoryRelay::new());
        let bob = Keys::generate();
        relay
            .publish(sign(
                EventDraft {
                    kind: 0,
                    tags: Vec::new(),
                    content: r#"{"name":"bob","display_name":"Bob"}"#.into(),
                },
                &bob,
            ))
            .await
            .unwrap();

        let session = make_session(&relay);

        // Awaitable form fetches and caches.
        let profile = session.fetch_profile(bob.public_key()).await.unwrap();
        assert_eq!(profile.display_label(), "Bob");

        // Synchronous read now hits the cache.
        let cached = session.profile_by_pubkey(bob.public_key()).unwrap();
        assert_eq!(cached.display_label(), "Bob");
    }

    #[tokio::test(start_paused = true)]
    async fn profile_miss_returns_none_and_arrives_later() {
        let relay = Arc::new(MemoryRelay::new());
        let bob = Keys::generate();
        relay
            .publish(sign(
                EventDraft {
                    kind: 0,
                    tags: Vec::new(),
                    content: r#"{"name":"bob"}"#.into(),
                },
                &bob,
            ))
            .await
            .unwrap();

        let session = make_session(&relay);
        assert!(session.profile_by_pubkey(bob.public_key()).is_none());

        // The background fetch fills the cache.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.profile_by_pubkey(bob.public_key()).is_some());
    }

    #[tokio::test]
    async fn follow_list_is_fetched_and_retained() {
        let relay = Arc::new(MemoryRelay::new());
        let me = Keys::generate();
        let friend_a = Keys::generate().public_key();
        let friend_b = Keys::generate().public_key();

        relay
            .publish(sign(
                EventDraft {
                    kind: KIND_FOLLOWS,
                    tags: vec![
                        nostr_sdk::Tag::custom(
                            nostr_sdk::TagKind::custom("p"),
                            [friend_a.to_hex()],
                        ),
                        nostr_sdk::Tag::custom(
                            nostr_sdk::TagKind::custom("p"),
                            [friend_b.to_hex()],
                        ),
                    ],
                    content: String::new(),
                },
                &me,
            ))
            .await
            .unwrap();

        let session = make_session(&relay);
        let follows = session.fetch_follow_list(me.public_key()).await;
        assert_eq!(follows, vec![friend_a, friend_b]);
        assert_eq!(session.follows(), follows);
    }
}
