//! Pool behaviour against the in-memory relay network: several serving
//! relays, some of them dead, one pool.

use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use oni_nostr::testing::MockNetwork;
use oni_nostr::{
    kind, Filter, FullKeypair, LocalSigner, Note, PublishResult, RelayOptions, RelayPool,
    RelayStatus, SubscriptionEvent, UnsignedNote,
};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests (only runs once even if called multiple times)
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("oni_nostr=debug".parse().unwrap()),
            )
            .with_test_writer()
            .init();
    });
}

fn text_note(keys: &FullKeypair, content: &str, created_at: u64) -> Note {
    UnsignedNote::new(keys.pubkey, kind::TEXT_NOTE, content, vec![])
        .created_at(created_at)
        .sign(keys)
        .expect("sign")
}

/// Polls until `done` or `max_polls` runs out
fn pump_until(pool: &mut RelayPool, max_polls: usize, mut done: impl FnMut(&RelayPool) -> bool) -> bool {
    for _ in 0..max_polls {
        pool.poll(Instant::now());
        if done(pool) {
            return true;
        }
    }
    false
}

#[test]
fn overlapping_relays_deliver_each_event_once() {
    init_tracing();

    let keys = FullKeypair::generate();
    let shared = text_note(&keys, "everywhere", 100);
    let only_a = text_note(&keys, "only on a", 101);
    let only_c = text_note(&keys, "only on c", 102);

    let net = MockNetwork::new();
    net.serve("wss://a.example", vec![shared.clone(), only_a.clone()]);
    net.serve("wss://b.example", vec![shared.clone()]);
    net.serve("wss://c.example", vec![shared.clone(), only_c.clone()]);

    let mut pool = RelayPool::new(net.connector());
    for url in ["wss://a.example", "wss://b.example", "wss://c.example"] {
        pool.add_relay(url).unwrap();
    }
    pool.connect_all();

    assert!(pump_until(&mut pool, 5, |p| p.connected_count() == 3));

    let sub = pool.subscribe(vec![Filter::new()
        .authors([keys.pubkey.hex()])
        .kinds([kind::TEXT_NOTE])
        .build()]);

    let mut notes = vec![];
    let mut eose = 0;
    for _ in 0..5 {
        pool.poll(Instant::now());
        for event in sub.drain() {
            match event {
                SubscriptionEvent::Event { note, .. } => notes.push(note),
                SubscriptionEvent::Eose { .. } => eose += 1,
                SubscriptionEvent::Closed { message, .. } => panic!("closed: {message}"),
            }
        }
    }

    assert_eq!(eose, 3);
    assert_eq!(notes.len(), 3);
    for expected in [&shared, &only_a, &only_c] {
        assert_eq!(notes.iter().filter(|n| *n == expected).count(), 1);
    }
}

#[test]
fn dead_relays_do_not_hold_up_live_ones() {
    init_tracing();

    let net = MockNetwork::new();
    net.serve("wss://alive.example", vec![]);
    net.unreachable("wss://dead.example");
    net.refuse("wss://refused.example");

    let options = RelayOptions {
        publish_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let mut pool = RelayPool::with_options(net.connector(), options);
    for url in ["wss://alive.example", "wss://dead.example", "wss://refused.example"] {
        pool.add_relay(url).unwrap();
    }
    pool.connect_all();
    pool.poll(Instant::now());

    let status = pool.status();
    assert_eq!(status.len(), 3);
    assert_eq!(status.values().filter(|s| **s == RelayStatus::Connected).count(), 1);
    assert_eq!(status.values().filter(|s| **s == RelayStatus::Error).count(), 2);

    let keys = FullKeypair::generate();
    let note = text_note(&keys, "hello?", 5);
    let mut publish = pool.publish(&note);
    assert_eq!(publish.relay_count(), 3);

    pool.poll(Instant::now());
    assert!(publish.try_results().is_none(), "dead relays still pending");

    pool.poll(Instant::now() + Duration::from_secs(3));
    let results = publish.try_results().expect("everything settled");
    assert_eq!(results.len(), 3);

    let accepted: Vec<_> = results
        .iter()
        .filter(|(_, r)| r.accepted)
        .map(|(url, _)| url.to_string())
        .collect();
    assert_eq!(accepted, vec!["wss://alive.example".to_string()]);
    assert!(results
        .values()
        .filter(|r| !r.accepted)
        .all(|r| *r == PublishResult::timeout()));
}

#[test]
fn clearing_seen_events_allows_redelivery() {
    init_tracing();

    let keys = FullKeypair::generate();
    let note = text_note(&keys, "again", 1);

    let net = MockNetwork::new();
    net.serve("wss://a.example", vec![note.clone()]);

    let mut pool = RelayPool::new(net.connector());
    pool.add_relay("wss://a.example").unwrap();
    pool.connect_all();
    pool.poll(Instant::now());

    let count_events = |pool: &mut RelayPool| {
        let sub = pool.subscribe(vec![Filter::new().kinds([kind::TEXT_NOTE]).build()]);
        pool.poll(Instant::now());
        sub.drain()
            .filter(|e| matches!(e, SubscriptionEvent::Event { .. }))
            .count()
    };

    assert_eq!(count_events(&mut pool), 1);
    assert_eq!(count_events(&mut pool), 0);

    pool.clear_seen_events();
    assert_eq!(count_events(&mut pool), 1);
}

#[tokio::test]
async fn publish_handles_can_be_awaited() {
    init_tracing();

    let net = MockNetwork::new();
    net.serve("wss://a.example", vec![]);

    let mut pool = RelayPool::new(net.connector());
    pool.add_relay("wss://a.example").unwrap();
    pool.connect_all();
    pool.poll(Instant::now());

    let relay = pool.relay_mut("wss://a.example").unwrap();
    let handle = relay.publish(text_note(&FullKeypair::generate(), "awaited", 9));
    relay.poll(Instant::now());

    assert_eq!(handle.await, PublishResult::accepted(""));
}

#[test]
fn auth_signer_survives_reconnects() {
    init_tracing();

    let net = MockNetwork::new();
    let mut pool = RelayPool::new(net.connector());
    pool.add_relay_with_auth("wss://paid.example").unwrap();
    pool.set_auth_signer(Some(Rc::new(LocalSigner::generate())));
    pool.connect_all();

    net.open("wss://paid.example");
    pool.poll(Instant::now());
    net.push_auth("wss://paid.example", "first");
    pool.poll(Instant::now());
    assert_eq!(net.sent_of("wss://paid.example", "AUTH").len(), 1);

    let start = Instant::now();
    net.close("wss://paid.example");
    pool.poll(start);
    pool.poll(start + Duration::from_secs(1));
    net.open("wss://paid.example");
    pool.poll(start + Duration::from_secs(1));

    let relay = pool.relay("wss://paid.example").unwrap();
    assert!(relay.is_connected());
    assert!(!relay.is_authenticated());

    net.push_auth("wss://paid.example", "second");
    pool.poll(start + Duration::from_secs(1));
    assert_eq!(net.sent_of("wss://paid.example", "AUTH").len(), 2);
}
