//! Bootstrap against the in-memory relay network, from a bare pubkey to
//! connected outbox and inbox relays.

use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use oni_live::relay_profiles::{INBOX, INDEXERS, OUTBOX};
use oni_live::{
    Bootstrap, BootstrapConfig, BootstrapPhase, MemoryStore, RelayProfiles, Session,
    SessionConfig,
};
use oni_nostr::testing::MockNetwork;
use oni_nostr::{kind, FullKeypair, LocalSigner, Note, RelayPool, Signer, UnsignedNote};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests (only runs once even if called multiple times)
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("oni_live=debug".parse().unwrap())
                    .add_directive("oni_nostr=info".parse().unwrap()),
            )
            .with_test_writer()
            .init();
    });
}

fn note(keys: &FullKeypair, kind: u32, created_at: u64, content: &str, tags: &[&[&str]]) -> Note {
    let tags = tags
        .iter()
        .map(|t| t.iter().map(|s| s.to_string()).collect())
        .collect();
    UnsignedNote::new(keys.pubkey, kind, content, tags)
        .created_at(created_at)
        .sign(keys)
        .expect("sign")
}

struct Harness {
    net: MockNetwork,
    pool: RelayPool,
    profiles: RelayProfiles,
    bootstrap: Bootstrap,
}

impl Harness {
    fn new(indexers: &[&str]) -> Self {
        init_tracing();
        let net = MockNetwork::new();
        let config = BootstrapConfig {
            fallback_indexers: indexers.iter().map(|s| s.to_string()).collect(),
            discover_indexers: false,
            ..Default::default()
        };

        Self {
            pool: RelayPool::new(net.connector()),
            profiles: RelayProfiles::load(Rc::new(MemoryStore::new())),
            bootstrap: Bootstrap::new(config, net.connector()),
            net,
        }
    }

    fn start(&mut self, keys: &FullKeypair, now: Instant) {
        self.bootstrap
            .start(keys.pubkey, &mut self.pool, &mut self.profiles, now);
    }

    /// Pool first, then bootstrap, like a session does
    fn poll(&mut self, now: Instant) {
        self.pool.poll(now);
        self.bootstrap
            .poll(now, &mut self.pool, &mut self.profiles);
    }

    fn run(&mut self, now: Instant, max_polls: usize) -> BootstrapPhase {
        for _ in 0..max_polls {
            self.poll(now);
            let phase = self.bootstrap.phase();
            if phase == BootstrapPhase::Ready || phase == BootstrapPhase::Error {
                break;
            }
        }
        self.bootstrap.phase()
    }
}

#[test]
fn unreachable_indexers_still_reach_ready() {
    let mut h = Harness::new(&["wss://relay.damus.io", "wss://nos.lol"]);
    h.net.unreachable("wss://relay.damus.io");
    h.net.unreachable("wss://nos.lol");

    let keys = FullKeypair::generate();
    let now = Instant::now();
    h.start(&keys, now);
    assert_eq!(h.bootstrap.phase(), BootstrapPhase::QueryingIndexers);

    assert_eq!(h.run(now, 5), BootstrapPhase::Ready);
    let state = h.bootstrap.state();
    assert!(state.relay_list.is_empty());
    assert!(state.profile.is_none());
    assert_eq!(state.indexers_queried, 2);
    assert_eq!(state.indexers_responded, 2);
    assert_eq!(state.error, None);
    assert!(h.pool.is_empty());
}

#[test]
fn no_candidates_is_an_error() {
    let mut h = Harness::new(&[]);
    let keys = FullKeypair::generate();
    h.start(&keys, Instant::now());

    assert_eq!(h.bootstrap.phase(), BootstrapPhase::Error);
    assert_eq!(
        h.bootstrap.state().error.as_deref(),
        Some("No indexer relays found")
    );
}

#[test]
fn silent_indexers_time_out() {
    let mut h = Harness::new(&["wss://quiet.example"]);
    let keys = FullKeypair::generate();
    let now = Instant::now();
    h.start(&keys, now);

    assert_eq!(h.run(now + Duration::from_secs(14), 3), BootstrapPhase::QueryingIndexers);
    assert_eq!(h.run(now + Duration::from_secs(15), 1), BootstrapPhase::Ready);
    assert_eq!(h.bootstrap.state().indexers_responded, 0);
    assert!(h.net.is_closed("wss://quiet.example"));
}

#[test]
fn indexer_queries_close_once_stored_events_are_in() {
    let served = "wss://fast.example";
    let quiet = "wss://slow.example";
    let mut h = Harness::new(&[served, quiet]);
    let keys = FullKeypair::generate();
    let profile = note(&keys, kind::METADATA, 10, r#"{"name":"oni"}"#, &[]);
    h.net.serve(served, vec![profile]);

    let now = Instant::now();
    h.start(&keys, now);
    assert_eq!(h.run(now, 3), BootstrapPhase::QueryingIndexers);

    let state = h.bootstrap.state();
    assert_eq!(state.indexers_responded, 1);
    assert!(state.profile.is_some());

    let closes = h.net.sent_of(served, "CLOSE");
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0][1].as_str(), h.net.last_req_id(served).as_deref());
    assert!(h.net.sent_of(quiet, "CLOSE").is_empty());

    // the teardown doesn't close it a second time
    assert_eq!(h.run(now + Duration::from_secs(15), 1), BootstrapPhase::Ready);
    assert_eq!(h.net.sent_of(served, "CLOSE").len(), 1);
}

/// Splits one user's history across two indexers so neither has all of
/// the latest notes.
fn serve_split_history(net: &MockNetwork, keys: &FullKeypair, swap: bool) {
    let old_profile = note(keys, kind::METADATA, 100, r#"{"name":"old"}"#, &[]);
    let new_profile = note(keys, kind::METADATA, 200, r#"{"name":"oni","display_name":"Oni"}"#, &[]);
    let old_relays = note(keys, kind::RELAY_LIST, 100, "", &[&["r", "wss://stale.example"]]);
    let new_relays = note(
        keys,
        kind::RELAY_LIST,
        300,
        "",
        &[
            &["r", "wss://out.example/", "write"],
            &["r", "wss://in.example", "read"],
            &["r", "wss://both.example"],
        ],
    );
    let contacts = note(
        keys,
        kind::CONTACTS,
        50,
        "",
        &[&["p", "aa"], &["p", "bb"], &["p", ""]],
    );

    let first = vec![old_profile, new_relays, contacts];
    let second = vec![new_profile, old_relays];
    let (a, b) = if swap { (second, first) } else { (first, second) };
    net.serve("wss://idx-a.example", a);
    net.serve("wss://idx-b.example", b);
}

#[test]
fn newest_notes_win_whichever_indexer_has_them() {
    for swap in [false, true] {
        let mut h = Harness::new(&["wss://idx-a.example", "wss://idx-b.example"]);
        let keys = FullKeypair::generate();
        serve_split_history(&h.net, &keys, swap);
        for relay in ["wss://out.example", "wss://in.example", "wss://both.example"] {
            h.net.serve(relay, vec![]);
        }

        let now = Instant::now();
        h.start(&keys, now);
        assert_eq!(h.run(now, 10), BootstrapPhase::Ready, "swap={swap}");

        let state = h.bootstrap.state();
        let profile = state.profile.as_ref().expect("profile");
        assert_eq!(profile.name(), Some("oni"));
        assert_eq!(profile.best_name(&keys.pubkey), "Oni");
        assert_eq!(state.relay_list_note.as_ref().map(|n| n.created_at), Some(300));
        assert_eq!(state.following_count, 2);
        assert_eq!(
            state.outbox_urls(),
            vec!["wss://out.example", "wss://both.example"]
        );
        assert_eq!(state.inbox_urls(), vec!["wss://in.example", "wss://both.example"]);
        assert_eq!(state.outbox_connected, 2);
        assert_eq!(state.inbox_connected, 2);
    }
}

#[test]
fn resolved_relays_land_in_profiles_and_pool() {
    let mut h = Harness::new(&["wss://idx-a.example", "wss://idx-b.example"]);
    let keys = FullKeypair::generate();
    serve_split_history(&h.net, &keys, false);
    h.net.serve("wss://out.example", vec![]);
    h.net.serve("wss://both.example", vec![]);
    h.net.unreachable("wss://in.example");

    let now = Instant::now();
    h.start(&keys, now);
    assert_eq!(h.run(now, 10), BootstrapPhase::Ready);

    assert_eq!(
        h.profiles.get(OUTBOX).unwrap().relays,
        vec!["wss://out.example", "wss://both.example"]
    );
    assert_eq!(
        h.profiles.get(INBOX).unwrap().relays,
        vec!["wss://in.example", "wss://both.example"]
    );
    assert_eq!(
        h.profiles.get(INDEXERS).unwrap().relays,
        vec!["wss://idx-a.example", "wss://idx-b.example"]
    );

    for url in ["wss://out.example", "wss://in.example", "wss://both.example"] {
        assert!(h.pool.has(url), "{url} not pooled");
    }
    let state = h.bootstrap.state();
    assert_eq!(state.outbox_connected, 2);
    assert_eq!(state.inbox_connected, 1);

    // indexers were ephemeral and aren't pool members
    assert!(h.net.is_closed("wss://idx-a.example"));
    assert!(h.net.is_closed("wss://idx-b.example"));
}

#[test]
fn session_login_and_logout() {
    init_tracing();
    let net = MockNetwork::new();
    net.unreachable("wss://relay.damus.io");
    net.unreachable("wss://nos.lol");

    let mut config = SessionConfig {
        no_broadcast_discovery: true,
        ..Default::default()
    };
    config.bootstrap.fallback_indexers = vec!["wss://relay.damus.io".into(), "wss://nos.lol".into()];
    config.bootstrap.discover_indexers = false;

    let store = Rc::new(MemoryStore::new());
    let mut session = Session::new(config, net.connector(), store);

    let signer = Rc::new(LocalSigner::generate());
    let pubkey = signer.pubkey();
    let now = Instant::now();
    session.login(pubkey, Some(signer), now);

    assert!(session.pool.auth_signer().is_some());
    assert_eq!(session.accounts.active_pubkey(), Some(&pubkey));
    assert_eq!(session.bootstrap_state().pubkey, Some(pubkey));

    for _ in 0..5 {
        session.poll(now);
    }
    assert_eq!(session.bootstrap_state().phase, BootstrapPhase::Ready);
    // no outbox yet, so only the selected broadcast relays
    assert_eq!(session.live_targets().len(), 8);

    session.logout();
    assert_eq!(session.bootstrap_state().phase, BootstrapPhase::Idle);
    assert!(session.pool.auth_signer().is_none());
    assert!(session.pubkey().is_none());
    assert!(session.pool.is_empty());
    assert!(session.profiles.get(INDEXERS).unwrap().relays.is_empty());
}
