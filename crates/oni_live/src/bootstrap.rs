//! Resolving a user from nothing but their pubkey: ask indexer relays for
//! their profile, relay list and contacts, then connect to the relays
//! they publish to and read from.

use std::rc::Rc;
use std::time::{Duration, Instant};

use oni_nostr::{
    kind, Connector, Filter, Note, NormRelayUrl, Pubkey, Relay, RelayOptions, RelayPool,
    RelayStatus, Subscription, SubscriptionEvent,
};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discovery::{Discovery, DiscoveryPolicy, FALLBACK_INDEXERS};
use crate::profile::ProfileState;
use crate::relay_list::{parse_relay_list, read_urls, write_urls, RelaySpec};
use crate::relay_profiles::{RelayProfiles, INBOX, INDEXERS, OUTBOX};

pub const NO_INDEXERS: &str = "No indexer relays found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    #[default]
    Idle,
    DiscoveringIndexers,
    QueryingIndexers,
    ConnectingRelays,
    Ready,
    Error,
}

impl BootstrapPhase {
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            BootstrapPhase::DiscoveringIndexers
                | BootstrapPhase::QueryingIndexers
                | BootstrapPhase::ConnectingRelays
        )
    }
}

/// What is known about the user so far. Each note is the newest seen
/// across all indexers.
#[derive(Debug, Clone, Default)]
pub struct BootstrapState {
    pub phase: BootstrapPhase,
    pub pubkey: Option<Pubkey>,
    pub profile: Option<ProfileState>,
    pub profile_note: Option<Note>,
    pub relay_list: Vec<RelaySpec>,
    pub relay_list_note: Option<Note>,
    pub contacts_note: Option<Note>,
    pub following_count: usize,
    pub indexers_queried: usize,
    pub indexers_responded: usize,
    pub outbox_connected: usize,
    pub inbox_connected: usize,
    pub error: Option<String>,
}

impl BootstrapState {
    pub fn outbox_urls(&self) -> Vec<String> {
        write_urls(&self.relay_list)
    }

    pub fn inbox_urls(&self) -> Vec<String> {
        read_urls(&self.relay_list)
    }
}

/// Newest wins. A tie keeps what we already have.
pub fn merge_latest(current: Option<Note>, candidate: Note) -> Note {
    match current {
        Some(current) if current.created_at >= candidate.created_at => current,
        _ => candidate,
    }
}

/// `p` tags with a pubkey in them
pub fn following_count(contacts: &Note) -> usize {
    contacts
        .tags_named("p")
        .filter(|t| t.get(1).is_some_and(|pk| !pk.is_empty()))
        .count()
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub query_timeout: Duration,
    pub connect_timeout: Duration,
    pub indexer_count: usize,
    pub fallback_indexers: Vec<String>,
    /// Look for better indexers through NIP-66 monitors
    pub discover_indexers: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            indexer_count: 10,
            fallback_indexers: FALLBACK_INDEXERS.iter().map(|s| s.to_string()).collect(),
            discover_indexers: true,
        }
    }
}

impl BootstrapConfig {
    fn indexer_policy(&self) -> DiscoveryPolicy {
        let policy = DiscoveryPolicy::indexers().with_fallback_urls(&self.fallback_indexers);
        if self.discover_indexers {
            policy
        } else {
            policy.without_monitors()
        }
    }
}

struct IndexerQuery {
    relay: Relay,
    sub: Subscription,
    responded: bool,
}

struct PendingConnect {
    url: NormRelayUrl,
    write: bool,
    read: bool,
    settled: bool,
}

pub struct Bootstrap {
    config: BootstrapConfig,
    state: BootstrapState,
    indexers: Discovery,
    connector: Rc<dyn Connector>,
    queries: Vec<IndexerQuery>,
    query_deadline: Option<Instant>,
    connects: Vec<PendingConnect>,
    connect_deadline: Option<Instant>,
}

impl Bootstrap {
    pub fn new(config: BootstrapConfig, connector: Rc<dyn Connector>) -> Self {
        let indexers = Discovery::new(config.indexer_policy(), connector.clone());
        Self {
            config,
            state: BootstrapState::default(),
            indexers,
            connector,
            queries: vec![],
            query_deadline: None,
            connects: vec![],
            connect_deadline: None,
        }
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    pub fn phase(&self) -> BootstrapPhase {
        self.state.phase
    }

    pub fn indexers(&self) -> &Discovery {
        &self.indexers
    }

    /// Begins resolving `pubkey`. Asking again for the same pubkey while
    /// that is underway or done is a no-op.
    pub fn start(
        &mut self,
        pubkey: Pubkey,
        pool: &mut RelayPool,
        profiles: &mut RelayProfiles,
        now: Instant,
    ) -> &BootstrapState {
        let same_user = self.state.pubkey == Some(pubkey);
        if same_user && (self.state.phase.is_in_flight() || self.state.phase == BootstrapPhase::Ready) {
            return &self.state;
        }

        self.cleanup_ephemeral(pool);
        self.connects.clear();
        self.connect_deadline = None;
        self.state = BootstrapState {
            phase: BootstrapPhase::DiscoveringIndexers,
            pubkey: Some(pubkey),
            ..Default::default()
        };
        info!("bootstrapping {}", pubkey);

        self.indexers.discover(self.config.indexer_count, now);
        let candidates = self.indexers.urls();
        if candidates.is_empty() {
            warn!("bootstrap: {NO_INDEXERS}");
            self.state.phase = BootstrapPhase::Error;
            self.state.error = Some(NO_INDEXERS.to_owned());
            return &self.state;
        }

        profiles.set_relays(INDEXERS, &candidates, pool);
        self.start_queries(pubkey, &candidates, now);
        &self.state
    }

    fn start_queries(&mut self, pubkey: Pubkey, urls: &[String], now: Instant) {
        let filters: Vec<Filter> = [kind::METADATA, kind::RELAY_LIST, kind::CONTACTS]
            .into_iter()
            .map(|k| {
                Filter::new()
                    .kinds([k])
                    .authors([pubkey.hex()])
                    .limit(1)
                    .build()
            })
            .collect();

        for raw in urls {
            let url = match NormRelayUrl::new(raw) {
                Ok(url) => url,
                Err(e) => {
                    warn!("skipping indexer {raw}: {e}");
                    continue;
                }
            };

            let mut relay = Relay::new(url, self.connector.clone(), RelayOptions::ephemeral());
            relay.connect();
            let sub = relay.subscribe(filters.clone());
            self.queries.push(IndexerQuery {
                relay,
                sub,
                responded: false,
            });
        }

        self.state.indexers_queried = self.queries.len();
        self.state.phase = BootstrapPhase::QueryingIndexers;
        self.query_deadline = Some(now + self.config.query_timeout);
        debug!("querying {} indexers", self.queries.len());
    }

    /// Advances whichever phase is running. Call after polling the pool.
    #[profiling::function]
    pub fn poll(&mut self, now: Instant, pool: &mut RelayPool, profiles: &mut RelayProfiles) {
        if self.indexers.poll(now) && self.state.pubkey.is_some() {
            profiles.set_relays(INDEXERS, &self.indexers.urls(), pool);
        }

        match self.state.phase {
            BootstrapPhase::QueryingIndexers => {
                self.poll_queries(now);
                let all_in = self.queries.iter().all(|q| q.responded);
                let timed_out = self.query_deadline.is_some_and(|at| now >= at);
                if all_in || timed_out {
                    if !all_in {
                        debug!(
                            "indexer query timed out with {}/{} responses",
                            self.state.indexers_responded, self.state.indexers_queried
                        );
                    }
                    self.query_deadline = None;
                    self.finish_queries(now, pool, profiles);
                }
            }
            BootstrapPhase::ConnectingRelays => {
                self.poll_connects(pool);
                let settled = self.connects.iter().all(|c| c.settled);
                let timed_out = self.connect_deadline.is_some_and(|at| now >= at);
                if settled || timed_out {
                    self.connect_deadline = None;
                    self.ready(pool);
                }
            }
            _ => {}
        }
    }

    fn poll_queries(&mut self, now: Instant) {
        let Some(pubkey) = self.state.pubkey else {
            return;
        };

        for query in &mut self.queries {
            query.relay.poll(now);

            let mut finished = false;
            for event in query.sub.drain() {
                match event {
                    SubscriptionEvent::Event { note, relay } => {
                        if note.pubkey != pubkey {
                            debug!("{relay} sent a note from someone else, ignoring");
                            continue;
                        }
                        absorb(&mut self.state, note);
                    }
                    SubscriptionEvent::Eose { .. } => finished = true,
                    SubscriptionEvent::Closed { relay, message } => {
                        debug!("{relay} closed the bootstrap query: {message}");
                        finished = true;
                    }
                }
            }

            // stored events are all we want, stop the indexer streaming more
            if finished {
                query.responded = true;
                query.relay.unsubscribe(query.sub.id().as_str());
            }

            if !query.responded && query.relay.status() == RelayStatus::Error {
                debug!("indexer {} failed", query.relay.url());
                query.responded = true;
            }
        }

        self.state.indexers_responded = self.queries.iter().filter(|q| q.responded).count();
    }

    fn finish_queries(&mut self, now: Instant, pool: &mut RelayPool, profiles: &mut RelayProfiles) {
        if self.state.relay_list.is_empty() {
            self.ready(pool);
            return;
        }

        self.state.phase = BootstrapPhase::ConnectingRelays;
        let write = self.state.outbox_urls();
        let read = self.state.inbox_urls();

        // decided before the profiles are touched, adding to an active
        // profile puts the relay in the pool straight away
        let mut fresh: Vec<PendingConnect> = Vec::new();
        for spec in &self.state.relay_list {
            let Ok(url) = NormRelayUrl::new(&spec.url) else {
                warn!("ignoring bad relay list entry {}", spec.url);
                continue;
            };
            if pool.has(url.as_str()) || fresh.iter().any(|c| c.url == url) {
                continue;
            }
            fresh.push(PendingConnect {
                url,
                write: spec.is_writable(),
                read: spec.is_readable(),
                settled: false,
            });
        }

        for url in &write {
            if let Err(e) = profiles.add_relay(OUTBOX, url, pool) {
                warn!("could not add {url} to outbox: {e}");
            }
        }
        for url in &read {
            if let Err(e) = profiles.add_relay(INBOX, url, pool) {
                warn!("could not add {url} to inbox: {e}");
            }
        }

        for pending in &fresh {
            match pool.add_relay_with_auth(pending.url.as_str()) {
                Ok(url) => {
                    if let Some(relay) = pool.relay_mut(url.as_str()) {
                        relay.connect();
                    }
                }
                Err(e) => warn!("could not connect to {}: {e}", pending.url),
            }
        }

        info!(
            "connecting to {} new relays ({} write, {} read)",
            fresh.len(),
            write.len(),
            read.len()
        );
        self.connects = fresh;
        self.connect_deadline = Some(now + self.config.connect_timeout);
    }

    fn poll_connects(&mut self, pool: &RelayPool) {
        for pending in self.connects.iter_mut().filter(|c| !c.settled) {
            let status = pool.relay(pending.url.as_str()).map(Relay::status);
            match status {
                Some(RelayStatus::Connected) => {
                    pending.settled = true;
                    if pending.write {
                        self.state.outbox_connected += 1;
                    }
                    if pending.read {
                        self.state.inbox_connected += 1;
                    }
                }
                Some(RelayStatus::Error) | None => {
                    warn!("failed to connect to {}", pending.url);
                    pending.settled = true;
                }
                Some(_) => {}
            }
        }
    }

    fn ready(&mut self, pool: &RelayPool) {
        self.state.phase = BootstrapPhase::Ready;
        self.cleanup_ephemeral(pool);
        info!(
            "bootstrap ready: {} relays, following {}, {} outbox / {} inbox connected",
            self.state.relay_list.len(),
            self.state.following_count,
            self.state.outbox_connected,
            self.state.inbox_connected
        );
    }

    /// Indexer connections the pool shares a url with are just dropped,
    /// the rest are disconnected.
    fn cleanup_ephemeral(&mut self, pool: &RelayPool) {
        for mut query in self.queries.drain(..) {
            if !pool.has(query.relay.url().as_str()) {
                query.relay.disconnect();
            }
        }
    }

    /// Back to idle, forgetting the user. The discovered indexers are kept.
    pub fn reset(&mut self, pool: &RelayPool) {
        self.cleanup_ephemeral(pool);
        self.connects.clear();
        self.query_deadline = None;
        self.connect_deadline = None;
        self.state = BootstrapState::default();
    }
}

fn absorb(state: &mut BootstrapState, note: Note) {
    match note.kind {
        kind::METADATA => {
            let best = merge_latest(state.profile_note.take(), note);
            state.profile = Some(ProfileState::from_note_contents(&best.content));
            state.profile_note = Some(best);
        }
        kind::RELAY_LIST => {
            let best = merge_latest(state.relay_list_note.take(), note);
            state.relay_list = parse_relay_list(&best);
            state.relay_list_note = Some(best);
        }
        kind::CONTACTS => {
            let best = merge_latest(state.contacts_note.take(), note);
            state.following_count = following_count(&best);
            state.contacts_note = Some(best);
        }
        other => debug!("bootstrap ignoring kind {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use oni_nostr::testing::MockNetwork;
    use oni_nostr::{FullKeypair, UnsignedNote};

    fn note_at(keys: &FullKeypair, kind: u32, created_at: u64, tags: Vec<Vec<String>>) -> Note {
        UnsignedNote::new(keys.pubkey, kind, "{}", tags)
            .created_at(created_at)
            .sign(keys)
            .unwrap()
    }

    #[test]
    fn newest_note_wins_in_any_order() {
        let keys = FullKeypair::generate();
        let old = note_at(&keys, kind::METADATA, 100, vec![]);
        let new = note_at(&keys, kind::METADATA, 200, vec![]);

        assert_eq!(merge_latest(Some(old.clone()), new.clone()).id, new.id);
        assert_eq!(merge_latest(Some(new.clone()), old.clone()).id, new.id);
        assert_eq!(merge_latest(None, old.clone()).id, old.id);

        let tie = note_at(&keys, kind::METADATA, 200, vec![vec!["x".into()]]);
        assert_eq!(merge_latest(Some(new.clone()), tie).id, new.id);
    }

    #[test]
    fn following_skips_empty_p_tags() {
        let keys = FullKeypair::generate();
        let contacts = note_at(
            &keys,
            kind::CONTACTS,
            1,
            vec![
                vec!["p".into(), "aa".into()],
                vec!["p".into(), "".into()],
                vec!["p".into()],
                vec!["t".into(), "bb".into()],
                vec!["p".into(), "cc".into(), "wss://x.example".into()],
            ],
        );
        assert_eq!(following_count(&contacts), 2);
    }

    #[test]
    fn same_pubkey_is_not_restarted() {
        let net = MockNetwork::new();
        let store = Rc::new(MemoryStore::new());
        let mut pool = RelayPool::new(net.connector());
        let mut profiles = RelayProfiles::load(store);
        let config = BootstrapConfig {
            fallback_indexers: vec!["wss://idx.example".into()],
            discover_indexers: false,
            ..Default::default()
        };
        let mut bootstrap = Bootstrap::new(config, net.connector());
        let keys = FullKeypair::generate();
        let now = Instant::now();

        bootstrap.start(keys.pubkey, &mut pool, &mut profiles, now);
        assert_eq!(bootstrap.phase(), BootstrapPhase::QueryingIndexers);
        assert_eq!(profiles.get(INDEXERS).unwrap().relays, vec!["wss://idx.example"]);

        bootstrap.start(keys.pubkey, &mut pool, &mut profiles, now);
        assert_eq!(net.connect_count("wss://idx.example"), 1);

        let other = FullKeypair::generate();
        bootstrap.start(other.pubkey, &mut pool, &mut profiles, now);
        assert_eq!(net.connect_count("wss://idx.example"), 2);
        assert_eq!(bootstrap.state().pubkey, Some(other.pubkey));
    }
}
