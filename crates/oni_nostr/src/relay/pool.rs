use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Instant;

use crossbeam_channel as chan;
use hashbrown::HashMap;
use tracing::{debug, info};

use crate::relay::subscription::SubCloser;
use crate::relay::{
    Connector, NormRelayUrl, PublishHandle, PublishResult, Relay, RelayOptions, RelayStatus,
    SeenEvents, SubscriptionEvent,
};
use crate::{Filter, Note, Result, Signer};

pub struct PoolRelay {
    pub relay: Relay,
    /// Gets the pool's auth signer
    pub wants_auth: bool,
}

impl PoolRelay {
    pub fn new(relay: Relay, wants_auth: bool) -> PoolRelay {
        PoolRelay { relay, wants_auth }
    }
}

/// A subscription spread over several pool relays, delivering into one
/// receiver. Dropping it closes every underlying REQ.
pub struct PoolSubscription {
    receiver: chan::Receiver<SubscriptionEvent>,
    closers: HashMap<NormRelayUrl, SubCloser>,
}

impl PoolSubscription {
    pub fn try_recv(&self) -> Option<SubscriptionEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn drain(&self) -> impl Iterator<Item = SubscriptionEvent> + '_ {
        self.receiver.try_iter()
    }

    pub fn receiver(&self) -> &chan::Receiver<SubscriptionEvent> {
        &self.receiver
    }

    /// Relays this subscription was sent to
    pub fn relays(&self) -> impl Iterator<Item = &NormRelayUrl> {
        self.closers.keys()
    }
}

/// Per-relay publish handles for one event
pub struct PoolPublish {
    handles: Vec<PublishHandle>,
}

impl PoolPublish {
    pub fn relay_count(&self) -> usize {
        self.handles.len()
    }

    /// URL to result, once every relay has answered or timed out. A publish
    /// to an empty pool settles immediately with an empty map.
    pub fn try_results(&mut self) -> Option<BTreeMap<NormRelayUrl, PublishResult>> {
        let mut results = BTreeMap::new();
        for handle in &mut self.handles {
            let result = handle.try_result()?.clone();
            results.insert(handle.relay().clone(), result);
        }
        Some(results)
    }

    pub fn is_settled(&mut self) -> bool {
        self.handles.iter_mut().all(|h| h.is_settled())
    }
}

/// Owns a set of relays keyed by normalized url. Events delivered to pool
/// subscriptions pass through one shared seen set so each id is handed
/// out once no matter how many relays carry it.
pub struct RelayPool {
    relays: BTreeMap<NormRelayUrl, PoolRelay>,
    seen: SeenEvents,
    auth_signer: Option<Rc<dyn Signer>>,
    connector: Rc<dyn Connector>,
    options: RelayOptions,
}

impl RelayPool {
    pub fn new(connector: Rc<dyn Connector>) -> Self {
        Self::with_options(connector, RelayOptions::default())
    }

    pub fn with_options(connector: Rc<dyn Connector>, options: RelayOptions) -> Self {
        RelayPool {
            relays: BTreeMap::new(),
            seen: SeenEvents::default(),
            auth_signer: None,
            connector,
            options,
        }
    }

    pub fn connector(&self) -> Rc<dyn Connector> {
        self.connector.clone()
    }

    pub fn has(&self, url: &str) -> bool {
        match NormRelayUrl::new(url) {
            Ok(url) => self.relays.contains_key(&url),
            Err(_) => false,
        }
    }

    pub fn urls(&self) -> BTreeSet<NormRelayUrl> {
        self.relays.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn relay(&self, url: &str) -> Option<&Relay> {
        let url = NormRelayUrl::new(url).ok()?;
        self.relays.get(&url).map(|r| &r.relay)
    }

    pub fn relay_mut(&mut self, url: &str) -> Option<&mut Relay> {
        let url = NormRelayUrl::new(url).ok()?;
        self.relays.get_mut(&url).map(|r| &mut r.relay)
    }

    pub fn add_relay(&mut self, url: &str) -> Result<NormRelayUrl> {
        self.insert_relay(url, false)
    }

    /// Like [`RelayPool::add_relay`], for relays that want NIP-42 auth from
    /// the pool's signer.
    pub fn add_relay_with_auth(&mut self, url: &str) -> Result<NormRelayUrl> {
        self.insert_relay(url, true)
    }

    fn insert_relay(&mut self, url: &str, wants_auth: bool) -> Result<NormRelayUrl> {
        let url = NormRelayUrl::new(url)?;

        if let Some(existing) = self.relays.get_mut(&url) {
            if wants_auth && !existing.wants_auth {
                existing.wants_auth = true;
                existing.relay.set_auth_signer(self.auth_signer.clone());
            }
            return Ok(url);
        }

        let mut relay = Relay::new(url.clone(), self.connector.clone(), self.options.clone());
        if wants_auth {
            relay.set_auth_signer(self.auth_signer.clone());
        }

        debug!("adding {} to the pool", url);
        self.relays
            .insert(url.clone(), PoolRelay::new(relay, wants_auth));
        Ok(url)
    }

    /// Disconnects and drops the relay. Returns false if it wasn't a member.
    pub fn remove_relay(&mut self, url: &str) -> bool {
        let Ok(url) = NormRelayUrl::new(url) else {
            return false;
        };

        match self.relays.remove(&url) {
            Some(mut pool_relay) => {
                pool_relay.relay.disconnect();
                info!("removed {} from the pool", url);
                true
            }
            None => false,
        }
    }

    pub fn connect_all(&mut self) {
        for pool_relay in self.relays.values_mut() {
            pool_relay.relay.connect();
        }
    }

    pub fn disconnect_all(&mut self) {
        for pool_relay in self.relays.values_mut() {
            pool_relay.relay.disconnect();
        }
    }

    /// Stores the signer and hands it to every relay added with auth.
    pub fn set_auth_signer(&mut self, signer: Option<Rc<dyn Signer>>) {
        self.auth_signer = signer;
        for pool_relay in self.relays.values_mut().filter(|r| r.wants_auth) {
            pool_relay.relay.set_auth_signer(self.auth_signer.clone());
        }
    }

    pub fn auth_signer(&self) -> Option<&Rc<dyn Signer>> {
        self.auth_signer.as_ref()
    }

    pub fn status(&self) -> BTreeMap<NormRelayUrl, RelayStatus> {
        self.relays
            .iter()
            .map(|(url, r)| (url.clone(), r.relay.status()))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.relays
            .values()
            .filter(|r| r.relay.is_connected())
            .count()
    }

    pub fn seen_events(&self) -> &SeenEvents {
        &self.seen
    }

    pub fn clear_seen_events(&mut self) {
        self.seen.clear();
    }

    pub fn subscribe(&mut self, filters: Vec<Filter>) -> PoolSubscription {
        let urls: Vec<NormRelayUrl> = self.relays.keys().cloned().collect();
        self.subscribe_on(&urls, filters)
    }

    /// Subscribes only on the given members. Urls that aren't in the pool
    /// are skipped.
    pub fn subscribe_to_urls(&mut self, urls: &[&str], filters: Vec<Filter>) -> PoolSubscription {
        let urls: Vec<NormRelayUrl> = urls
            .iter()
            .filter_map(|url| NormRelayUrl::new(url).ok())
            .filter(|url| {
                let member = self.relays.contains_key(url);
                if !member {
                    debug!("{} is not in the pool, not subscribing", url);
                }
                member
            })
            .collect();
        self.subscribe_on(&urls, filters)
    }

    fn subscribe_on(&mut self, urls: &[NormRelayUrl], filters: Vec<Filter>) -> PoolSubscription {
        let (tx, receiver) = chan::unbounded();
        let mut closers = HashMap::new();

        for url in urls {
            if let Some(pool_relay) = self.relays.get_mut(url) {
                let closer = pool_relay
                    .relay
                    .subscribe_with(filters.clone(), tx.clone(), true);
                closers.insert(url.clone(), closer);
            }
        }

        PoolSubscription { receiver, closers }
    }

    /// Closes the subscription on every relay it was sent to.
    pub fn unsubscribe(&mut self, sub: PoolSubscription) {
        for (url, closer) in &sub.closers {
            if let Some(pool_relay) = self.relays.get_mut(url) {
                pool_relay.relay.unsubscribe(closer.id.as_str());
            }
        }
    }

    pub fn publish(&mut self, note: &Note) -> PoolPublish {
        let handles = self
            .relays
            .values_mut()
            .map(|pool_relay| pool_relay.relay.publish(note.clone()))
            .collect();

        PoolPublish { handles }
    }

    #[profiling::function]
    pub fn poll(&mut self, now: Instant) {
        for pool_relay in self.relays.values_mut() {
            pool_relay.relay.poll_with(now, Some(&mut self.seen));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNetwork;
    use crate::{kind, FullKeypair, UnsignedNote};

    fn signed_note(content: &str) -> Note {
        let keys = FullKeypair::generate();
        UnsignedNote::new(keys.pubkey, kind::TEXT_NOTE, content, vec![])
            .sign(&keys)
            .expect("sign")
    }

    fn pool_with(net: &MockNetwork, urls: &[&str]) -> RelayPool {
        let mut pool = RelayPool::new(net.connector());
        for url in urls {
            pool.add_relay(url).expect("url");
        }
        pool
    }

    #[test]
    fn urls_are_normalized_and_unique() {
        let net = MockNetwork::new();
        let mut pool = pool_with(&net, &["wss://relay.damus.io/", "wss://relay.damus.io"]);
        pool.add_relay("wss://nos.lol").unwrap();

        assert_eq!(pool.len(), 2);
        assert!(pool.has("wss://relay.damus.io/"));
        assert!(pool.add_relay("https://nope.example").is_err());
    }

    #[test]
    fn duplicate_events_across_relays_are_delivered_once() {
        let net = MockNetwork::new();
        let mut pool = pool_with(&net, &["wss://a.example", "wss://b.example"]);
        pool.connect_all();
        net.open("wss://a.example");
        net.open("wss://b.example");
        pool.poll(Instant::now());

        let sub = pool.subscribe(vec![Filter::new().kinds([kind::TEXT_NOTE]).build()]);
        pool.poll(Instant::now());

        let note = signed_note("hello from both");
        for url in ["wss://a.example", "wss://b.example"] {
            let sub_id = net.last_req_id(url).expect("req sent");
            net.push_event(url, &sub_id, &note);
        }
        pool.poll(Instant::now());

        let events: Vec<_> = sub
            .drain()
            .filter(|e| matches!(e, SubscriptionEvent::Event { .. }))
            .collect();
        assert_eq!(events.len(), 1);
        assert!(pool.seen_events().contains(&note.id));
    }

    #[test]
    fn subscribe_to_urls_skips_strangers() {
        let net = MockNetwork::new();
        let mut pool = pool_with(&net, &["wss://a.example", "wss://b.example"]);

        let sub = pool.subscribe_to_urls(&["wss://b.example", "wss://c.example"], vec![]);
        let relays: Vec<_> = sub.relays().map(|u| u.to_string()).collect();
        assert_eq!(relays, vec!["wss://b.example".to_string()]);
        assert_eq!(pool.relay("wss://a.example").unwrap().subscription_count(), 0);
        assert_eq!(pool.relay("wss://b.example").unwrap().subscription_count(), 1);

        pool.unsubscribe(sub);
        assert_eq!(pool.relay("wss://b.example").unwrap().subscription_count(), 0);
    }

    #[test]
    fn publish_to_empty_pool_settles_immediately() {
        let net = MockNetwork::new();
        let mut pool = pool_with(&net, &[]);
        let mut publish = pool.publish(&signed_note("nobody home"));
        assert_eq!(publish.try_results(), Some(BTreeMap::new()));
    }

    #[test]
    fn auth_signer_only_reaches_relays_that_asked() {
        let net = MockNetwork::new();
        let mut pool = pool_with(&net, &["wss://open.example"]);
        pool.add_relay_with_auth("wss://paid.example").unwrap();

        pool.set_auth_signer(Some(Rc::new(crate::LocalSigner::generate())));
        assert!(pool.relay("wss://paid.example").unwrap().has_auth_signer());
        assert!(!pool.relay("wss://open.example").unwrap().has_auth_signer());

        pool.set_auth_signer(None);
        assert!(!pool.relay("wss://paid.example").unwrap().has_auth_signer());
    }

    #[test]
    fn removing_a_relay_disconnects_it() {
        let net = MockNetwork::new();
        let mut pool = pool_with(&net, &["wss://a.example"]);
        pool.connect_all();
        net.open("wss://a.example");
        pool.poll(Instant::now());
        assert_eq!(pool.connected_count(), 1);

        assert!(pool.remove_relay("wss://a.example/"));
        assert!(net.is_closed("wss://a.example"));
        assert!(pool.status().is_empty());
        assert!(!pool.remove_relay("wss://a.example"));
    }
}
