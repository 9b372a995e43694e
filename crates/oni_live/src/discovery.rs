use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use oni_nostr::{
    kind, Connector, Filter, Note, NormRelayUrl, Relay, RelayOptions, RelayStatus, Subscription,
    SubscriptionEvent,
};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::{load_json, save_json, KeyValueStore};

pub const BROADCAST_SELECTED_KEY: &str = "oni_broadcast_relays_selected";

/// Where the current relay list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    #[default]
    None,
    Fallback,
    Nip66,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredRelay {
    pub url: String,
    /// Open round trip in milliseconds
    pub rtt: u32,
    pub nips: Vec<u32>,
}

impl DiscoveredRelay {
    pub fn new(url: impl Into<String>, rtt: u32, nips: &[u32]) -> Self {
        Self {
            url: url.into(),
            rtt,
            nips: nips.to_vec(),
        }
    }

    pub fn supports(&self, nip: u32) -> bool {
        self.nips.contains(&nip)
    }
}

const UNKNOWN_RTT: u32 = 9999;

pub const MONITOR_RELAYS: [&str; 2] = ["wss://relay.nostr.watch", "wss://history.nostr.watch"];

pub const FALLBACK_INDEXERS: [&str; 6] = [
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://nos.lol",
    "wss://relay.snort.social",
    "wss://purplepag.es",
    "wss://relay.primal.net",
];

pub fn fallback_broadcast() -> Vec<DiscoveredRelay> {
    vec![
        DiscoveredRelay::new("wss://relay.damus.io", 100, &[1, 11, 53]),
        DiscoveredRelay::new("wss://nos.lol", 100, &[1, 11, 53]),
        DiscoveredRelay::new("wss://relay.nostr.band", 100, &[1, 11, 50, 53]),
        DiscoveredRelay::new("wss://relay.snort.social", 100, &[1, 11, 53]),
        DiscoveredRelay::new("wss://relay.primal.net", 100, &[1, 11, 53]),
        DiscoveredRelay::new("wss://nostr.wine", 150, &[1, 11, 53]),
        DiscoveredRelay::new("wss://relay.nostr.wirednet.jp", 200, &[1, 11, 53]),
        DiscoveredRelay::new("wss://nostr-pub.wellorder.net", 150, &[1, 11]),
    ]
}

/// How one category of relays is discovered and ranked
#[derive(Debug, Clone)]
pub struct DiscoveryPolicy {
    pub fallback: Vec<DiscoveredRelay>,
    /// Relays announcing this NIP sort first
    pub target_nip: Option<u32>,
    /// Skip relays a monitor marked `["R","read"]`
    pub reject_read_only: bool,
    /// Empty disables the NIP-66 upgrade
    pub monitors: Vec<String>,
    pub upgrade_timeout: Duration,
}

impl DiscoveryPolicy {
    pub fn indexers() -> Self {
        Self {
            fallback: FALLBACK_INDEXERS
                .iter()
                .map(|url| DiscoveredRelay::new(*url, UNKNOWN_RTT, &[]))
                .collect(),
            target_nip: None,
            reject_read_only: false,
            monitors: MONITOR_RELAYS.iter().map(|s| s.to_string()).collect(),
            upgrade_timeout: Duration::from_secs(8),
        }
    }

    pub fn broadcast() -> Self {
        Self {
            fallback: fallback_broadcast(),
            target_nip: Some(53),
            reject_read_only: true,
            ..Self::indexers()
        }
    }

    pub fn with_fallback_urls(mut self, urls: &[String]) -> Self {
        self.fallback = urls
            .iter()
            .map(|url| DiscoveredRelay::new(url.as_str(), UNKNOWN_RTT, &[]))
            .collect();
        self
    }

    pub fn without_monitors(mut self) -> Self {
        self.monitors.clear();
        self
    }

    /// Reads one kind 30166 announcement. `None` if it doesn't describe a
    /// usable wss relay.
    pub fn candidate(&self, note: &Note) -> Option<DiscoveredRelay> {
        if note.kind != kind::RELAY_DISCOVERY {
            return None;
        }

        let url = note.tag_value("d")?.trim_end_matches('/');
        if !url.starts_with("wss://") || url.len() <= "wss://".len() {
            return None;
        }

        if self.reject_read_only
            && note
                .tags_named("R")
                .any(|t| t.get(1).map(String::as_str) == Some("read"))
        {
            return None;
        }

        let rtt = note
            .tags_named("rtt")
            .find(|t| t.get(1).map(String::as_str) == Some("open"))
            .and_then(|t| t.get(2))
            .and_then(|ms| ms.parse::<u32>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(UNKNOWN_RTT);

        let nips = note
            .tags_named("N")
            .filter_map(|t| t.get(1))
            .filter_map(|n| n.parse::<u32>().ok())
            .collect();

        Some(DiscoveredRelay {
            url: url.to_owned(),
            rtt,
            nips,
        })
    }

    /// Target NIP first, then fastest. Ties keep their input order.
    pub fn rank(&self, mut relays: Vec<DiscoveredRelay>, count: usize) -> Vec<DiscoveredRelay> {
        relays.sort_by_key(|r| {
            let lacks_target = self.target_nip.is_some_and(|nip| !r.supports(nip));
            (lacks_target, r.rtt)
        });
        relays.truncate(count);
        relays
    }
}

struct MonitorQuery {
    relay: Relay,
    sub: Subscription,
    done: bool,
}

/// A background NIP-66 query against the monitor relays
struct Upgrade {
    monitors: Vec<MonitorQuery>,
    /// Best announcement per url
    candidates: BTreeMap<String, DiscoveredRelay>,
    deadline: Instant,
    count: usize,
}

impl Upgrade {
    fn start(
        policy: &DiscoveryPolicy,
        connector: &Rc<dyn Connector>,
        count: usize,
        now: Instant,
    ) -> Self {
        let filter = Filter::new()
            .kinds([kind::RELAY_DISCOVERY])
            .limit((count * 3) as u64)
            .build();

        let mut monitors = Vec::with_capacity(policy.monitors.len());
        for url in &policy.monitors {
            let url = match NormRelayUrl::new(url) {
                Ok(url) => url,
                Err(e) => {
                    warn!("skipping monitor relay {url}: {e}");
                    continue;
                }
            };

            let mut relay = Relay::new(url, connector.clone(), RelayOptions::ephemeral());
            relay.connect();
            let sub = relay.subscribe(vec![filter.clone()]);
            monitors.push(MonitorQuery {
                relay,
                sub,
                done: false,
            });
        }

        Self {
            monitors,
            candidates: BTreeMap::new(),
            deadline: now + policy.upgrade_timeout,
            count,
        }
    }

    /// True once every monitor answered or failed, or time ran out
    fn poll(&mut self, policy: &DiscoveryPolicy, now: Instant) -> bool {
        for monitor in self.monitors.iter_mut().filter(|m| !m.done) {
            monitor.relay.poll(now);

            for event in monitor.sub.drain() {
                match event {
                    SubscriptionEvent::Event { note, .. } => {
                        let Some(found) = policy.candidate(&note) else {
                            continue;
                        };
                        let better = self
                            .candidates
                            .get(&found.url)
                            .map_or(true, |existing| found.rtt < existing.rtt);
                        if better {
                            self.candidates.insert(found.url.clone(), found);
                        }
                    }
                    SubscriptionEvent::Eose { .. } | SubscriptionEvent::Closed { .. } => {
                        monitor.done = true;
                    }
                }
            }

            if monitor.relay.status() == RelayStatus::Error {
                debug!("monitor {} failed", monitor.relay.url());
                monitor.done = true;
            }
        }

        self.monitors.iter().all(|m| m.done) || now >= self.deadline
    }

    fn finish(self) -> Vec<DiscoveredRelay> {
        for mut monitor in self.monitors {
            monitor.relay.disconnect();
        }
        self.candidates.into_values().collect()
    }
}

/// Keeps a ranked relay list for one category. The list is usable right
/// away from the fallback and gets replaced if the monitors come back
/// with anything.
pub struct Discovery {
    policy: DiscoveryPolicy,
    connector: Rc<dyn Connector>,
    relays: Vec<DiscoveredRelay>,
    source: DiscoverySource,
    upgrade: Option<Upgrade>,
}

impl Discovery {
    pub fn new(policy: DiscoveryPolicy, connector: Rc<dyn Connector>) -> Self {
        Self {
            policy,
            connector,
            relays: vec![],
            source: DiscoverySource::None,
            upgrade: None,
        }
    }

    pub fn policy(&self) -> &DiscoveryPolicy {
        &self.policy
    }

    pub fn relays(&self) -> &[DiscoveredRelay] {
        &self.relays
    }

    pub fn urls(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url.clone()).collect()
    }

    pub fn source(&self) -> DiscoverySource {
        self.source
    }

    pub fn is_upgrading(&self) -> bool {
        self.upgrade.is_some()
    }

    /// Fills the list from the fallback and kicks off the NIP-66 upgrade.
    /// Does nothing if a list is already there or an upgrade is running.
    pub fn discover(&mut self, count: usize, now: Instant) {
        if self.upgrade.is_some() || !self.relays.is_empty() {
            return;
        }

        self.relays = self.policy.fallback.iter().take(count).cloned().collect();
        self.source = DiscoverySource::Fallback;
        debug!("using {} fallback relays", self.relays.len());

        if !self.policy.monitors.is_empty() {
            self.upgrade = Some(Upgrade::start(&self.policy, &self.connector, count, now));
        }
    }

    /// Returns true when this poll replaced the list with NIP-66 results.
    #[profiling::function]
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(upgrade) = self.upgrade.as_mut() else {
            return false;
        };

        if !upgrade.poll(&self.policy, now) {
            return false;
        }

        let Some(upgrade) = self.upgrade.take() else {
            return false;
        };
        let count = upgrade.count;
        let found = upgrade.finish();
        if found.is_empty() {
            debug!("NIP-66 upgrade found nothing, keeping fallback");
            return false;
        }

        self.relays = self.policy.rank(found, count);
        self.source = DiscoverySource::Nip66;
        info!("upgraded to {} relays via NIP-66", self.relays.len());
        true
    }

    /// Forgets the list and stops any upgrade in flight
    pub fn reset(&mut self) {
        if let Some(upgrade) = self.upgrade.take() {
            upgrade.finish();
        }
        self.relays.clear();
        self.source = DiscoverySource::None;
    }
}

pub const BROADCAST_COUNT: usize = 20;

/// Relays to push live events to: a discovered list plus the user's
/// persisted selection from it.
pub struct BroadcastRelays {
    discovery: Discovery,
    selected: BTreeSet<String>,
    store: Rc<dyn KeyValueStore>,
}

impl BroadcastRelays {
    pub fn load(
        store: Rc<dyn KeyValueStore>,
        connector: Rc<dyn Connector>,
        policy: DiscoveryPolicy,
    ) -> Self {
        let selected = load_json::<Vec<String>>(&*store, BROADCAST_SELECTED_KEY)
            .map(|urls| urls.into_iter().collect())
            .unwrap_or_else(|| policy.fallback.iter().map(|r| r.url.clone()).collect());

        Self {
            discovery: Discovery::new(policy, connector),
            selected,
            store,
        }
    }

    fn persist(&self) {
        save_json(&*self.store, BROADCAST_SELECTED_KEY, &self.selected_urls());
    }

    pub fn discover(&mut self, now: Instant) {
        self.discovery.discover(BROADCAST_COUNT, now);
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        self.discovery.poll(now)
    }

    pub fn relays(&self) -> &[DiscoveredRelay] {
        self.discovery.relays()
    }

    pub fn source(&self) -> DiscoverySource {
        self.discovery.source()
    }

    pub fn selected_urls(&self) -> Vec<String> {
        self.selected.iter().cloned().collect()
    }

    pub fn is_selected(&self, url: &str) -> bool {
        self.selected.contains(url)
    }

    pub fn toggle(&mut self, url: &str) {
        if !self.selected.remove(url) {
            self.selected.insert(url.to_owned());
        }
        self.persist();
    }

    pub fn set_selected(&mut self, url: &str, selected: bool) {
        if selected {
            self.selected.insert(url.to_owned());
        } else {
            self.selected.remove(url);
        }
        self.persist();
    }

    /// Drops the discovered list. The selection is the user's and stays.
    pub fn reset(&mut self) {
        self.discovery.reset();
    }
}
