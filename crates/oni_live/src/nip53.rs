//! NIP-53 live activities: building, updating and publishing kind 30311
//! events.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::time::{Duration, Instant};

use oni_nostr::{
    kind, unix_now, Connector, NormRelayUrl, Note, PublishHandle, PublishResult, Pubkey, Relay,
    RelayOptions, RelayStatus, UnsignedNote,
};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveStatus {
    Planned,
    #[default]
    Live,
    Ended,
}

impl LiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LiveStatus::Planned => "planned",
            LiveStatus::Live => "live",
            LiveStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LiveStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "planned" => Ok(LiveStatus::Planned),
            "live" => Ok(LiveStatus::Live),
            "ended" => Ok(LiveStatus::Ended),
            other => Err(Error::Generic(format!("unknown live status {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub pubkey: Pubkey,
    pub relay: Option<String>,
    pub role: String,
    pub proof: Option<String>,
}

impl Participant {
    pub fn new(pubkey: Pubkey, role: impl Into<String>) -> Self {
        Self {
            pubkey,
            relay: None,
            role: role.into(),
            proof: None,
        }
    }

    pub fn host(pubkey: Pubkey) -> Self {
        Self::new(pubkey, "Host")
    }

    /// `["p", pubkey, relay or "", role, proof?]`. The relay slot is kept
    /// even when empty so the role stays at index 3.
    pub fn to_tag(&self) -> Vec<String> {
        let mut tag = vec![
            "p".to_owned(),
            self.pubkey.hex(),
            self.relay.clone().unwrap_or_default(),
            self.role.clone(),
        ];
        if let Some(proof) = &self.proof {
            tag.push(proof.clone());
        }
        tag
    }

    pub fn from_tag(tag: &[String]) -> Option<Self> {
        if tag.first().map(String::as_str) != Some("p") {
            return None;
        }

        let pubkey = Pubkey::from_hex(tag.get(1)?).ok()?;
        Some(Self {
            pubkey,
            relay: tag.get(2).filter(|r| !r.is_empty()).cloned(),
            role: tag.get(3).cloned().unwrap_or_default(),
            proof: tag.get(4).filter(|p| !p.is_empty()).cloned(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveEventConfig {
    /// The `d` tag. A fresh `oni-<unix seconds>` when unset.
    pub identifier: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub image: Option<String>,
    pub streaming_url: Option<String>,
    pub recording_url: Option<String>,
    pub starts: Option<u64>,
    pub ends: Option<u64>,
    pub status: LiveStatus,
    pub current_participants: Option<u64>,
    pub total_participants: Option<u64>,
    pub hashtags: Vec<String>,
    /// Relay hints for the `relays` tag
    pub relays: Vec<String>,
    pub participants: Vec<Participant>,
}

fn parse_u64(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse().ok())
}

impl LiveEventConfig {
    /// Everything a previous 30311 event says about itself. Fields the
    /// event doesn't carry stay unset and a missing status reads as live.
    pub fn from_note(note: &Note) -> Self {
        let text = |name: &str| note.tag_value(name).map(str::to_owned);

        Self {
            identifier: text("d"),
            title: text("title"),
            summary: text("summary"),
            image: text("image"),
            streaming_url: text("streaming"),
            recording_url: text("recording"),
            starts: parse_u64(note.tag_value("starts")),
            ends: parse_u64(note.tag_value("ends")),
            status: note
                .tag_value("status")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            current_participants: parse_u64(note.tag_value("current_participants")),
            total_participants: parse_u64(note.tag_value("total_participants")),
            hashtags: note
                .tags_named("t")
                .filter_map(|t| t.get(1).cloned())
                .collect(),
            relays: note
                .tags_named("relays")
                .next()
                .map(|t| t[1..].to_vec())
                .unwrap_or_default(),
            participants: note
                .tags_named("p")
                .filter_map(Participant::from_tag)
                .collect(),
        }
    }
}

pub fn live_event_address(pubkey: &Pubkey, identifier: &str) -> String {
    format!("{}:{}:{}", kind::LIVE_EVENT, pubkey.hex(), identifier)
}

/// The kind 30311 event described by `config`, unsigned. Only populated
/// fields produce tags.
pub fn build_live_event(pubkey: &Pubkey, config: &LiveEventConfig) -> UnsignedNote {
    let identifier = config
        .identifier
        .clone()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| format!("oni-{}", unix_now()));

    let mut tags: Vec<Vec<String>> = vec![vec!["d".to_owned(), identifier.clone()]];
    let mut push = |name: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            tags.push(vec![name.to_owned(), value]);
        }
    };

    push("title", config.title.clone());
    push("summary", config.summary.clone());
    push("image", config.image.clone());
    push("streaming", config.streaming_url.clone());
    push("recording", config.recording_url.clone());
    push("starts", config.starts.filter(|t| *t > 0).map(|t| t.to_string()));
    push("ends", config.ends.filter(|t| *t > 0).map(|t| t.to_string()));
    push("status", Some(config.status.to_string()));
    push(
        "current_participants",
        config.current_participants.map(|n| n.to_string()),
    );
    push(
        "total_participants",
        config.total_participants.map(|n| n.to_string()),
    );

    for hashtag in &config.hashtags {
        tags.push(vec!["t".to_owned(), hashtag.clone()]);
    }

    for participant in &config.participants {
        tags.push(participant.to_tag());
    }

    if !config.relays.is_empty() {
        let mut relays = vec!["relays".to_owned()];
        relays.extend(config.relays.iter().cloned());
        tags.push(relays);
    }

    tags.push(vec!["a".to_owned(), live_event_address(pubkey, &identifier)]);

    UnsignedNote::new(*pubkey, kind::LIVE_EVENT, "", tags)
}

/// Changes layered over a previous event. `None` keeps what was there.
#[derive(Debug, Clone, Default)]
pub struct LiveEventUpdate {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub image: Option<String>,
    pub streaming_url: Option<String>,
    pub recording_url: Option<String>,
    pub starts: Option<u64>,
    pub ends: Option<u64>,
    pub status: Option<LiveStatus>,
    pub current_participants: Option<u64>,
    pub total_participants: Option<u64>,
    pub hashtags: Option<Vec<String>>,
    pub relays: Option<Vec<String>>,
    pub participants: Option<Vec<Participant>>,
}

impl LiveEventUpdate {
    pub fn apply(&self, config: &mut LiveEventConfig) {
        fn set<T: Clone>(field: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                field.clone_from(value);
            }
        }

        set(&mut config.title, &self.title);
        set(&mut config.summary, &self.summary);
        set(&mut config.image, &self.image);
        set(&mut config.streaming_url, &self.streaming_url);
        set(&mut config.recording_url, &self.recording_url);
        set(&mut config.starts, &self.starts);
        set(&mut config.ends, &self.ends);
        set(&mut config.current_participants, &self.current_participants);
        set(&mut config.total_participants, &self.total_participants);

        if let Some(status) = self.status {
            config.status = status;
        }
        if let Some(hashtags) = &self.hashtags {
            config.hashtags.clone_from(hashtags);
        }
        if let Some(relays) = &self.relays {
            config.relays.clone_from(relays);
        }
        if let Some(participants) = &self.participants {
            config.participants.clone_from(participants);
        }
    }
}

/// A replacement for `previous` with `update` applied. The `d` identifier
/// carries over so relays replace rather than add.
pub fn update_live_event(
    pubkey: &Pubkey,
    previous: &Note,
    update: &LiveEventUpdate,
) -> UnsignedNote {
    let mut config = LiveEventConfig::from_note(previous);
    update.apply(&mut config);
    build_live_event(pubkey, &config)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// At least one relay accepted the event
    pub published: bool,
    /// Normalized relay url to what it said
    pub results: BTreeMap<String, PublishResult>,
}

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn connection_failed() -> PublishResult {
    PublishResult::rejected("connection failed")
}

struct Target {
    url: String,
    relay: Option<Relay>,
    handle: Option<PublishHandle>,
    result: Option<PublishResult>,
}

/// Publishes one event through short-lived connections that are torn
/// down once every relay has answered, timed out or failed to connect.
pub struct EphemeralPublish {
    note: Note,
    targets: Vec<Target>,
    connect_deadline: Instant,
    outcome: Option<PublishOutcome>,
}

impl EphemeralPublish {
    pub fn start(note: Note, urls: &[String], connector: &Rc<dyn Connector>, now: Instant) -> Self {
        let mut targets: Vec<Target> = Vec::with_capacity(urls.len());

        for raw in urls {
            let target = match NormRelayUrl::new(raw) {
                Ok(url) => {
                    if targets.iter().any(|t| t.url == url.as_str()) {
                        continue;
                    }
                    let mut relay =
                        Relay::new(url.clone(), connector.clone(), RelayOptions::ephemeral());
                    relay.connect();
                    Target {
                        url: url.into(),
                        relay: Some(relay),
                        handle: None,
                        result: None,
                    }
                }
                Err(e) => {
                    warn!("not publishing to {raw}: {e}");
                    Target {
                        url: raw.clone(),
                        relay: None,
                        handle: None,
                        result: Some(connection_failed()),
                    }
                }
            };
            targets.push(target);
        }

        debug!("publishing {} to {} relays", note.id, targets.len());
        let mut publish = Self {
            note,
            targets,
            connect_deadline: now + CONNECT_TIMEOUT,
            outcome: None,
        };
        publish.try_finish();
        publish
    }

    pub fn note(&self) -> &Note {
        &self.note
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&PublishOutcome> {
        self.outcome.as_ref()
    }

    /// Advances every connection. Returns true once the outcome is known.
    #[profiling::function]
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.outcome.is_some() {
            return true;
        }

        for target in self.targets.iter_mut().filter(|t| t.result.is_none()) {
            let Some(relay) = target.relay.as_mut() else {
                target.result = Some(connection_failed());
                continue;
            };

            relay.poll(now);

            if target.handle.is_none() {
                if relay.is_connected() {
                    target.handle = Some(relay.publish(self.note.clone()));
                    // the EVENT frame may already have been answered
                    relay.poll(now);
                } else if relay.status() == RelayStatus::Error || now >= self.connect_deadline {
                    debug!("could not connect to {} for publishing", target.url);
                    target.result = Some(connection_failed());
                    continue;
                }
            }

            if let Some(handle) = target.handle.as_mut() {
                if let Some(result) = handle.try_result() {
                    target.result = Some(result.clone());
                }
            }
        }

        self.try_finish();
        self.outcome.is_some()
    }

    fn try_finish(&mut self) {
        if self.targets.iter().any(|t| t.result.is_none()) {
            return;
        }

        let mut results = BTreeMap::new();
        for target in &mut self.targets {
            if let Some(mut relay) = target.relay.take() {
                relay.disconnect();
            }
            if let Some(result) = target.result.take() {
                results.insert(target.url.clone(), result);
            }
        }

        let accepted = results.values().filter(|r| r.accepted).count();
        let published = accepted > 0;
        if published {
            info!("{} accepted by {} relays", self.note.id, accepted);
        } else {
            warn!("no relay accepted {}", self.note.id);
        }

        self.outcome = Some(PublishOutcome { published, results });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oni_nostr::testing::MockNetwork;
    use oni_nostr::FullKeypair;
    use pretty_assertions::assert_eq;

    fn tag_names(note: &UnsignedNote) -> Vec<&str> {
        note.tags.iter().map(|t| t[0].as_str()).collect()
    }

    fn full_config(pubkey: Pubkey) -> LiveEventConfig {
        LiveEventConfig {
            identifier: Some("show".into()),
            title: Some("Morning show".into()),
            summary: Some("coffee".into()),
            image: Some("https://img.example/a.png".into()),
            streaming_url: Some("https://oni.example/hls/stream.m3u8".into()),
            recording_url: Some("https://oni.example/rec.mp4".into()),
            starts: Some(1_700_000_000),
            ends: Some(1_700_003_600),
            status: LiveStatus::Live,
            current_participants: Some(12),
            total_participants: Some(40),
            hashtags: vec!["music".into(), "live".into()],
            relays: vec!["wss://relay.damus.io".into(), "wss://nos.lol".into()],
            participants: vec![Participant::host(pubkey)],
        }
    }

    #[test]
    fn tags_come_out_in_order() {
        let keys = FullKeypair::generate();
        let note = build_live_event(&keys.pubkey, &full_config(keys.pubkey));

        assert_eq!(note.kind, kind::LIVE_EVENT);
        assert_eq!(note.content, "");
        assert_eq!(
            tag_names(&note),
            vec![
                "d",
                "title",
                "summary",
                "image",
                "streaming",
                "recording",
                "starts",
                "ends",
                "status",
                "current_participants",
                "total_participants",
                "t",
                "t",
                "p",
                "relays",
                "a"
            ]
        );

        assert_eq!(note.tags[13], vec!["p".to_string(), keys.pubkey.hex(), String::new(), "Host".into()]);
        assert_eq!(note.tags[14], vec!["relays", "wss://relay.damus.io", "wss://nos.lol"]);
        assert_eq!(note.tags[15][1], format!("30311:{}:show", keys.pubkey.hex()));
    }

    #[test]
    fn minimal_config_gets_a_generated_identifier() {
        let keys = FullKeypair::generate();
        let note = build_live_event(&keys.pubkey, &LiveEventConfig::default());

        assert_eq!(tag_names(&note), vec!["d", "status", "a"]);
        let d = &note.tags[0][1];
        assert!(d.starts_with("oni-"));
        assert!(note.tags[2][1].ends_with(&format!(":{d}")));
        assert_eq!(note.tags[1][1], "live");
    }

    #[test]
    fn ending_keeps_the_identifier() {
        let keys = FullKeypair::generate();
        let signed = build_live_event(&keys.pubkey, &full_config(keys.pubkey))
            .sign(&keys)
            .unwrap();

        let ended = update_live_event(
            &keys.pubkey,
            &signed,
            &LiveEventUpdate {
                status: Some(LiveStatus::Ended),
                ends: Some(1_700_009_999),
                ..Default::default()
            },
        );

        let config = LiveEventConfig::from_note(&ended.sign(&keys).unwrap());
        assert_eq!(config.identifier.as_deref(), Some("show"));
        assert_eq!(config.status, LiveStatus::Ended);
        assert_eq!(config.ends, Some(1_700_009_999));
        assert_eq!(config.title.as_deref(), Some("Morning show"));
        assert_eq!(config.hashtags, vec!["music", "live"]);
        assert_eq!(config.participants, vec![Participant::host(keys.pubkey)]);
        assert_eq!(config.relays.len(), 2);
    }

    #[test]
    fn participant_tags_round_trip_with_relay_and_proof() {
        let pk = Pubkey::new([7; 32]);
        let participant = Participant {
            pubkey: pk,
            relay: Some("wss://r.example".into()),
            role: "Speaker".into(),
            proof: Some("abcd".into()),
        };

        let tag = participant.to_tag();
        assert_eq!(tag.len(), 5);
        assert_eq!(Participant::from_tag(&tag), Some(participant));
        assert_eq!(Participant::from_tag(&["p".to_string(), "nothex".to_string()]), None);
    }

    fn signed_event() -> Note {
        let keys = FullKeypair::generate();
        build_live_event(&keys.pubkey, &LiveEventConfig::default())
            .sign(&keys)
            .unwrap()
    }

    #[test]
    fn publish_reports_per_relay_results() {
        let net = MockNetwork::new();
        net.serve("wss://ok.example", vec![]);
        net.unreachable("wss://down.example");

        let urls = vec![
            "wss://ok.example/".to_string(),
            "wss://down.example".to_string(),
            "wss://ok.example".to_string(),
            "not a url".to_string(),
        ];
        let now = Instant::now();
        let mut publish = EphemeralPublish::start(signed_event(), &urls, &net.connector(), now);
        assert!(publish.poll(now));

        let outcome = publish.outcome().unwrap();
        assert!(outcome.published);
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results["wss://ok.example"].accepted);
        assert_eq!(outcome.results["wss://down.example"], connection_failed());
        assert_eq!(outcome.results["not a url"], connection_failed());
        assert!(net.is_closed("wss://ok.example"));
    }

    #[test]
    fn silent_relays_give_up_after_the_connect_timeout() {
        let net = MockNetwork::new();
        let now = Instant::now();
        let urls = vec!["wss://slow.example".to_string()];
        let mut publish = EphemeralPublish::start(signed_event(), &urls, &net.connector(), now);

        assert!(!publish.poll(now + Duration::from_secs(9)));
        assert!(publish.poll(now + CONNECT_TIMEOUT));

        let outcome = publish.outcome().unwrap();
        assert!(!outcome.published);
        assert_eq!(outcome.results["wss://slow.example"].message, "connection failed");
    }

    #[test]
    fn nothing_to_publish_to_is_done_at_once() {
        let net = MockNetwork::new();
        let publish = EphemeralPublish::start(signed_event(), &[], &net.connector(), Instant::now());
        assert!(publish.is_done());
        assert_eq!(publish.outcome(), Some(&PublishOutcome::default()));
    }
}
