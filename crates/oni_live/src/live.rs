use std::rc::Rc;
use std::time::{Duration, Instant};

use oni_nostr::{unix_now, Connector, Note, SignRequest, Signer};
use tracing::{debug, error, info, warn};

use crate::nip53::{
    build_live_event, update_live_event, EphemeralPublish, LiveEventConfig, LiveEventUpdate,
    LiveStatus, Participant, PublishOutcome,
};
use crate::storage::KeyValueStore;

pub const LIVE_EVENTS_ENABLED_KEY: &str = "oni_live_events_enabled";

pub const SIGN_FAILED: &str = "Failed to create event (signer rejected?)";
pub const PUBLISH_FAILED: &str = "Failed to publish to any relay";

const DEFAULT_TITLE: &str = "Live Stream";

#[derive(Debug, Clone)]
pub struct LiveEventsConfig {
    pub update_interval: Duration,
    /// Used when the user has no outbox or broadcast relays
    pub fallback_relays: Vec<String>,
}

impl Default for LiveEventsConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(60),
            fallback_relays: vec![
                "wss://relay.damus.io".to_owned(),
                "wss://nos.lol".to_owned(),
                "wss://relay.nostr.band".to_owned(),
            ],
        }
    }
}

/// Outbox relays then selected broadcast relays, without repeats. Falls
/// back to `fallback` when both are empty.
pub fn publish_targets(outbox: &[String], broadcast: &[String], fallback: &[String]) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for url in outbox.iter().chain(broadcast) {
        let url = url.trim_end_matches('/');
        if !targets.iter().any(|t| t == url) {
            targets.push(url.to_owned());
        }
    }

    if targets.is_empty() {
        fallback.to_vec()
    } else {
        targets
    }
}

/// What the driver needs from the outside on each poll
pub struct LiveContext {
    pub signer: Option<Rc<dyn Signer>>,
    /// Where to publish. The configured fallback is used when empty.
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveAction {
    Start,
    Update,
    End,
}

enum Op {
    Signing {
        action: LiveAction,
        request: SignRequest,
    },
    Publishing {
        action: LiveAction,
        note: Note,
        publish: EphemeralPublish,
    },
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub title: String,
    pub streaming_url: Option<String>,
    pub viewers: u64,
}

/// Keeps a NIP-53 live event in step with a stream: announces it when the
/// stream starts, republishes it with fresh viewer counts on a timer and
/// marks it ended when the stream stops.
pub struct LiveEvents {
    config: LiveEventsConfig,
    connector: Rc<dyn Connector>,
    store: Rc<dyn KeyValueStore>,
    enabled: bool,
    current: Option<Note>,
    last_published: Option<u64>,
    last_outcome: Option<PublishOutcome>,
    error: Option<String>,
    op: Option<Op>,
    next_update: Option<Instant>,
    stream: Option<StreamInfo>,
    pending_start: bool,
    pending_end: bool,
}

impl LiveEvents {
    pub fn new(
        config: LiveEventsConfig,
        connector: Rc<dyn Connector>,
        store: Rc<dyn KeyValueStore>,
    ) -> Self {
        let enabled = store.get(LIVE_EVENTS_ENABLED_KEY).as_deref() == Some("1");
        Self {
            config,
            connector,
            store,
            enabled,
            current: None,
            last_published: None,
            last_outcome: None,
            error: None,
            op: None,
            next_update: None,
            stream: None,
            pending_start: false,
            pending_end: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        let value = if enabled { "1" } else { "0" };
        if let Err(e) = self.store.set(LIVE_EVENTS_ENABLED_KEY, value) {
            error!("could not save live events setting: {e}");
        }
    }

    /// The event currently announced as live
    pub fn current(&self) -> Option<&Note> {
        self.current.as_ref()
    }

    pub fn is_publishing(&self) -> bool {
        self.op.is_some()
    }

    /// Unix seconds of the last successful publish
    pub fn last_published(&self) -> Option<u64> {
        self.last_published
    }

    pub fn last_outcome(&self) -> Option<&PublishOutcome> {
        self.last_outcome.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn stream(&self) -> Option<&StreamInfo> {
        self.stream.as_ref()
    }

    pub fn next_update(&self) -> Option<Instant> {
        self.next_update
    }

    /// Queues the announcement. Ignored while disabled.
    pub fn stream_started(&mut self, title: &str, streaming_url: Option<String>, viewers: u64) {
        if !self.enabled {
            debug!("live events disabled, not announcing stream");
            return;
        }

        let title = if title.trim().is_empty() {
            DEFAULT_TITLE.to_owned()
        } else {
            title.to_owned()
        };

        self.stream = Some(StreamInfo {
            title,
            streaming_url,
            viewers,
        });
        self.pending_start = true;
        self.pending_end = false;
    }

    pub fn set_viewers(&mut self, viewers: u64) {
        if let Some(stream) = self.stream.as_mut() {
            stream.viewers = viewers;
        }
    }

    /// Stops the timer and queues the final `ended` event.
    pub fn stream_ended(&mut self) {
        self.next_update = None;
        self.pending_start = false;
        self.pending_end = true;
    }

    #[profiling::function]
    pub fn poll(&mut self, ctx: &LiveContext, now: Instant) {
        if self.op.is_some() {
            self.advance(ctx, now);
            return;
        }

        if let Some(action) = self.next_action(now) {
            self.begin(action, ctx, now);
            self.advance(ctx, now);
        }
    }

    fn next_action(&mut self, now: Instant) -> Option<LiveAction> {
        if self.pending_end {
            self.pending_end = false;
            if self.current.is_some() {
                return Some(LiveAction::End);
            }
            self.stream = None;
            return None;
        }

        if self.pending_start {
            self.pending_start = false;
            return Some(LiveAction::Start);
        }

        let due = self.next_update.is_some_and(|at| now >= at);
        if due && self.current.is_some() {
            self.next_update = None;
            return Some(LiveAction::Update);
        }

        None
    }

    fn begin(&mut self, action: LiveAction, ctx: &LiveContext, now: Instant) {
        let Some(signer) = ctx.signer.as_ref() else {
            warn!("no signer for live event {:?}", action);
            self.sign_failed(action, now);
            return;
        };

        let pubkey = signer.pubkey();
        let stream = self.stream.clone().unwrap_or(StreamInfo {
            title: DEFAULT_TITLE.to_owned(),
            streaming_url: None,
            viewers: 0,
        });

        let unsigned = match (action, self.current.as_ref()) {
            (LiveAction::Start, _) | (_, None) => {
                let now_secs = unix_now();
                build_live_event(
                    &pubkey,
                    &LiveEventConfig {
                        identifier: Some(format!("oni-{now_secs}")),
                        title: Some(stream.title),
                        streaming_url: stream.streaming_url,
                        starts: Some(now_secs),
                        status: LiveStatus::Live,
                        current_participants: Some(stream.viewers),
                        participants: vec![Participant::host(pubkey)],
                        relays: self.targets(ctx),
                        ..Default::default()
                    },
                )
            }
            (LiveAction::Update, Some(current)) => update_live_event(
                &pubkey,
                current,
                &LiveEventUpdate {
                    title: Some(stream.title),
                    current_participants: Some(stream.viewers),
                    status: Some(LiveStatus::Live),
                    ..Default::default()
                },
            ),
            (LiveAction::End, Some(current)) => update_live_event(
                &pubkey,
                current,
                &LiveEventUpdate {
                    status: Some(LiveStatus::Ended),
                    ends: Some(unix_now()),
                    ..Default::default()
                },
            ),
        };

        debug!("signing live event {:?}", action);
        self.op = Some(Op::Signing {
            action,
            request: signer.sign(unsigned),
        });
    }

    fn targets(&self, ctx: &LiveContext) -> Vec<String> {
        if ctx.targets.is_empty() {
            self.config.fallback_relays.clone()
        } else {
            ctx.targets.clone()
        }
    }

    fn advance(&mut self, ctx: &LiveContext, now: Instant) {
        if let Some(Op::Signing { action, request }) = self.op.as_mut() {
            let action = *action;
            let Some(result) = request.try_take() else {
                return;
            };

            match result {
                Ok(note) => {
                    let targets = self.targets(ctx);
                    let publish = EphemeralPublish::start(note.clone(), &targets, &self.connector, now);
                    self.op = Some(Op::Publishing {
                        action,
                        note,
                        publish,
                    });
                }
                Err(e) => {
                    warn!("signer refused live event {:?}: {e}", action);
                    self.op = None;
                    self.sign_failed(action, now);
                    return;
                }
            }
        }

        let done = match self.op.as_mut() {
            Some(Op::Publishing { publish, .. }) => publish.poll(now),
            _ => false,
        };
        if !done {
            return;
        }

        let Some(Op::Publishing {
            action,
            note,
            publish,
        }) = self.op.take()
        else {
            return;
        };
        let outcome = publish.outcome().cloned().unwrap_or_default();
        self.published(action, note, outcome, now);
    }

    fn sign_failed(&mut self, action: LiveAction, now: Instant) {
        match action {
            LiveAction::Start => self.error = Some(SIGN_FAILED.to_owned()),
            // try again next tick
            LiveAction::Update => self.next_update = Some(now + self.config.update_interval),
            LiveAction::End => self.finish_stream(),
        }
    }

    fn published(&mut self, action: LiveAction, note: Note, outcome: PublishOutcome, now: Instant) {
        let published = outcome.published;
        self.last_outcome = Some(outcome);

        match action {
            LiveAction::Start => {
                if published {
                    info!("announced live event {}", note.id);
                    self.current = Some(note);
                    self.error = None;
                    self.last_published = Some(unix_now());
                    self.next_update = Some(now + self.config.update_interval);
                } else {
                    self.error = Some(PUBLISH_FAILED.to_owned());
                }
            }
            LiveAction::Update => {
                if published {
                    self.last_published = Some(unix_now());
                } else {
                    warn!("live event update reached no relay");
                }
                self.current = Some(note);
                if !self.pending_end {
                    self.next_update = Some(now + self.config.update_interval);
                }
            }
            LiveAction::End => {
                if published {
                    info!("published stream ended event {}", note.id);
                } else {
                    warn!("stream ended event reached no relay");
                }
                self.finish_stream();
            }
        }
    }

    fn finish_stream(&mut self) {
        self.current = None;
        self.stream = None;
        self.next_update = None;
    }

    /// Forgets everything about the stream. The enabled setting stays.
    pub fn reset(&mut self) {
        self.current = None;
        self.last_published = None;
        self.last_outcome = None;
        self.error = None;
        self.op = None;
        self.next_update = None;
        self.stream = None;
        self.pending_start = false;
        self.pending_end = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use oni_nostr::testing::MockNetwork;
    use oni_nostr::{LocalSigner, RejectingSigner};
    use pretty_assertions::assert_eq;

    fn driver(net: &MockNetwork) -> (LiveEvents, Rc<MemoryStore>) {
        let store = Rc::new(MemoryStore::new());
        let mut live = LiveEvents::new(LiveEventsConfig::default(), net.connector(), store.clone());
        live.set_enabled(true);
        (live, store)
    }

    #[test]
    fn targets_merge_and_fall_back() {
        let fallback = LiveEventsConfig::default().fallback_relays;
        let outbox = vec!["wss://a.example/".to_string(), "wss://b.example".to_string()];
        let broadcast = vec!["wss://b.example".to_string(), "wss://c.example".to_string()];

        assert_eq!(
            publish_targets(&outbox, &broadcast, &fallback),
            vec!["wss://a.example", "wss://b.example", "wss://c.example"]
        );
        assert_eq!(publish_targets(&[], &[], &fallback), fallback);
    }

    #[test]
    fn enabled_flag_is_persisted_as_digit() {
        let net = MockNetwork::new();
        let (mut live, store) = driver(&net);
        assert_eq!(store.get(LIVE_EVENTS_ENABLED_KEY).as_deref(), Some("1"));

        live.set_enabled(false);
        assert_eq!(store.get(LIVE_EVENTS_ENABLED_KEY).as_deref(), Some("0"));

        live.stream_started("ignored", None, 0);
        assert!(live.stream().is_none());

        let reloaded = LiveEvents::new(LiveEventsConfig::default(), net.connector(), store);
        assert!(!reloaded.is_enabled());
    }

    #[test]
    fn rejected_signature_surfaces_an_error() {
        let net = MockNetwork::new();
        let (mut live, _) = driver(&net);
        let signer: Rc<dyn Signer> = Rc::new(RejectingSigner::new(oni_nostr::Pubkey::new([1; 32])));
        let ctx = LiveContext {
            signer: Some(signer),
            targets: vec!["wss://r.example".into()],
        };

        live.stream_started("", None, 3);
        live.poll(&ctx, Instant::now());

        assert_eq!(live.error(), Some(SIGN_FAILED));
        assert!(live.current().is_none());
        assert!(!live.is_publishing());
        assert_eq!(net.connect_count("wss://r.example"), 0);
    }

    #[test]
    fn nobody_accepting_is_a_publish_error() {
        let net = MockNetwork::new();
        net.unreachable("wss://r.example");
        let (mut live, _) = driver(&net);
        let ctx = LiveContext {
            signer: Some(Rc::new(LocalSigner::generate())),
            targets: vec!["wss://r.example".into()],
        };

        live.stream_started("Show", None, 0);
        live.poll(&ctx, Instant::now());

        assert_eq!(live.error(), Some(PUBLISH_FAILED));
        assert!(live.current().is_none());
        assert_eq!(live.next_update(), None);
    }

    #[test]
    fn empty_title_becomes_default() {
        let net = MockNetwork::new();
        net.serve("wss://r.example", vec![]);
        let (mut live, _) = driver(&net);
        let ctx = LiveContext {
            signer: Some(Rc::new(LocalSigner::generate())),
            targets: vec!["wss://r.example".into()],
        };

        live.stream_started("  ", Some("https://oni.example/hls/stream.m3u8".into()), 5);
        live.poll(&ctx, Instant::now());

        let current = live.current().expect("announced");
        assert_eq!(current.tag_value("title"), Some(DEFAULT_TITLE));
        assert_eq!(current.tag_value("status"), Some("live"));
        assert_eq!(current.tag_value("current_participants"), Some("5"));
        assert_eq!(
            current.tag_value("streaming"),
            Some("https://oni.example/hls/stream.m3u8")
        );
        assert_eq!(current.tag_value("relays"), Some("wss://r.example"));
        assert!(live.error().is_none());
    }
}
