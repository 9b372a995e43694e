use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use ewebsock::{WsEvent, WsMessage};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{kind, ClientMessage, Filter, Note, NoteId, SignRequest, Signer, UnsignedNote};

mod backoff;
mod identity;
pub mod message;
pub mod pool;
mod publish;
mod seen;
mod subscription;
mod websocket;

pub use backoff::Backoff;
pub use identity::{NormRelayUrl, RelayReqId};
pub use message::{CommandResult, RelayEvent, RelayMessage};
pub use publish::{PublishHandle, PublishResult};
pub use seen::SeenEvents;
pub use subscription::{Subscription, SubscriptionEvent};
pub use websocket::{Connector, EwebsockConnector, NoopWakeup, Wakeup, WebsocketConn};

use publish::PendingPublish;
use subscription::{RelaySub, SubCloser};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

impl RelayStatus {
    /// Connected or on the way there
    pub fn is_active(self) -> bool {
        matches!(self, RelayStatus::Connected | RelayStatus::Connecting)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayStatus::Connected => "connected",
            RelayStatus::Connecting => "connecting",
            RelayStatus::Disconnected => "disconnected",
            RelayStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub publish_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// Zero disables automatic reconnects
    pub max_reconnect_attempts: u32,
    pub ping_rate: Duration,
    /// Drop incoming events whose id or signature doesn't check out
    pub verify_events: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(60),
            max_reconnect_attempts: 5,
            ping_rate: Duration::from_secs(25),
            verify_events: true,
        }
    }
}

impl RelayOptions {
    /// Short-lived connections that should fail fast instead of retrying
    pub fn ephemeral() -> Self {
        Self {
            max_reconnect_attempts: 0,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct AuthState {
    signer: Option<Rc<dyn Signer>>,
    pending: Option<SignRequest>,
    authenticated: bool,
    failed: bool,
}

/// One relay connection: socket lifecycle, subscriptions, publishes and
/// NIP-42 auth. Nothing happens until [`Relay::poll`] is called, which
/// drains the socket and fires any due timers.
pub struct Relay {
    url: NormRelayUrl,
    status: RelayStatus,
    conn: Option<Box<dyn WebsocketConn>>,
    connector: Rc<dyn Connector>,
    options: RelayOptions,
    subs: HashMap<RelayReqId, RelaySub>,
    publishes: HashMap<NoteId, Vec<PendingPublish>>,
    queue: VecDeque<ClientMessage>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    /// The last open failed and the next poll owes it a reconnect
    connect_failed: bool,
    auth: AuthState,
    last_ping: Instant,
    closed_tx: chan::Sender<RelayReqId>,
    closed_rx: chan::Receiver<RelayReqId>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("subs", &self.subs.len())
            .field("publishes", &self.publishes.len())
            .finish()
    }
}

impl Hash for Relay {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hashes the Relay by hashing the URL
        self.url.hash(state);
    }
}

impl PartialEq for Relay {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Relay {}

impl Relay {
    pub fn new(url: NormRelayUrl, connector: Rc<dyn Connector>, options: RelayOptions) -> Self {
        let backoff = Backoff::new(
            options.reconnect_base,
            options.reconnect_cap,
            options.max_reconnect_attempts,
        );
        let (closed_tx, closed_rx) = chan::unbounded();

        Self {
            url,
            status: RelayStatus::Disconnected,
            conn: None,
            connector,
            options,
            subs: HashMap::new(),
            publishes: HashMap::new(),
            queue: VecDeque::new(),
            backoff,
            reconnect_at: None,
            connect_failed: false,
            auth: AuthState::default(),
            last_ping: Instant::now(),
            closed_tx,
            closed_rx,
        }
    }

    pub fn url(&self) -> &NormRelayUrl {
        &self.url
    }

    pub fn status(&self) -> RelayStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == RelayStatus::Connected
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    pub fn pending_publishes(&self) -> usize {
        self.publishes.values().map(Vec::len).sum()
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    /// When the next automatic reconnect will fire, if one is scheduled
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.authenticated
    }

    pub fn auth_failed(&self) -> bool {
        self.auth.failed
    }

    pub fn has_auth_signer(&self) -> bool {
        self.auth.signer.is_some()
    }

    pub fn set_auth_signer(&mut self, signer: Option<Rc<dyn Signer>>) {
        self.auth.signer = signer;
    }

    /// Opens the socket. Does nothing while already connecting or connected.
    /// Also the way out of [`RelayStatus::Error`]: backoff and auth state
    /// start fresh.
    pub fn connect(&mut self) {
        if self.conn.is_some() && self.status.is_active() {
            return;
        }

        self.reconnect_at = None;
        self.backoff.reset();
        self.auth.failed = false;
        self.open_socket();
    }

    /// Closes the socket for good: pending publishes resolve as
    /// disconnected, subscriptions and queued messages are dropped and no
    /// reconnect is scheduled.
    pub fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.connect_failed = false;
        self.backoff.reset();

        for (_, pending) in self.publishes.drain() {
            for publish in pending {
                publish.resolve(PublishResult::disconnected());
            }
        }

        self.subs.clear();
        self.queue.clear();
        self.auth.pending = None;
        self.auth.authenticated = false;

        if let Some(mut conn) = self.conn.take() {
            conn.close();
            info!("disconnected from {}", self.url);
        }

        self.status = RelayStatus::Disconnected;
    }

    pub fn subscribe(&mut self, filters: Vec<Filter>) -> Subscription {
        let (tx, rx) = chan::unbounded();
        let closer = self.subscribe_with(filters, tx, false);
        Subscription::new(self.url.clone(), rx, closer)
    }

    /// Registers a subscription delivering into `sink`. The returned closer
    /// unsubscribes when dropped.
    pub(crate) fn subscribe_with(
        &mut self,
        filters: Vec<Filter>,
        sink: chan::Sender<SubscriptionEvent>,
        dedup: bool,
    ) -> SubCloser {
        let id = RelayReqId::default();
        debug!("subscribing {} on {} with {:?}", id, self.url, filters);

        self.send(ClientMessage::req(id.to_string(), filters.clone()));
        self.subs.insert(
            id.clone(),
            RelaySub {
                filters,
                sink,
                dedup,
            },
        );

        SubCloser {
            id,
            tx: self.closed_tx.clone(),
        }
    }

    /// Sends CLOSE if the subscription is still registered.
    pub fn unsubscribe(&mut self, id: &str) {
        if self.subs.remove(id).is_some() {
            debug!("closing {} on {}", id, self.url);
            self.send(ClientMessage::close(id.to_owned()));
        }
    }

    /// The timeout runs from the next [`Relay::poll`].
    pub fn publish(&mut self, note: Note) -> PublishHandle {
        let (pending, handle) = PublishHandle::pending(note.id, self.url.clone());

        self.publishes.entry(note.id).or_default().push(pending);
        self.send(ClientMessage::event(note));
        handle
    }

    /// Sends now if the socket is open, otherwise queues until it opens.
    pub fn send(&mut self, msg: ClientMessage) {
        match self.conn.as_mut() {
            Some(conn) if self.status == RelayStatus::Connected => {
                send_frame(conn.as_mut(), &self.url, &msg);
            }
            _ => {
                debug!("queueing message for {} until connected", self.url);
                self.queue.push_back(msg);
            }
        }
    }

    pub fn poll(&mut self, now: Instant) {
        self.poll_with(now, None)
    }

    /// [`Relay::poll`], with pooled subscriptions gated through `seen`.
    #[profiling::function]
    pub(crate) fn poll_with(&mut self, now: Instant, mut seen: Option<&mut SeenEvents>) {
        if self.reconnect_at.is_some_and(|at| now >= at) {
            self.reconnect_at = None;
            debug!(
                "reconnecting to {} (attempt {})",
                self.url,
                self.backoff.attempts()
            );
            self.open_socket();
        }

        if std::mem::take(&mut self.connect_failed) {
            self.schedule_reconnect(now);
        }

        while let Some(event) = self.conn.as_mut().and_then(|c| c.try_recv()) {
            self.handle_ws_event(&event, now, seen.as_deref_mut());
        }

        self.poll_auth();
        self.expire_publishes(now);

        let closed: Vec<RelayReqId> = self.closed_rx.try_iter().collect();
        for id in closed {
            self.unsubscribe(id.as_str());
        }

        self.keepalive(now);
    }

    fn open_socket(&mut self) {
        self.status = RelayStatus::Connecting;
        match self.connector.connect(&self.url) {
            Ok(conn) => {
                debug!("connecting to {}", self.url);
                self.conn = Some(conn);
            }
            Err(err) => {
                error!("error connecting to relay {}: {}", self.url, err);
                self.status = RelayStatus::Error;
                self.connect_failed = true;
            }
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.reconnect_at.is_some() {
            return;
        }

        match self.backoff.next_delay() {
            Some(delay) => {
                debug!("will reconnect to {} in {:?}", self.url, delay);
                self.reconnect_at = Some(now + delay);
            }
            None => {
                if self.options.max_reconnect_attempts > 0 {
                    warn!(
                        "giving up on {} after {} reconnect attempts",
                        self.url,
                        self.backoff.attempts()
                    );
                }
                self.status = RelayStatus::Error;
            }
        }
    }

    fn handle_ws_event(&mut self, event: &WsEvent, now: Instant, seen: Option<&mut SeenEvents>) {
        match RelayEvent::from(event) {
            RelayEvent::Opened => self.on_open(now),
            RelayEvent::Closed => {
                debug!("{} closed the connection", self.url);
                self.on_socket_lost(now, false);
            }
            RelayEvent::Error(err) => {
                warn!("websocket error on {}: {}", self.url, err);
                self.on_socket_lost(now, true);
            }
            RelayEvent::Other(WsMessage::Ping(data)) => {
                if let Some(conn) = self.conn.as_mut() {
                    conn.send(WsMessage::Pong(data.clone()));
                }
            }
            RelayEvent::Other(_) => {}
            RelayEvent::Malformed(err) => {
                debug!("dropping malformed frame from {}: {}", self.url, err);
            }
            RelayEvent::Message(msg) => self.handle_message(msg, seen),
        }
    }

    fn on_open(&mut self, now: Instant) {
        info!("connected to {}", self.url);
        self.status = RelayStatus::Connected;
        self.backoff.reset();
        self.reconnect_at = None;
        self.auth.authenticated = false;
        self.last_ping = now;

        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        let mut requested: HashSet<String> = HashSet::new();
        for msg in self.queue.drain(..) {
            if let Some(id) = msg.req_sub_id() {
                requested.insert(id.to_owned());
            }
            send_frame(conn.as_mut(), &self.url, &msg);
        }

        for (id, sub) in &self.subs {
            if requested.contains(id.as_str()) {
                continue;
            }
            let req = ClientMessage::req(id.to_string(), sub.filters.clone());
            send_frame(conn.as_mut(), &self.url, &req);
        }
    }

    fn on_socket_lost(&mut self, now: Instant, errored: bool) {
        let was_open = self.status == RelayStatus::Connected;
        self.conn = None;
        self.auth.pending = None;
        self.auth.authenticated = false;
        self.status = if was_open && !errored {
            RelayStatus::Disconnected
        } else {
            RelayStatus::Error
        };
        self.schedule_reconnect(now);
    }

    fn handle_message(&mut self, msg: RelayMessage, seen: Option<&mut SeenEvents>) {
        match msg {
            RelayMessage::Event { sub_id, note } => self.deliver_event(&sub_id, *note, seen),
            RelayMessage::Eose(sub_id) => {
                let event = SubscriptionEvent::Eose {
                    relay: self.url.clone(),
                };
                self.deliver(&sub_id, event);
            }
            RelayMessage::Closed { sub_id, message } => {
                debug!("{} closed subscription {}: {}", self.url, sub_id, message);
                if let Some(sub) = self.subs.remove(sub_id.as_str()) {
                    let _ = sub.sink.send(SubscriptionEvent::Closed {
                        relay: self.url.clone(),
                        message,
                    });
                }
            }
            RelayMessage::Ok(result) => self.resolve_publish(result),
            RelayMessage::Notice(notice) => warn!("NOTICE from {}: {}", self.url, notice),
            RelayMessage::Auth { challenge } => self.on_auth_challenge(challenge),
        }
    }

    fn deliver_event(&mut self, sub_id: &str, note: Note, seen: Option<&mut SeenEvents>) {
        let Some(sub) = self.subs.get(sub_id) else {
            debug!("{} sent an event for unknown subscription {}", self.url, sub_id);
            return;
        };

        if self.options.verify_events {
            if let Err(err) = note.verify() {
                debug!("dropping event {} from {}: {}", note.id, self.url, err);
                return;
            }
        }

        if sub.dedup {
            if let Some(seen) = seen {
                if !seen.insert(note.id) {
                    return;
                }
            }
        }

        let event = SubscriptionEvent::Event {
            relay: self.url.clone(),
            note,
        };
        self.deliver(sub_id, event);
    }

    fn deliver(&mut self, sub_id: &str, event: SubscriptionEvent) {
        let alive = match self.subs.get(sub_id) {
            Some(sub) => sub.sink.send(event).is_ok(),
            None => return,
        };

        if !alive {
            self.unsubscribe(sub_id);
        }
    }

    fn resolve_publish(&mut self, result: CommandResult) {
        let Some(pending) = self.publishes.remove(&result.event_id) else {
            debug!("{} acknowledged unknown event {}", self.url, result.event_id);
            return;
        };

        if !result.accepted {
            warn!(
                "{} rejected event {}: {}",
                self.url, result.event_id, result.message
            );
        }

        for publish in pending {
            publish.resolve(PublishResult {
                accepted: result.accepted,
                message: result.message.clone(),
            });
        }
    }

    fn expire_publishes(&mut self, now: Instant) {
        let timeout = self.options.publish_timeout;
        let mut expired = Vec::new();
        self.publishes.retain(|id, pending| {
            let mut due = Vec::new();
            let mut waiting = Vec::with_capacity(pending.len());
            for mut publish in pending.drain(..) {
                if publish.is_due(now, timeout) {
                    due.push(publish);
                } else {
                    waiting.push(publish);
                }
            }
            *pending = waiting;
            if !due.is_empty() {
                debug!("publish of {} timed out", id);
                expired.extend(due);
            }
            !pending.is_empty()
        });

        for publish in expired {
            publish.resolve(PublishResult::timeout());
        }
    }

    fn on_auth_challenge(&mut self, challenge: String) {
        let Some(signer) = self.auth.signer.as_ref() else {
            debug!("{} wants auth but no signer is configured", self.url);
            return;
        };

        if self.auth.pending.is_some() || self.auth.failed {
            return;
        }

        let unsigned = UnsignedNote::new(
            signer.pubkey(),
            kind::CLIENT_AUTH,
            "",
            vec![
                vec!["relay".to_string(), self.url.to_string()],
                vec!["challenge".to_string(), challenge],
            ],
        );

        debug!("answering auth challenge from {}", self.url);
        self.auth.pending = Some(signer.sign(unsigned));
        self.poll_auth();
    }

    fn poll_auth(&mut self) {
        let Some(result) = self.auth.pending.as_mut().and_then(SignRequest::try_take) else {
            return;
        };
        self.auth.pending = None;

        match result {
            Ok(note) => {
                info!("authenticating to {} as {}", self.url, note.pubkey);
                self.send(ClientMessage::auth(note));
                self.auth.authenticated = true;
            }
            Err(err) => {
                warn!("auth to {} failed: {}", self.url, err);
                self.auth.failed = true;
            }
        }
    }

    fn keepalive(&mut self, now: Instant) {
        if self.status != RelayStatus::Connected {
            return;
        }

        if now.saturating_duration_since(self.last_ping) < self.options.ping_rate {
            return;
        }

        if let Some(conn) = self.conn.as_mut() {
            debug!("pinging {}", self.url);
            conn.send(WsMessage::Ping(vec![]));
            self.last_ping = now;
        }
    }
}

fn send_frame(conn: &mut dyn WebsocketConn, url: &NormRelayUrl, msg: &ClientMessage) {
    match msg.to_json() {
        Ok(json) => {
            debug!("sending {} to {}", json, url);
            conn.send(WsMessage::Text(json));
        }
        Err(e) => error!("error serializing message for {url}: {e}"),
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }
}
