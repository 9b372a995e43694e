//! An in-memory relay network for driving [`Relay`](crate::Relay) and
//! [`RelayPool`](crate::RelayPool) without sockets.
//!
//! Every url starts out [`Behavior::Manual`]: nothing happens until the
//! test opens the socket and pushes frames itself. [`Behavior::Serve`]
//! turns the url into a tiny relay that answers REQs from a fixed set of
//! notes and accepts everything published to it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use ewebsock::{WsEvent, WsMessage};
use hashbrown::HashMap;
use serde_json::Value;
use tracing::debug;

use crate::relay::{Connector, NormRelayUrl, WebsocketConn};
use crate::{Error, Filter, Note, Result};

#[derive(Debug, Clone, Default)]
pub enum Behavior {
    /// The test drives the socket by hand
    #[default]
    Manual,
    /// Opens at once, answers REQ with matching notes then EOSE and OKs
    /// every EVENT
    Serve { notes: Vec<Note> },
    /// The socket errors before it ever opens
    Unreachable,
}

#[derive(Default)]
struct Endpoint {
    behavior: Behavior,
    refuse: bool,
    connects: usize,
    /// Bumped on every connect so stale connections go quiet
    generation: usize,
    inbox: VecDeque<WsEvent>,
    sent: Vec<WsMessage>,
    closed: bool,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<String, Endpoint>,
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Rc<RefCell<NetworkState>>,
}

struct MockConnector {
    state: Rc<RefCell<NetworkState>>,
}

struct MockConn {
    state: Rc<RefCell<NetworkState>>,
    url: String,
    generation: usize,
}

fn key(url: &str) -> String {
    NormRelayUrl::new(url)
        .map(String::from)
        .unwrap_or_else(|_| url.to_owned())
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Rc<dyn Connector> {
        Rc::new(MockConnector {
            state: self.state.clone(),
        })
    }

    fn with_endpoint<R>(&self, url: &str, f: impl FnOnce(&mut Endpoint) -> R) -> R {
        let mut state = self.state.borrow_mut();
        f(state.endpoints.entry(key(url)).or_default())
    }

    pub fn set_behavior(&self, url: &str, behavior: Behavior) {
        self.with_endpoint(url, |ep| ep.behavior = behavior);
    }

    /// Serve `notes` from `url`
    pub fn serve(&self, url: &str, notes: Vec<Note>) {
        self.set_behavior(url, Behavior::Serve { notes });
    }

    pub fn unreachable(&self, url: &str) {
        self.set_behavior(url, Behavior::Unreachable);
    }

    /// Makes the connector itself fail for `url`
    pub fn refuse(&self, url: &str) {
        self.with_endpoint(url, |ep| ep.refuse = true);
    }

    pub fn push(&self, url: &str, event: WsEvent) {
        self.with_endpoint(url, |ep| ep.inbox.push_back(event));
    }

    pub fn open(&self, url: &str) {
        self.push(url, WsEvent::Opened);
    }

    /// The relay hangs up
    pub fn close(&self, url: &str) {
        self.push(url, WsEvent::Closed);
    }

    pub fn fail(&self, url: &str, reason: &str) {
        self.push(url, WsEvent::Error(reason.to_owned()));
    }

    pub fn push_text(&self, url: &str, text: impl Into<String>) {
        self.push(url, WsEvent::Message(WsMessage::Text(text.into())));
    }

    pub fn push_event(&self, url: &str, sub_id: &str, note: &Note) {
        self.push_text(url, event_frame(sub_id, note));
    }

    pub fn push_eose(&self, url: &str, sub_id: &str) {
        self.push_text(url, serde_json::json!(["EOSE", sub_id]).to_string());
    }

    pub fn push_ok(&self, url: &str, note: &Note, accepted: bool, message: &str) {
        self.push_text(
            url,
            serde_json::json!(["OK", note.id.hex(), accepted, message]).to_string(),
        );
    }

    pub fn push_auth(&self, url: &str, challenge: &str) {
        self.push_text(url, serde_json::json!(["AUTH", challenge]).to_string());
    }

    pub fn connect_count(&self, url: &str) -> usize {
        self.with_endpoint(url, |ep| ep.connects)
    }

    /// Whether the client closed its side of the latest connection
    pub fn is_closed(&self, url: &str) -> bool {
        self.with_endpoint(url, |ep| ep.closed)
    }

    /// Every text frame the client sent to `url`, across connections
    pub fn sent(&self, url: &str) -> Vec<String> {
        self.with_endpoint(url, |ep| {
            ep.sent
                .iter()
                .filter_map(|m| match m {
                    WsMessage::Text(t) => Some(t.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn sent_json(&self, url: &str) -> Vec<Value> {
        self.sent(url)
            .iter()
            .filter_map(|t| serde_json::from_str(t).ok())
            .collect()
    }

    /// Frames of one type, e.g. "REQ"
    pub fn sent_of(&self, url: &str, verb: &str) -> Vec<Value> {
        self.sent_json(url)
            .into_iter()
            .filter(|v| v.get(0).and_then(Value::as_str) == Some(verb))
            .collect()
    }

    pub fn pings(&self, url: &str) -> usize {
        self.with_endpoint(url, |ep| {
            ep.sent
                .iter()
                .filter(|m| matches!(m, WsMessage::Ping(_)))
                .count()
        })
    }

    pub fn pongs(&self, url: &str) -> usize {
        self.with_endpoint(url, |ep| {
            ep.sent
                .iter()
                .filter(|m| matches!(m, WsMessage::Pong(_)))
                .count()
        })
    }

    /// Subscription id of the most recent REQ sent to `url`
    pub fn last_req_id(&self, url: &str) -> Option<String> {
        self.sent_of(url, "REQ")
            .last()
            .and_then(|req| req.get(1))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &NormRelayUrl) -> Result<Box<dyn WebsocketConn>> {
        let mut state = self.state.borrow_mut();
        let ep = state.endpoints.entry(url.to_string()).or_default();
        ep.connects += 1;

        if ep.refuse {
            return Err(Error::Generic(format!("connection to {url} refused")));
        }

        ep.generation += 1;
        ep.closed = false;
        ep.inbox.clear();
        match ep.behavior {
            Behavior::Manual => {}
            Behavior::Serve { .. } => ep.inbox.push_back(WsEvent::Opened),
            Behavior::Unreachable => ep
                .inbox
                .push_back(WsEvent::Error(format!("could not reach {url}"))),
        }

        Ok(Box::new(MockConn {
            state: self.state.clone(),
            url: url.to_string(),
            generation: ep.generation,
        }))
    }
}

impl MockConn {
    fn with_live_endpoint<R>(&self, f: impl FnOnce(&mut Endpoint) -> R) -> Option<R> {
        let mut state = self.state.borrow_mut();
        let ep = state.endpoints.get_mut(&self.url)?;
        if ep.generation != self.generation {
            return None;
        }
        Some(f(ep))
    }
}

impl WebsocketConn for MockConn {
    fn send(&mut self, msg: WsMessage) {
        self.with_live_endpoint(|ep| {
            if let (Behavior::Serve { notes }, WsMessage::Text(frame)) = (&ep.behavior, &msg) {
                let replies = serve_frame(notes, frame);
                ep.inbox.extend(replies);
            }
            ep.sent.push(msg);
        });
    }

    fn try_recv(&mut self) -> Option<WsEvent> {
        self.with_live_endpoint(|ep| ep.inbox.pop_front()).flatten()
    }

    fn close(&mut self) {
        self.with_live_endpoint(|ep| ep.closed = true);
    }
}

fn event_frame(sub_id: &str, note: &Note) -> String {
    let note = serde_json::to_value(note).unwrap_or(Value::Null);
    serde_json::json!(["EVENT", sub_id, note]).to_string()
}

fn text(frame: String) -> WsEvent {
    WsEvent::Message(WsMessage::Text(frame))
}

/// What a serving relay answers to one client frame
fn serve_frame(notes: &[Note], frame: &str) -> Vec<WsEvent> {
    let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(frame) else {
        return vec![];
    };

    match parts.first().and_then(Value::as_str) {
        Some("REQ") => {
            let Some(sub_id) = parts.get(1).and_then(Value::as_str) else {
                return vec![];
            };
            let filters: Vec<Filter> = parts[2..]
                .iter()
                .filter_map(|f| Filter::from_json(&f.to_string()).ok())
                .collect();

            let mut matched: Vec<&Note> = Vec::new();
            for filter in &filters {
                let mut hits: Vec<&Note> = notes.iter().filter(|n| filter.matches(n)).collect();
                hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                if let Some(limit) = filter.limit() {
                    hits.truncate(limit as usize);
                }
                for hit in hits {
                    if !matched.iter().any(|m| m.id == hit.id) {
                        matched.push(hit);
                    }
                }
            }

            debug!("mock relay serving {} notes for {}", matched.len(), sub_id);
            let mut out: Vec<WsEvent> = matched
                .into_iter()
                .map(|n| text(event_frame(sub_id, n)))
                .collect();
            out.push(text(serde_json::json!(["EOSE", sub_id]).to_string()));
            out
        }
        Some("EVENT") => {
            let id = parts
                .get(1)
                .and_then(|e| e.get("id"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            vec![text(serde_json::json!(["OK", id, true, ""]).to_string())]
        }
        _ => vec![],
    }
}
