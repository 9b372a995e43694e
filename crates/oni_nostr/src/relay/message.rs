use crate::{Error, Note, NoteId, Result};
use ewebsock::{WsEvent, WsMessage};
use serde_json::Value;

/// The relay's answer to an EVENT we published
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResult {
    pub event_id: NoteId,
    pub accepted: bool,
    pub message: String,
}

/// A frame sent by a relay, decoded once at the socket boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, note: Box<Note> },
    Eose(String),
    Ok(CommandResult),
    Notice(String),
    Closed { sub_id: String, message: String },
    Auth { challenge: String },
}

#[derive(Debug)]
pub enum RelayEvent<'a> {
    Opened,
    Closed,
    Other(&'a WsMessage),
    /// The socket failed
    Error(Error),
    /// A text frame that didn't decode
    Malformed(Error),
    Message(RelayMessage),
}

impl<'a> From<&'a WsEvent> for RelayEvent<'a> {
    fn from(event: &'a WsEvent) -> RelayEvent<'a> {
        match event {
            WsEvent::Opened => RelayEvent::Opened,
            WsEvent::Closed => RelayEvent::Closed,
            WsEvent::Message(ref ws_msg) => ws_msg.into(),
            WsEvent::Error(s) => RelayEvent::Error(Error::Generic(s.to_owned())),
        }
    }
}

impl<'a> From<&'a WsMessage> for RelayEvent<'a> {
    fn from(wsmsg: &'a WsMessage) -> RelayEvent<'a> {
        match wsmsg {
            WsMessage::Text(s) => match RelayMessage::from_json(s) {
                Ok(msg) => RelayEvent::Message(msg),
                Err(err) => RelayEvent::Malformed(err),
            },
            wsmsg => RelayEvent::Other(wsmsg),
        }
    }
}

fn str_at(frame: &[Value], i: usize) -> Result<&str> {
    frame
        .get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::DecodeFailed(format!("expected a string at position {i}")))
}

impl RelayMessage {
    pub fn eose(sub_id: impl Into<String>) -> Self {
        RelayMessage::Eose(sub_id.into())
    }

    pub fn notice(msg: impl Into<String>) -> Self {
        RelayMessage::Notice(msg.into())
    }

    pub fn ok(event_id: NoteId, accepted: bool, message: impl Into<String>) -> Self {
        RelayMessage::Ok(CommandResult {
            event_id,
            accepted,
            message: message.into(),
        })
    }

    pub fn event(sub_id: impl Into<String>, note: Note) -> Self {
        RelayMessage::Event {
            sub_id: sub_id.into(),
            note: Box::new(note),
        }
    }

    pub fn closed(sub_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayMessage::Closed {
            sub_id: sub_id.into(),
            message: message.into(),
        }
    }

    pub fn auth(challenge: impl Into<String>) -> Self {
        RelayMessage::Auth {
            challenge: challenge.into(),
        }
    }

    /// Decode a relay frame. Anything that is not a JSON array of at least
    /// two elements with a known leading verb is rejected.
    pub fn from_json(msg: &str) -> Result<RelayMessage> {
        if msg.is_empty() {
            return Err(Error::Empty);
        }

        let value: Value = serde_json::from_str(msg)?;
        let frame = value
            .as_array()
            .ok_or_else(|| Error::DecodeFailed("frame is not an array".into()))?;

        if frame.len() < 2 {
            return Err(Error::DecodeFailed("frame is too short".into()));
        }

        match str_at(frame, 0)? {
            // ["EVENT", <subscription id>, <event JSON>]
            "EVENT" => {
                let sub_id = str_at(frame, 1)?;
                let event = frame
                    .get(2)
                    .ok_or_else(|| Error::DecodeFailed("EVENT without an event".into()))?;
                let note: Note = serde_json::from_value(event.clone())?;
                Ok(Self::event(sub_id, note))
            }

            // ["EOSE", <subscription_id>]
            "EOSE" => Ok(Self::eose(str_at(frame, 1)?)),

            // ["OK", <event_id>, <true|false>, <message>]
            "OK" => {
                let event_id = NoteId::from_hex(str_at(frame, 1)?)?;
                let accepted = frame.get(2).and_then(Value::as_bool).unwrap_or(false);
                let message = frame.get(3).and_then(Value::as_str).unwrap_or_default();
                Ok(Self::ok(event_id, accepted, message))
            }

            // ["NOTICE", <message>]
            "NOTICE" => Ok(Self::notice(str_at(frame, 1)?)),

            // ["CLOSED", <subscription_id>, <message>]
            "CLOSED" => {
                let sub_id = str_at(frame, 1)?;
                let message = frame.get(2).and_then(Value::as_str).unwrap_or_default();
                Ok(Self::closed(sub_id, message))
            }

            // ["AUTH", <challenge>]
            "AUTH" => Ok(Self::auth(str_at(frame, 1)?)),

            other => Err(Error::DecodeFailed(format!(
                "unrecognized message type: '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kind, FullKeypair, UnsignedNote};

    #[test]
    fn test_handle_various_messages() {
        let id = NoteId::new([0xab; 32]);
        let ok_accepted = format!(r#"["OK","{}",true,""]"#, id.hex());
        let ok_rejected = format!(r#"["OK","{}",false,"blocked: spam"]"#, id.hex());
        let ok_bare = format!(r#"["OK","{}",true]"#, id.hex());
        let tests = vec![
            (r#"["EOSE","x"]"#, Some(RelayMessage::eose("x"))),
            (r#"["NOTICE",""]"#, Some(RelayMessage::notice(""))),
            (
                r#"["NOTICE", "Invalid event format!"]"#,
                Some(RelayMessage::notice("Invalid event format!")),
            ),
            (
                r#"[ "EOSE" , "random-subscription-id" ]"#,
                Some(RelayMessage::eose("random-subscription-id")),
            ),
            (
                ok_accepted.as_str(),
                Some(RelayMessage::ok(id, true, "")),
            ),
            (
                ok_rejected.as_str(),
                Some(RelayMessage::ok(id, false, "blocked: spam")),
            ),
            // relays that omit the message still resolve the publish
            (
                ok_bare.as_str(),
                Some(RelayMessage::ok(id, true, "")),
            ),
            (
                r#"["CLOSED","sub1","auth-required: sign in"]"#,
                Some(RelayMessage::closed("sub1", "auth-required: sign in")),
            ),
            (
                r#"["AUTH","challenge-string"]"#,
                Some(RelayMessage::auth("challenge-string")),
            ),
            // Invalid cases
            ("", None),
            ("[]", None),
            (r#"["EOSE"]"#, None),
            (r#"{"EOSE":"x"}"#, None),
            (r#"["EOSE",1]"#, None),
            (r#"["OK","nothex",true,""]"#, None),
            (r#"["EVENT","sub"]"#, None),
            (r#"["EVENT","sub",{"id":"example","content":"test"}]"#, None),
            (r#"["UNKNOWN","x"]"#, None),
            (r#"["NOTICE","unterminated"#, None),
        ];

        for (input, expected) in tests {
            let result = RelayMessage::from_json(input).ok();
            assert_eq!(result, expected, "input: {input}");
        }
    }

    #[test]
    fn decodes_event_frames() {
        let keys = FullKeypair::generate();
        let note = UnsignedNote::new(keys.pubkey, kind::TEXT_NOTE, "gm", vec![])
            .sign(&keys)
            .unwrap();
        let frame = format!(r#"["EVENT","sub",{}]"#, note.to_json().unwrap());

        match RelayMessage::from_json(&frame).unwrap() {
            RelayMessage::Event { sub_id, note: got } => {
                assert_eq!(sub_id, "sub");
                assert_eq!(*got, note);
                assert!(got.is_valid());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ws_events_map_to_relay_events() {
        assert!(matches!(
            RelayEvent::from(&WsEvent::Opened),
            RelayEvent::Opened
        ));
        let ping = WsEvent::Message(WsMessage::Ping(vec![]));
        assert!(matches!(RelayEvent::from(&ping), RelayEvent::Other(_)));
        let bad = WsEvent::Message(WsMessage::Text("nope".into()));
        assert!(matches!(RelayEvent::from(&bad), RelayEvent::Malformed(_)));
        let err = WsEvent::Error("refused".into());
        assert!(matches!(RelayEvent::from(&err), RelayEvent::Error(_)));
    }
}
