use crate::{Error, Filter, Note};
use serde_json::json;

/// Messages sent by clients, received by relays
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Note),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
    Auth(Note),
}

impl ClientMessage {
    pub fn event(note: Note) -> Self {
        ClientMessage::Event(note)
    }

    pub fn auth(note: Note) -> Self {
        ClientMessage::Auth(note)
    }

    pub fn req(sub_id: String, filters: Vec<Filter>) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: String) -> Self {
        ClientMessage::Close { sub_id }
    }

    /// The subscription a REQ opens, used to avoid re-sending it on reconnect
    pub fn req_sub_id(&self) -> Option<&str> {
        match self {
            Self::Req { sub_id, .. } => Some(sub_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(match self {
            Self::Event(note) => json!(["EVENT", note]).to_string(),
            Self::Auth(note) => json!(["AUTH", note]).to_string(),
            Self::Req { sub_id, filters } => {
                let mut frame = vec![json!("REQ"), json!(sub_id)];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                serde_json::Value::Array(frame).to_string()
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
        })
    }
}
