use std::{
    borrow::Borrow,
    fmt::{self, Display},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;
use uuid::Uuid;

use crate::Error;

/// A subscription id as sent in REQ/CLOSE frames. Random uuids by
/// default so ids don't leak anything about the subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayReqId(pub String);

impl RelayReqId {
    pub fn byte_len() -> usize {
        uuid::fmt::Hyphenated::LENGTH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RelayReqId {
    fn default() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<String> for RelayReqId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RelayReqId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<RelayReqId> for String {
    fn from(value: RelayReqId) -> Self {
        value.0
    }
}

impl Display for RelayReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Borrow<str> for RelayReqId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A websocket relay url in canonical form: lowercase scheme and host,
/// default port dropped, no trailing slash. Two spellings of the same
/// relay compare equal once normalized.
#[derive(Eq, PartialEq, Hash, Clone, Debug, PartialOrd, Ord)]
pub struct NormRelayUrl {
    url: String,
}

impl NormRelayUrl {
    pub fn new(url: &str) -> Result<Self, Error> {
        let parsed =
            Url::parse(url.trim()).map_err(|e| Error::InvalidRelayUrl(format!("{url}: {e}")))?;

        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::InvalidRelayUrl(format!(
                "{url}: expected ws:// or wss://"
            )));
        }

        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(Error::InvalidRelayUrl(format!("{url}: missing host")));
        }

        Ok(Self {
            url: parsed.as_str().trim_end_matches('/').to_owned(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl Display for NormRelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl AsRef<str> for NormRelayUrl {
    fn as_ref(&self) -> &str {
        &self.url
    }
}

impl Borrow<str> for NormRelayUrl {
    fn borrow(&self) -> &str {
        &self.url
    }
}

impl std::str::FromStr for NormRelayUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        NormRelayUrl::new(s)
    }
}

impl From<NormRelayUrl> for String {
    fn from(value: NormRelayUrl) -> Self {
        value.url
    }
}

impl Serialize for NormRelayUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.url)
    }
}

impl<'de> Deserialize<'de> for NormRelayUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NormRelayUrl::new(&s).map_err(serde::de::Error::custom)
    }
}
