use oni_nostr::Pubkey;
use serde_json::{Map, Value};

/// Kind 0 metadata, kept as the raw json object so unknown fields survive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileState(Value);

impl ProfileState {
    pub fn new(value: Map<String, Value>) -> Self {
        Self(Value::Object(value))
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn to_json(&self) -> String {
        self.0.to_string()
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    #[inline]
    pub fn banner(&self) -> Option<&str> {
        self.get_str("banner")
    }

    /// `display_name`, or the `displayName` some clients write instead
    #[inline]
    pub fn display_name(&self) -> Option<&str> {
        self.get_str("display_name")
            .or_else(|| self.get_str("displayName"))
    }

    #[inline]
    pub fn nip05(&self) -> Option<&str> {
        self.get_str("nip05")
    }

    #[inline]
    pub fn lud16(&self) -> Option<&str> {
        self.get_str("lud16")
    }

    #[inline]
    pub fn about(&self) -> Option<&str> {
        self.get_str("about")
    }

    #[inline]
    pub fn picture(&self) -> Option<&str> {
        self.get_str("picture")
    }

    #[inline]
    pub fn website(&self) -> Option<&str> {
        self.get_str("website")
    }

    /// What to call this user: display name, then name, then a shortened npub
    pub fn best_name(&self, pubkey: &Pubkey) -> String {
        if let Some(name) = self.display_name().or_else(|| self.name()) {
            return name.to_owned();
        }

        short_npub(pubkey)
    }

    pub fn from_note_contents(contents: &str) -> Self {
        let json = serde_json::from_str(contents);
        let data = if let Ok(Value::Object(data)) = json {
            data
        } else {
            Map::new()
        };

        Self::new(data)
    }
}

/// `npub1abcdefgh…wxyz`
pub fn short_npub(pubkey: &Pubkey) -> String {
    let Some(npub) = pubkey.npub() else {
        return pubkey.hex()[..8].to_owned();
    };

    if npub.len() <= 16 {
        return npub;
    }

    format!("{}…{}", &npub[..12], &npub[npub.len() - 4..])
}
