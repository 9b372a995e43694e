use std::cmp::Ordering;
use std::fmt;

use oni_nostr::Note;
use serde_derive::{Deserialize, Serialize};

// A Relay specification includes NIP-65 defined "markers" which
// indicate if the relay should be used for reading or writing (or
// both).

#[derive(Clone, Serialize, Deserialize)]
pub struct RelaySpec {
    pub url: String,
    pub has_read_marker: bool,
    pub has_write_marker: bool,
    /// Marked with something other than "read" or "write", used for neither
    #[serde(default)]
    pub has_unknown_marker: bool,
}

impl RelaySpec {
    pub fn new(
        url: impl Into<String>,
        mut has_read_marker: bool,
        mut has_write_marker: bool,
    ) -> Self {
        // if both markers are set turn both off ...
        if has_read_marker && has_write_marker {
            has_read_marker = false;
            has_write_marker = false;
        }
        RelaySpec {
            url: url.into(),
            has_read_marker,
            has_write_marker,
            has_unknown_marker: false,
        }
    }

    /// From the marker in an `r` tag. Only a missing marker means both.
    pub fn from_marker(url: impl Into<String>, marker: Option<&str>) -> Self {
        match marker {
            None => Self::new(url, false, false),
            Some("read") => Self::new(url, true, false),
            Some("write") => Self::new(url, false, true),
            Some(_) => RelaySpec {
                has_unknown_marker: true,
                ..Self::new(url, false, false)
            },
        }
    }

    // The "marker" fields are a little counter-intuitive ... from NIP-65:
    //
    // "The event MUST include a list of r tags with relay URIs and a read
    // or write marker. Relays marked as read / write are called READ /
    // WRITE relays, respectively. If the marker is omitted, the relay is
    // used for both purposes."
    //
    pub fn is_readable(&self) -> bool {
        !self.has_unknown_marker && !self.has_write_marker // only "write" relays are not readable
    }
    pub fn is_writable(&self) -> bool {
        !self.has_unknown_marker && !self.has_read_marker // only "read" relays are not writable
    }
}

// just the url part
impl fmt::Display for RelaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

// add the read and write markers if present
impl fmt::Debug for RelaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)?;
        if self.has_read_marker {
            write!(f, " [r]")?;
        }
        if self.has_write_marker {
            write!(f, " [w]")?;
        }
        if self.has_unknown_marker {
            write!(f, " [?]")?;
        }
        Ok(())
    }
}

// For purposes of set arithmetic only the url is considered, two
// RelaySpec which differ only in markers are the same ...

impl PartialEq for RelaySpec {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for RelaySpec {}

impl PartialOrd for RelaySpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RelaySpec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.url.cmp(&other.url)
    }
}

/// Relays from the `r` tags of a kind 10002 list, trailing slashes
/// stripped. Tags without a url are skipped.
pub fn parse_relay_list(note: &Note) -> Vec<RelaySpec> {
    note.tags_named("r")
        .filter_map(|tag| {
            let url = tag.get(1)?.trim_end_matches('/');
            if url.is_empty() {
                return None;
            }
            Some(RelaySpec::from_marker(url, tag.get(2).map(String::as_str)))
        })
        .collect()
}

pub fn write_urls(list: &[RelaySpec]) -> Vec<String> {
    list.iter()
        .filter(|r| r.is_writable())
        .map(|r| r.url.clone())
        .collect()
}

pub fn read_urls(list: &[RelaySpec]) -> Vec<String> {
    list.iter()
        .filter(|r| r.is_readable())
        .map(|r| r.url.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use oni_nostr::{kind, FullKeypair, UnsignedNote};

    fn tag(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn markers_follow_nip65() {
        let keys = FullKeypair::generate();
        let note = UnsignedNote::new(
            keys.pubkey,
            kind::RELAY_LIST,
            "",
            vec![
                tag(&["r", "wss://both.example/"]),
                tag(&["r", "wss://read.example", "read"]),
                tag(&["r", "wss://write.example//", "write"]),
                tag(&["r", ""]),
                tag(&["r"]),
                tag(&["p", "wss://not-a-relay.example"]),
            ],
        )
        .sign(&keys)
        .unwrap();

        let list = parse_relay_list(&note);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].url, "wss://both.example");
        assert!(list[0].is_readable() && list[0].is_writable());
        assert!(list[1].is_readable() && !list[1].is_writable());
        assert_eq!(list[2].url, "wss://write.example");
        assert!(!list[2].is_readable() && list[2].is_writable());

        assert_eq!(write_urls(&list), vec!["wss://both.example", "wss://write.example"]);
        assert_eq!(read_urls(&list), vec!["wss://both.example", "wss://read.example"]);
    }

    #[test]
    fn both_markers_mean_both() {
        let spec = RelaySpec::new("wss://x.example", true, true);
        assert!(spec.is_readable() && spec.is_writable());
        assert_eq!(format!("{spec:?}"), "\"wss://x.example\"");
    }

    #[test]
    fn unknown_markers_are_used_for_neither() {
        let keys = FullKeypair::generate();
        let note = UnsignedNote::new(
            keys.pubkey,
            kind::RELAY_LIST,
            "",
            vec![
                tag(&["r", "wss://odd.example", "foo"]),
                tag(&["r", "wss://shouty.example", "READ"]),
                tag(&["r", "wss://plain.example"]),
            ],
        )
        .sign(&keys)
        .unwrap();

        let list = parse_relay_list(&note);
        assert_eq!(list.len(), 3);
        assert!(!list[0].is_readable() && !list[0].is_writable());
        assert!(!list[1].is_readable() && !list[1].is_writable());
        assert_eq!(format!("{:?}", list[0]), "\"wss://odd.example\" [?]");

        assert_eq!(write_urls(&list), vec!["wss://plain.example"]);
        assert_eq!(read_urls(&list), vec!["wss://plain.example"]);
    }
}
