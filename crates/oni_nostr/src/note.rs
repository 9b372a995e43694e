use crate::{Error, FullKeypair, Pubkey};

use secp256k1::{schnorr::Signature, Message, Secp256k1};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NoteId([u8; 32]);

impl fmt::Debug for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NoteId({})", self.hex())
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

static HRP_NOTE: bech32::Hrp = bech32::Hrp::parse_unchecked("note");

impl NoteId {
    pub fn new(bytes: [u8; 32]) -> Self {
        NoteId(bytes)
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.bytes())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        Ok(NoteId(hex::decode(hex_str)?.as_slice().try_into()?))
    }

    pub fn to_bech(&self) -> Option<String> {
        bech32::encode::<bech32::Bech32>(HRP_NOTE, &self.0).ok()
    }
}

/// Seconds since the unix epoch, the unit of `created_at`.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// The NIP-01 id preimage: `[0,pubkey,created_at,kind,tags,content]`
/// serialized without whitespace.
fn canonical_json(
    pubkey: &Pubkey,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    serde_json::json!([0, pubkey.hex(), created_at, kind, tags, content]).to_string()
}

fn hash_canonical(json: &str) -> NoteId {
    NoteId(Sha256::digest(json.as_bytes()).into())
}

/// An event before it has an id or a signature. This is what gets handed
/// to a signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedNote {
    pub pubkey: Pubkey,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedNote {
    /// Stamps the note with the current time.
    pub fn new(
        pubkey: Pubkey,
        kind: u32,
        content: impl Into<String>,
        tags: Vec<Vec<String>>,
    ) -> Self {
        UnsignedNote {
            pubkey,
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn canonical_json(&self) -> String {
        canonical_json(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    pub fn id(&self) -> NoteId {
        hash_canonical(&self.canonical_json())
    }

    /// Hash and sign with a local key. The key must belong to `pubkey`.
    pub fn sign(self, keypair: &FullKeypair) -> Result<Note, Error> {
        if keypair.pubkey != self.pubkey {
            return Err(Error::InvalidPublicKey);
        }

        let id = self.id();
        let sig = keypair.sign_id(&id)?;

        Ok(Note {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        })
    }
}

/// A signed nostr event
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Note {
    /// 32-bytes sha256 of the the serialized event data
    pub id: NoteId,
    /// 32-bytes hex-encoded public key of the event creator
    pub pubkey: Pubkey,
    /// unix timestamp in seconds
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    /// arbitrary string
    pub content: String,
    /// 64-bytes schnorr signature over `id`, hex encoded
    pub sig: String,
}

impl Hash for Note {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.0.hash(state);
    }
}

impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Note {}

impl Note {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(Into::into)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn compute_id(&self) -> NoteId {
        hash_canonical(&canonical_json(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
    }

    /// Checks that `id` matches the contents and that `sig` is a valid
    /// schnorr signature of `id` by `pubkey`.
    pub fn verify(&self) -> Result<(), Error> {
        if self.compute_id() != self.id {
            return Err(Error::InvalidId);
        }

        let sig_bytes = hex::decode(&self.sig)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| Error::InvalidSignature)?;
        let xonly = self.pubkey.xonly()?;

        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest(self.id.0);
        secp.verify_schnorr(&sig, msg.as_ref(), &xonly)
            .map_err(|_| Error::InvalidSignature)
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    pub fn unsigned(&self) -> UnsignedNote {
        UnsignedNote {
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Tags whose first element is `name`
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [String]> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .map(Vec::as_slice)
    }

    /// Second element of the first tag called `name`
    pub fn tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tags_named(name)
            .next()
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }
}

impl std::str::FromStr for Note {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Note::from_json(s)
    }
}

impl Serialize for NoteId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for NoteId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NoteId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
