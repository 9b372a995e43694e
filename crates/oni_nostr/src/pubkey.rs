use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;
use secp256k1::XOnlyPublicKey;
use std::fmt;
use std::ops::Deref;

/// An x-only secp256k1 public key, the identity of a nostr user.
#[derive(Eq, PartialEq, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct Pubkey([u8; 32]);

static HRP_NPUB: bech32::Hrp = bech32::Hrp::parse_unchecked("npub");

impl Deref for Pubkey {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Pubkey {
    pub fn new(data: [u8; 32]) -> Self {
        Self(data)
    }

    pub fn hex(&self) -> String {
        hex::encode(self.bytes())
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Accepts either 64 hex characters or an `npub1...` string.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.starts_with("npub1") {
            Pubkey::from_npub(s)
        } else {
            Pubkey::from_hex(s)
        }
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        Ok(Pubkey(hex::decode(hex_str)?.as_slice().try_into()?))
    }

    pub fn from_npub(s: &str) -> Result<Self, Error> {
        let (hrp, data) = bech32::decode(s).map_err(|_| Error::InvalidBech32)?;

        if hrp != HRP_NPUB {
            return Err(Error::InvalidBech32);
        }

        Ok(Pubkey(data.as_slice().try_into()?))
    }

    pub fn npub(&self) -> Option<String> {
        bech32::encode::<bech32::Bech32>(HRP_NPUB, &self.0).ok()
    }

    /// The curve point behind this key. Fails for 32 byte strings that
    /// are not valid x coordinates.
    pub fn xonly(&self) -> Result<XOnlyPublicKey, Error> {
        XOnlyPublicKey::from_slice(&self.0).map_err(|_| Error::InvalidPublicKey)
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self.hex())
    }
}

impl From<Pubkey> for String {
    fn from(pk: Pubkey) -> Self {
        pk.hex()
    }
}

impl std::str::FromStr for Pubkey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Pubkey::parse(s)
    }
}

impl Serialize for Pubkey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Pubkey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JB55: &str = "32e1827635450ebb3c5a7d12c1f8e7b2b514439ac10a67eef3d9fd9c5c68e245";

    #[test]
    fn npub_roundtrip_matches_hex() {
        let pk = Pubkey::from_hex(JB55).unwrap();
        let npub = pk.npub().unwrap();
        assert!(npub.starts_with("npub1"));
        assert_eq!(Pubkey::parse(&npub).unwrap(), pk);
        assert_eq!(Pubkey::parse(JB55).unwrap(), pk);
    }

    #[test]
    fn rejects_short_hex_and_wrong_hrp() {
        assert!(matches!(
            Pubkey::from_hex("abcd"),
            Err(Error::InvalidByteSize)
        ));
        let note = bech32::encode::<bech32::Bech32>(
            bech32::Hrp::parse_unchecked("note"),
            &[0u8; 32],
        )
        .unwrap();
        assert!(matches!(Pubkey::from_npub(&note), Err(Error::InvalidBech32)));
    }
}
