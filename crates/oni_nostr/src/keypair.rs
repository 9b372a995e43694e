use secp256k1::{Keypair as SecpKeypair, Message, Secp256k1, SecretKey};

use crate::{Error, NoteId, Pubkey};

static HRP_NSEC: bech32::Hrp = bech32::Hrp::parse_unchecked("nsec");

/// Parses a secret key from hex or `nsec1...`.
pub fn parse_secret_key(s: &str) -> Result<SecretKey, Error> {
    let s = s.trim();
    let bytes = if s.starts_with("nsec1") {
        let (hrp, data) = bech32::decode(s).map_err(|_| Error::InvalidBech32)?;
        if hrp != HRP_NSEC {
            return Err(Error::InvalidBech32);
        }
        data
    } else {
        hex::decode(s)?
    };

    SecretKey::from_slice(&bytes).map_err(|_| Error::InvalidSecretKey)
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Keypair {
    pub pubkey: Pubkey,
    pub secret_key: Option<SecretKey>,
}

impl Keypair {
    pub fn from_secret(secret_key: SecretKey) -> Self {
        FullKeypair::from_secret(secret_key).to_keypair()
    }

    pub fn new(pubkey: Pubkey, secret_key: Option<SecretKey>) -> Self {
        Keypair { pubkey, secret_key }
    }

    pub fn only_pubkey(pubkey: Pubkey) -> Self {
        Keypair {
            pubkey,
            secret_key: None,
        }
    }

    pub fn to_full(&self) -> Option<FullKeypair> {
        self.secret_key.map(|secret_key| FullKeypair {
            pubkey: self.pubkey,
            secret_key,
        })
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct FullKeypair {
    pub pubkey: Pubkey,
    pub secret_key: SecretKey,
}

impl FullKeypair {
    pub fn new(pubkey: Pubkey, secret_key: SecretKey) -> Self {
        FullKeypair { pubkey, secret_key }
    }

    pub fn from_secret(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let (xonly, _) = secret_key.x_only_public_key(&secp);
        FullKeypair {
            pubkey: Pubkey::new(xonly.serialize()),
            secret_key,
        }
    }

    pub fn generate() -> Self {
        // out of range scalars are astronomically rare, just draw again
        loop {
            let bytes: [u8; 32] = rand::random();
            if let Ok(secret_key) = SecretKey::from_slice(&bytes) {
                return Self::from_secret(secret_key);
            }
        }
    }

    /// BIP-340 signature over a note id, hex encoded.
    pub fn sign_id(&self, id: &NoteId) -> Result<String, Error> {
        let secp = Secp256k1::signing_only();
        let keypair = SecpKeypair::from_secret_key(&secp, &self.secret_key);
        let msg = Message::from_digest(*id.bytes());
        let sig = secp.sign_schnorr_no_aux_rand(msg.as_ref(), &keypair);
        Ok(hex::encode(sig.serialize()))
    }

    pub fn to_keypair(self) -> Keypair {
        Keypair {
            pubkey: self.pubkey,
            secret_key: Some(self.secret_key),
        }
    }
}

impl std::fmt::Display for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Keypair:\n\tpublic: {}\n\tsecret: {}",
            self.pubkey,
            match self.secret_key {
                Some(_) => "Some(<hidden>)",
                None => "None",
            }
        )
    }
}

impl std::fmt::Display for FullKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair:\n\tpublic: {}\n\tsecret: <hidden>", self.pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_parses_from_hex_and_nsec() {
        let keys = FullKeypair::generate();
        let hex_sk = hex::encode(keys.secret_key.secret_bytes());
        let nsec =
            bech32::encode::<bech32::Bech32>(HRP_NSEC, &keys.secret_key.secret_bytes()).unwrap();

        assert_eq!(parse_secret_key(&hex_sk).unwrap(), keys.secret_key);
        assert_eq!(parse_secret_key(&nsec).unwrap(), keys.secret_key);
        assert_eq!(
            FullKeypair::from_secret(parse_secret_key(&nsec).unwrap()).pubkey,
            keys.pubkey
        );
    }

    #[test]
    fn zero_secret_is_rejected() {
        assert!(matches!(
            parse_secret_key(&"00".repeat(32)),
            Err(Error::InvalidSecretKey)
        ));
    }

    #[test]
    fn display_hides_secret() {
        let keys = FullKeypair::generate();
        let hex_sk = hex::encode(keys.secret_key.secret_bytes());
        assert!(!keys.to_string().contains(&hex_sk));
        assert!(!keys.to_keypair().to_string().contains(&hex_sk));
    }
}
