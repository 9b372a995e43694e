use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use oni_nostr::Pubkey;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{load_json, save_json, KeyValueStore};

pub const ACCOUNTS_KEY: &str = "nostrAccounts";
pub const ACTIVE_ACCOUNT_KEY: &str = "nostrActiveAccount";

/// Relays every account reads from unless it opts out
pub const DEFAULT_ACCOUNT_RELAYS: [&str; 3] = [
    "wss://purplepag.es",
    "wss://indexer.coracle.social",
    "wss://user.kindpag.es",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NostrAccount {
    pub pubkey: Pubkey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Every custom relay the user has entered for this account
    #[serde(default)]
    pub custom_relays: Vec<String>,
    /// The subset of `custom_relays` in use
    #[serde(default)]
    pub selected_custom_relays: Vec<String>,
    #[serde(default = "use_default_relays")]
    pub use_default_relays: bool,
    #[serde(default)]
    pub enabled: bool,
    /// Unix milliseconds
    #[serde(default)]
    pub added_at: u64,
}

fn use_default_relays() -> bool {
    true
}

impl NostrAccount {
    pub fn new(pubkey: Pubkey) -> Self {
        let added_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            pubkey,
            display_name: None,
            picture: None,
            custom_relays: vec![],
            selected_custom_relays: vec![],
            use_default_relays: true,
            enabled: false,
            added_at,
        }
    }

    /// Defaults (when enabled) followed by the selected custom relays,
    /// first occurrence wins.
    pub fn effective_relays(&self) -> Vec<String> {
        let defaults = self
            .use_default_relays
            .then_some(DEFAULT_ACCOUNT_RELAYS.iter().map(|s| s.to_string()))
            .into_iter()
            .flatten();

        let mut relays: Vec<String> = Vec::new();
        for relay in defaults.chain(self.selected_custom_relays.iter().cloned()) {
            if !relays.contains(&relay) {
                relays.push(relay);
            }
        }
        relays
    }
}

/// Partial change to an account's relay settings. `None` leaves the field
/// alone.
#[derive(Debug, Clone, Default)]
pub struct AccountRelayUpdate {
    pub custom_relays: Option<Vec<String>>,
    pub selected_custom_relays: Option<Vec<String>>,
    pub use_default_relays: Option<bool>,
    pub enabled: Option<bool>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SavedAccounts {
    #[serde(default)]
    accounts: BTreeMap<Pubkey, NostrAccount>,
    #[serde(default)]
    active_account_pubkey: Option<Pubkey>,
}

/// The accounts this client knows about, keyed by pubkey, and which one
/// is in use.
pub struct Accounts {
    accounts: BTreeMap<Pubkey, NostrAccount>,
    active: Option<Pubkey>,
    store: Rc<dyn KeyValueStore>,
}

impl Accounts {
    pub fn load(store: Rc<dyn KeyValueStore>) -> Self {
        let saved: SavedAccounts = load_json(&*store, ACCOUNTS_KEY).unwrap_or_default();
        let active = load_json::<Pubkey>(&*store, ACTIVE_ACCOUNT_KEY)
            .or(saved.active_account_pubkey)
            .filter(|pk| saved.accounts.contains_key(pk));

        debug!("loaded {} accounts", saved.accounts.len());
        Self {
            accounts: saved.accounts,
            active,
            store,
        }
    }

    fn persist(&self) {
        save_json(
            &*self.store,
            ACCOUNTS_KEY,
            &SavedAccounts {
                accounts: self.accounts.clone(),
                active_account_pubkey: self.active,
            },
        );

        match self.active {
            Some(pk) => save_json(&*self.store, ACTIVE_ACCOUNT_KEY, &pk),
            None => {
                if let Err(e) = self.store.remove(ACTIVE_ACCOUNT_KEY) {
                    tracing::error!("could not clear active account: {e}");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NostrAccount> {
        self.accounts.values()
    }

    pub fn get(&self, pubkey: &Pubkey) -> Option<&NostrAccount> {
        self.accounts.get(pubkey)
    }

    pub fn active(&self) -> Option<&NostrAccount> {
        self.active.as_ref().and_then(|pk| self.accounts.get(pk))
    }

    pub fn active_pubkey(&self) -> Option<&Pubkey> {
        self.active.as_ref()
    }

    /// Inserts or replaces the account with the same pubkey.
    pub fn add(&mut self, account: NostrAccount) {
        info!("saving account {}", account.pubkey);
        self.accounts.insert(account.pubkey, account);
        self.persist();
    }

    /// Adds a fresh account for `pubkey` if there isn't one yet.
    pub fn ensure(&mut self, pubkey: Pubkey) -> &NostrAccount {
        if !self.accounts.contains_key(&pubkey) {
            self.add(NostrAccount::new(pubkey));
        }
        &self.accounts[&pubkey]
    }

    /// Removing the active account leaves no account active.
    pub fn remove(&mut self, pubkey: &Pubkey) -> Option<NostrAccount> {
        let removed = self.accounts.remove(pubkey)?;
        if self.active.as_ref() == Some(pubkey) {
            self.active = None;
        }
        self.persist();
        Some(removed)
    }

    /// `None` clears the selection. Unknown pubkeys are ignored.
    pub fn set_active(&mut self, pubkey: Option<Pubkey>) -> bool {
        if let Some(pk) = &pubkey {
            if !self.accounts.contains_key(pk) {
                return false;
            }
        }

        self.active = pubkey;
        self.persist();
        true
    }

    pub fn update_relays(&mut self, pubkey: &Pubkey, update: AccountRelayUpdate) -> bool {
        let Some(account) = self.accounts.get_mut(pubkey) else {
            return false;
        };

        if let Some(relays) = update.custom_relays {
            account.custom_relays = relays;
        }
        if let Some(selected) = update.selected_custom_relays {
            account.selected_custom_relays = selected;
        }
        if let Some(use_defaults) = update.use_default_relays {
            account.use_default_relays = use_defaults;
        }
        if let Some(enabled) = update.enabled {
            account.enabled = enabled;
        }

        self.persist();
        true
    }

    pub fn set_profile(&mut self, pubkey: &Pubkey, display_name: Option<String>, picture: Option<String>) {
        if let Some(account) = self.accounts.get_mut(pubkey) {
            account.display_name = display_name;
            account.picture = picture;
            self.persist();
        }
    }

    /// Relays of the active account, empty when nobody is active
    pub fn effective_relays(&self) -> Vec<String> {
        self.active()
            .map(NostrAccount::effective_relays)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;

    fn pk(n: u8) -> Pubkey {
        Pubkey::new([n; 32])
    }

    #[test]
    fn effective_relays_merge_defaults_and_selection() {
        let mut account = NostrAccount::new(pk(1));
        account.selected_custom_relays = vec![
            "wss://mine.example".to_string(),
            "wss://purplepag.es".to_string(),
        ];

        assert_eq!(
            account.effective_relays(),
            vec![
                "wss://purplepag.es",
                "wss://indexer.coracle.social",
                "wss://user.kindpag.es",
                "wss://mine.example",
            ]
        );

        account.use_default_relays = false;
        assert_eq!(account.effective_relays(), vec!["wss://mine.example", "wss://purplepag.es"]);
    }

    #[test]
    fn removing_the_active_account_clears_it() {
        let store: Rc<dyn KeyValueStore> = Rc::new(MemoryStore::new());
        let mut accounts = Accounts::load(store.clone());

        accounts.ensure(pk(1));
        accounts.ensure(pk(2));
        assert!(accounts.set_active(Some(pk(2))));
        assert!(!accounts.set_active(Some(pk(9))));
        assert_eq!(accounts.active_pubkey(), Some(&pk(2)));

        accounts.remove(&pk(2));
        assert_eq!(accounts.active_pubkey(), None);
        assert_eq!(store.get(ACTIVE_ACCOUNT_KEY), None);
        assert!(accounts.effective_relays().is_empty());
    }

    #[test]
    fn accounts_survive_a_reload() {
        let store: Rc<dyn KeyValueStore> = Rc::new(MemoryStore::new());
        let mut accounts = Accounts::load(store.clone());

        accounts.ensure(pk(1));
        accounts.update_relays(
            &pk(1),
            AccountRelayUpdate {
                custom_relays: Some(vec!["wss://a.example".into(), "wss://b.example".into()]),
                selected_custom_relays: Some(vec!["wss://b.example".into()]),
                use_default_relays: Some(false),
                ..Default::default()
            },
        );
        accounts.set_profile(&pk(1), Some("oni".into()), None);
        accounts.set_active(Some(pk(1)));

        let reloaded = Accounts::load(store);
        assert_eq!(reloaded.len(), 1);
        let active = reloaded.active().unwrap();
        assert_eq!(active, accounts.get(&pk(1)).unwrap());
        assert_eq!(active.display_name.as_deref(), Some("oni"));
        assert_eq!(reloaded.effective_relays(), vec!["wss://b.example"]);
    }

    #[test]
    fn stored_format_is_keyed_by_hex_pubkey() {
        let store: Rc<dyn KeyValueStore> = Rc::new(MemoryStore::new());
        let mut accounts = Accounts::load(store.clone());
        accounts.ensure(pk(1));

        let raw: serde_json::Value =
            serde_json::from_str(&store.get(ACCOUNTS_KEY).unwrap()).unwrap();
        let entry = &raw["accounts"][pk(1).hex()];
        assert_eq!(entry["useDefaultRelays"], true);
        assert_eq!(entry["selectedCustomRelays"], serde_json::json!([]));
        assert!(raw["activeAccountPubkey"].is_null());
    }
}
