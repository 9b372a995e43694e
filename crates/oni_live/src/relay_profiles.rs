use std::collections::BTreeMap;
use std::rc::Rc;

use oni_nostr::{NormRelayUrl, RelayPool};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::{load_json, save_json, KeyValueStore};
use crate::Result;

pub const RELAY_PROFILES_KEY: &str = "oni_relay_profiles";

pub const OUTBOX: &str = "outbox";
pub const INBOX: &str = "inbox";
pub const INDEXERS: &str = "indexers";

/// A named group of relays. Exactly one profile is active and the pool
/// mirrors its relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayProfile {
    pub id: String,
    pub name: String,
    pub relays: Vec<String>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub builtin: bool,
    /// Relays missing from this map are enabled
    #[serde(default)]
    pub relay_enabled: BTreeMap<String, bool>,
}

fn enabled_default() -> bool {
    true
}

impl RelayProfile {
    fn builtin(id: &str, name: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            relays: vec![],
            enabled: true,
            builtin: true,
            relay_enabled: BTreeMap::new(),
        }
    }

    pub fn is_relay_enabled(&self, url: &str) -> bool {
        self.relay_enabled.get(url).copied().unwrap_or(true)
    }

    pub fn enabled_relay_count(&self) -> usize {
        if !self.enabled {
            return 0;
        }

        self.relays
            .iter()
            .filter(|url| self.is_relay_enabled(url))
            .count()
    }
}

fn default_profiles() -> Vec<RelayProfile> {
    vec![
        RelayProfile::builtin(OUTBOX, "Outbox"),
        RelayProfile::builtin(INBOX, "Inbox"),
        RelayProfile::builtin(INDEXERS, "Indexers"),
    ]
}

/// `relay.example/` -> `wss://relay.example`
pub fn normalize_relay_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let with_scheme = if trimmed.starts_with("wss://") || trimmed.starts_with("ws://") {
        trimmed.to_owned()
    } else if trimmed.contains("://") {
        return Err(format!("{trimmed} is not a websocket url").into());
    } else {
        format!("wss://{trimmed}")
    };

    Ok(NormRelayUrl::new(with_scheme.trim_end_matches('/'))?.into())
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SavedProfiles {
    profiles: Vec<RelayProfile>,
    active_profile_id: Option<String>,
}

pub struct RelayProfiles {
    profiles: Vec<RelayProfile>,
    active: String,
    store: Rc<dyn KeyValueStore>,
}

impl RelayProfiles {
    pub fn new(store: Rc<dyn KeyValueStore>) -> Self {
        Self {
            profiles: default_profiles(),
            active: OUTBOX.to_owned(),
            store,
        }
    }

    /// Built-ins always come back, whatever was saved. Saved custom
    /// profiles are appended after them.
    pub fn load(store: Rc<dyn KeyValueStore>) -> Self {
        let mut profiles = Self::new(store);
        let Some(saved) = load_json::<SavedProfiles>(&*profiles.store, RELAY_PROFILES_KEY) else {
            return profiles;
        };

        let mut merged = Vec::with_capacity(saved.profiles.len().max(3));
        for default in default_profiles() {
            match saved.profiles.iter().find(|p| p.id == default.id) {
                Some(saved) => merged.push(RelayProfile {
                    builtin: true,
                    ..saved.clone()
                }),
                None => merged.push(default),
            }
        }
        for custom in saved.profiles.into_iter().filter(|p| !is_builtin_id(&p.id)) {
            merged.push(RelayProfile {
                builtin: false,
                ..custom
            });
        }

        profiles.profiles = merged;
        if let Some(active) = saved.active_profile_id {
            if profiles.get(&active).is_some() {
                profiles.active = active;
            }
        }

        info!("loaded {} relay profiles", profiles.profiles.len());
        profiles
    }

    fn persist(&self) {
        save_json(
            &*self.store,
            RELAY_PROFILES_KEY,
            &SavedProfiles {
                profiles: self.profiles.clone(),
                active_profile_id: Some(self.active.clone()),
            },
        );
    }

    pub fn profiles(&self) -> &[RelayProfile] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&RelayProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut RelayProfile> {
        self.profiles.iter_mut().find(|p| p.id == id)
    }

    pub fn active_id(&self) -> &str {
        &self.active
    }

    pub fn active(&self) -> Option<&RelayProfile> {
        self.get(&self.active)
    }

    /// Relays of the active profile
    pub fn active_relays(&self) -> &[String] {
        self.active().map(|p| p.relays.as_slice()).unwrap_or_default()
    }

    /// Switches the active profile and reconciles the pool with it.
    /// Unknown ids are ignored.
    pub fn set_active(&mut self, id: &str, pool: &mut RelayPool) {
        if self.get(id).is_none() {
            warn!("no relay profile called {id}");
            return;
        }

        self.active = id.to_owned();
        self.persist();
        self.sync_pool(pool);
    }

    /// Adds `url` to a profile. If that profile is the active one the
    /// relay also joins the pool and starts connecting. Returns the
    /// normalized url.
    pub fn add_relay(&mut self, id: &str, url: &str, pool: &mut RelayPool) -> Result<String> {
        let url = normalize_relay_url(url)?;
        let is_active = self.active == id;

        let Some(profile) = self.get_mut(id) else {
            return Err(format!("no relay profile called {id}").into());
        };

        if profile.relays.contains(&url) {
            return Ok(url);
        }

        debug!("adding {url} to relay profile {id}");
        profile.relays.push(url.clone());
        self.persist();

        if is_active {
            add_to_pool(pool, &url);
        }

        Ok(url)
    }

    pub fn remove_relay(&mut self, id: &str, url: &str, pool: &mut RelayPool) {
        let is_active = self.active == id;
        let Some(profile) = self.get_mut(id) else {
            return;
        };

        let before = profile.relays.len();
        profile.relays.retain(|r| r != url);
        if profile.relays.len() == before {
            return;
        }

        profile.relay_enabled.remove(url);
        self.persist();

        if is_active {
            pool.remove_relay(url);
        }
    }

    /// Replaces a profile's relays wholesale, keeping insertion order.
    pub fn set_relays(&mut self, id: &str, urls: &[String], pool: &mut RelayPool) {
        let current: Vec<String> = match self.get(id) {
            Some(profile) => profile.relays.clone(),
            None => return,
        };

        for url in current.iter().filter(|u| !urls.contains(u)) {
            self.remove_relay(id, url, pool);
        }

        for url in urls {
            if let Err(e) = self.add_relay(id, url, pool) {
                warn!("skipping relay {url}: {e}");
            }
        }
    }

    /// `custom_<n>`, one past the highest existing number
    pub fn create_profile(&mut self, name: &str) -> String {
        let next = self
            .profiles
            .iter()
            .filter_map(|p| p.id.strip_prefix("custom_"))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .map_or(1, |n| n + 1);

        let id = format!("custom_{next}");
        self.profiles.push(RelayProfile {
            id: id.clone(),
            name: name.to_owned(),
            relays: vec![],
            enabled: true,
            builtin: false,
            relay_enabled: BTreeMap::new(),
        });
        self.persist();
        id
    }

    /// Built-in profiles keep their names.
    pub fn rename_profile(&mut self, id: &str, name: &str) -> bool {
        match self.get_mut(id) {
            Some(profile) if !profile.builtin => {
                profile.name = name.to_owned();
                self.persist();
                true
            }
            _ => false,
        }
    }

    /// Built-in profiles can't be deleted. Deleting the active profile
    /// makes outbox active again.
    pub fn delete_profile(&mut self, id: &str, pool: &mut RelayPool) -> bool {
        match self.get(id) {
            Some(profile) if !profile.builtin => {}
            _ => return false,
        }

        self.profiles.retain(|p| p.id != id);
        if self.active == id {
            self.active = OUTBOX.to_owned();
            self.sync_pool(pool);
        }
        self.persist();
        true
    }

    pub fn toggle_enabled(&mut self, id: &str) {
        if let Some(profile) = self.get_mut(id) {
            profile.enabled = !profile.enabled;
            self.persist();
        }
    }

    pub fn set_relay_enabled(&mut self, id: &str, url: &str, enabled: bool) {
        if let Some(profile) = self.get_mut(id) {
            profile.relay_enabled.insert(url.to_owned(), enabled);
            self.persist();
        }
    }

    /// Back to the three empty built-ins with outbox active
    pub fn reset(&mut self) {
        self.profiles = default_profiles();
        self.active = OUTBOX.to_owned();
        self.persist();
    }

    /// Makes the pool hold exactly the active profile's relays.
    pub fn sync_pool(&self, pool: &mut RelayPool) {
        let target = self.active_relays();

        for url in pool.urls() {
            if !target.iter().any(|t| t == url.as_str()) {
                pool.remove_relay(url.as_str());
            }
        }

        for url in target {
            if !pool.has(url) {
                add_to_pool(pool, url);
            }
        }
    }
}

fn is_builtin_id(id: &str) -> bool {
    matches!(id, OUTBOX | INBOX | INDEXERS)
}

fn add_to_pool(pool: &mut RelayPool, url: &str) {
    match pool.add_relay_with_auth(url) {
        Ok(url) => {
            if let Some(relay) = pool.relay_mut(url.as_str()) {
                relay.connect();
            }
        }
        Err(e) => warn!("could not add {url} to the pool: {e}"),
    }
}
