use std::rc::Rc;
use std::time::Instant;

use oni_nostr::{Connector, Pubkey, RelayPool, Signer};
use tracing::info;

use crate::accounts::Accounts;
use crate::bootstrap::{Bootstrap, BootstrapConfig, BootstrapState};
use crate::discovery::{BroadcastRelays, DiscoveryPolicy};
use crate::live::{publish_targets, LiveContext, LiveEvents, LiveEventsConfig};
use crate::relay_profiles::RelayProfiles;
use crate::storage::KeyValueStore;

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub bootstrap: BootstrapConfig,
    pub live: LiveEventsConfig,
    /// Skip NIP-66 lookups for broadcast relays
    pub no_broadcast_discovery: bool,
}

/// Everything one signed-in user needs, owned in one place. Drive it with
/// [`Session::poll`] from the app's loop.
pub struct Session {
    pub pool: RelayPool,
    pub profiles: RelayProfiles,
    pub accounts: Accounts,
    pub broadcast: BroadcastRelays,
    pub bootstrap: Bootstrap,
    pub live: LiveEvents,
    signer: Option<Rc<dyn Signer>>,
    pubkey: Option<Pubkey>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        connector: Rc<dyn Connector>,
        store: Rc<dyn KeyValueStore>,
    ) -> Self {
        let mut pool = RelayPool::new(connector.clone());
        let profiles = RelayProfiles::load(store.clone());
        profiles.sync_pool(&mut pool);

        let broadcast_policy = if config.no_broadcast_discovery {
            DiscoveryPolicy::broadcast().without_monitors()
        } else {
            DiscoveryPolicy::broadcast()
        };

        Self {
            pool,
            profiles,
            accounts: Accounts::load(store.clone()),
            broadcast: BroadcastRelays::load(store.clone(), connector.clone(), broadcast_policy),
            bootstrap: Bootstrap::new(config.bootstrap, connector.clone()),
            live: LiveEvents::new(config.live, connector, store),
            signer: None,
            pubkey: None,
        }
    }

    pub fn pubkey(&self) -> Option<&Pubkey> {
        self.pubkey.as_ref()
    }

    pub fn signer(&self) -> Option<&Rc<dyn Signer>> {
        self.signer.as_ref()
    }

    pub fn bootstrap_state(&self) -> &BootstrapState {
        self.bootstrap.state()
    }

    /// Signs in as `pubkey` and starts resolving them. Switching from
    /// another user tears that user's state down first.
    pub fn login(&mut self, pubkey: Pubkey, signer: Option<Rc<dyn Signer>>, now: Instant) {
        if self.pubkey.is_some_and(|current| current != pubkey) {
            info!("switching account, resetting session");
            self.logout();
        }

        info!("logged in as {}", pubkey);
        self.pubkey = Some(pubkey);
        self.signer = signer;
        self.pool.set_auth_signer(self.signer.clone());

        self.accounts.ensure(pubkey);
        self.accounts.set_active(Some(pubkey));

        self.bootstrap
            .start(pubkey, &mut self.pool, &mut self.profiles, now);
        self.broadcast.discover(now);
    }

    pub fn logout(&mut self) {
        info!("logging out");
        self.bootstrap.reset(&self.pool);
        self.pool.clear_seen_events();
        self.profiles.reset();
        self.pool.disconnect_all();
        self.profiles.sync_pool(&mut self.pool);
        self.live.reset();
        self.pool.set_auth_signer(None);
        self.signer = None;
        self.pubkey = None;
    }

    /// Where live events go: outbox plus selected broadcast relays
    pub fn live_targets(&self) -> Vec<String> {
        publish_targets(
            &self.bootstrap.state().outbox_urls(),
            &self.broadcast.selected_urls(),
            &[],
        )
    }

    #[profiling::function]
    pub fn poll(&mut self, now: Instant) {
        self.pool.poll(now);
        self.bootstrap
            .poll(now, &mut self.pool, &mut self.profiles);
        self.broadcast.poll(now);

        let ctx = LiveContext {
            signer: self.signer.clone(),
            targets: self.live_targets(),
        };
        self.live.poll(&ctx, now);
    }
}
