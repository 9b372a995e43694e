pub mod accounts;
pub mod bootstrap;
pub mod discovery;
mod error;
mod live;
pub mod nip53;
pub mod profile;
pub mod relay_list;
pub mod relay_profiles;
mod session;
pub mod storage;

pub use accounts::{AccountRelayUpdate, Accounts, NostrAccount};
pub use bootstrap::{
    following_count, merge_latest, Bootstrap, BootstrapConfig, BootstrapPhase, BootstrapState,
};
pub use discovery::{
    BroadcastRelays, DiscoveredRelay, Discovery, DiscoveryPolicy, DiscoverySource,
};
pub use error::Error;
pub use live::{
    publish_targets, LiveAction, LiveContext, LiveEvents, LiveEventsConfig, StreamInfo,
    PUBLISH_FAILED, SIGN_FAILED,
};
pub use nip53::{
    build_live_event, update_live_event, EphemeralPublish, LiveEventConfig, LiveEventUpdate,
    LiveStatus, Participant, PublishOutcome,
};
pub use profile::{short_npub, ProfileState};
pub use relay_list::RelaySpec;
pub use relay_profiles::{normalize_relay_url, RelayProfile, RelayProfiles};
pub use session::{Session, SessionConfig};
pub use storage::{DataPath, DataPathType, FileStore, KeyValueStore, MemoryStore};

// export libs
pub use oni_nostr;

pub type Result<T> = std::result::Result<T, error::Error>;
