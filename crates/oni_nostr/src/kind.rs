//! Event kinds this client reads or writes.

pub const METADATA: u32 = 0;
pub const TEXT_NOTE: u32 = 1;
pub const CONTACTS: u32 = 3;
pub const DELETION: u32 = 5;
pub const REACTION: u32 = 7;
pub const LIVE_CHAT_MESSAGE: u32 = 1311;
pub const ZAP: u32 = 9735;

/// NIP-65 relay list metadata
pub const RELAY_LIST: u32 = 10002;

/// NIP-42 client authentication
pub const CLIENT_AUTH: u32 = 22242;

/// NIP-66 relay discovery, published by relay monitors
pub const RELAY_DISCOVERY: u32 = 30166;

/// NIP-53 live activity
pub const LIVE_EVENT: u32 = 30311;

/// Parameterized replaceable kinds are addressed by `kind:pubkey:d-tag`
pub fn is_addressable(kind: u32) -> bool {
    (30000..40000).contains(&kind)
}

pub fn is_replaceable(kind: u32) -> bool {
    kind == METADATA || kind == CONTACTS || (10000..20000).contains(&kind)
}
