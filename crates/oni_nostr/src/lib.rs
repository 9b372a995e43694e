mod client;
mod error;
mod filter;
mod keypair;
pub mod kind;
mod note;
mod pubkey;
mod relay;
mod signer;
pub mod testing;

pub use client::ClientMessage;
pub use error::Error;
pub use ewebsock;
pub use filter::{Filter, FilterBuilder};
pub use keypair::{parse_secret_key, FullKeypair, Keypair};
pub use note::{unix_now, Note, NoteId, UnsignedNote};
pub use pubkey::Pubkey;
pub use relay::message::{CommandResult, RelayEvent, RelayMessage};
pub use relay::pool::{PoolPublish, PoolRelay, PoolSubscription, RelayPool};
pub use relay::{
    Backoff, Connector, EwebsockConnector, NoopWakeup, NormRelayUrl, PublishHandle, PublishResult,
    Relay, RelayOptions, RelayReqId, RelayStatus, SeenEvents, Subscription, SubscriptionEvent,
    Wakeup, WebsocketConn,
};
pub use secp256k1::SecretKey;
pub use signer::{LocalSigner, RejectingSigner, SignRequest, SignResponder, SignResult, Signer, SignerError};

pub type Result<T> = std::result::Result<T, error::Error>;
