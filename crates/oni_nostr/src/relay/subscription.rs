use crossbeam_channel as chan;

use crate::relay::{NormRelayUrl, RelayReqId};
use crate::{Filter, Note};

/// What a subscription delivers. Events from one relay arrive in socket
/// order; across relays there is no ordering.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Event { relay: NormRelayUrl, note: Note },
    /// The relay has sent everything it had stored
    Eose { relay: NormRelayUrl },
    /// The relay ended the subscription on its side
    Closed {
        relay: NormRelayUrl,
        message: String,
    },
}

impl SubscriptionEvent {
    pub fn relay(&self) -> &NormRelayUrl {
        match self {
            Self::Event { relay, .. } | Self::Eose { relay } | Self::Closed { relay, .. } => relay,
        }
    }
}

/// Relay-side bookkeeping for one REQ
pub(crate) struct RelaySub {
    pub filters: Vec<Filter>,
    pub sink: chan::Sender<SubscriptionEvent>,
    /// Gate events through the pool's seen set
    pub dedup: bool,
}

/// Sends a CLOSE for its subscription when dropped. The owning relay
/// picks these up on its next poll.
#[derive(Debug)]
pub(crate) struct SubCloser {
    pub id: RelayReqId,
    pub tx: chan::Sender<RelayReqId>,
}

impl Drop for SubCloser {
    fn drop(&mut self) {
        let _ = self.tx.send(self.id.clone());
    }
}

/// A live subscription on a single relay. Dropping it unsubscribes.
pub struct Subscription {
    relay: NormRelayUrl,
    receiver: chan::Receiver<SubscriptionEvent>,
    closer: SubCloser,
}

impl Subscription {
    pub(crate) fn new(
        relay: NormRelayUrl,
        receiver: chan::Receiver<SubscriptionEvent>,
        closer: SubCloser,
    ) -> Self {
        Self {
            relay,
            receiver,
            closer,
        }
    }

    pub fn id(&self) -> &RelayReqId {
        &self.closer.id
    }

    pub fn relay(&self) -> &NormRelayUrl {
        &self.relay
    }

    pub fn try_recv(&self) -> Option<SubscriptionEvent> {
        self.receiver.try_recv().ok()
    }

    /// Everything delivered since the last call
    pub fn drain(&self) -> impl Iterator<Item = SubscriptionEvent> + '_ {
        self.receiver.try_iter()
    }

    pub fn receiver(&self) -> &chan::Receiver<SubscriptionEvent> {
        &self.receiver
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("relay", &self.relay)
            .field("id", &self.closer.id)
            .finish()
    }
}
