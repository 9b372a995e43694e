use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::relay::NormRelayUrl;
use crate::NoteId;

/// How a relay answered a publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub accepted: bool,
    pub message: String,
}

impl PublishResult {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::rejected("timeout")
    }

    pub fn disconnected() -> Self {
        Self::rejected("disconnected")
    }
}

pub(crate) struct PendingPublish {
    pub tx: oneshot::Sender<PublishResult>,
    /// Stamped by the first poll that sees this publish
    pub deadline: Option<Instant>,
}

impl PendingPublish {
    pub fn is_due(&mut self, now: Instant, timeout: Duration) -> bool {
        now >= *self.deadline.get_or_insert(now + timeout)
    }

    pub fn resolve(self, result: PublishResult) {
        let _ = self.tx.send(result);
    }
}

/// Resolves once the relay answers with OK, the publish times out, or the
/// relay is disconnected. Poll with [`PublishHandle::try_result`] or await.
pub struct PublishHandle {
    event_id: NoteId,
    relay: NormRelayUrl,
    rx: Option<oneshot::Receiver<PublishResult>>,
    result: Option<PublishResult>,
}

impl PublishHandle {
    pub(crate) fn pending(event_id: NoteId, relay: NormRelayUrl) -> (PendingPublish, PublishHandle) {
        let (tx, rx) = oneshot::channel();
        (
            PendingPublish { tx, deadline: None },
            PublishHandle {
                event_id,
                relay,
                rx: Some(rx),
                result: None,
            },
        )
    }

    pub fn event_id(&self) -> &NoteId {
        &self.event_id
    }

    pub fn relay(&self) -> &NormRelayUrl {
        &self.relay
    }

    /// `None` until the publish has settled. The relay being dropped
    /// counts as a disconnect.
    pub fn try_result(&mut self) -> Option<&PublishResult> {
        if let Some(rx) = self.rx.as_mut() {
            let result = match rx.try_recv() {
                Ok(result) => result,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => PublishResult::disconnected(),
            };
            self.rx = None;
            self.result = Some(result);
        }

        self.result.as_ref()
    }

    pub fn is_settled(&mut self) -> bool {
        self.try_result().is_some()
    }
}

impl Future for PublishHandle {
    type Output = PublishResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.result.clone() {
            return Poll::Ready(result);
        }

        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(PublishResult::disconnected());
        };

        let result = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => PublishResult::disconnected(),
        };
        self.rx = None;
        self.result = Some(result.clone());
        Poll::Ready(result)
    }
}
