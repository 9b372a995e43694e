use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::{FullKeypair, Note, Pubkey, UnsignedNote};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("signer rejected the request: {0}")]
    Rejected(String),

    #[error("no signer available")]
    Unavailable,
}

pub type SignResult = Result<Note, SignerError>;

/// A signature that may arrive later, for example after the user approves
/// it in an external app. Poll it with [`SignRequest::try_take`] or await it.
pub struct SignRequest {
    rx: Option<oneshot::Receiver<SignResult>>,
}

/// The providing half of a [`SignRequest`]
pub struct SignResponder {
    tx: oneshot::Sender<SignResult>,
}

impl SignResponder {
    pub fn resolve(self, result: SignResult) {
        // the requester may have given up, that's fine
        let _ = self.tx.send(result);
    }
}

impl SignRequest {
    pub fn channel() -> (SignResponder, SignRequest) {
        let (tx, rx) = oneshot::channel();
        (SignResponder { tx }, SignRequest { rx: Some(rx) })
    }

    pub fn ready(result: SignResult) -> Self {
        let (responder, request) = Self::channel();
        responder.resolve(result);
        request
    }

    /// `None` while the signer is still working. A responder that went
    /// away without answering counts as [`SignerError::Unavailable`].
    pub fn try_take(&mut self) -> Option<SignResult> {
        let rx = self.rx.as_mut()?;
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(SignerError::Unavailable),
        };
        self.rx = None;
        Some(result)
    }

    pub fn is_done(&self) -> bool {
        self.rx.is_none()
    }
}

impl Future for SignRequest {
    type Output = SignResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Err(SignerError::Unavailable));
        };

        let out = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(SignerError::Unavailable),
        };
        self.rx = None;
        Poll::Ready(out)
    }
}

/// Anything that can turn an [`UnsignedNote`] into a signed [`Note`] on
/// behalf of one identity. Browser extensions, remote signers and local
/// keys all sit behind this.
pub trait Signer {
    fn pubkey(&self) -> Pubkey;

    fn sign(&self, note: UnsignedNote) -> SignRequest;
}

/// Signs with a secret key held in memory.
pub struct LocalSigner {
    keypair: FullKeypair,
}

impl LocalSigner {
    pub fn new(keypair: FullKeypair) -> Self {
        Self { keypair }
    }

    pub fn generate() -> Self {
        Self::new(FullKeypair::generate())
    }
}

impl Signer for LocalSigner {
    fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey
    }

    fn sign(&self, note: UnsignedNote) -> SignRequest {
        SignRequest::ready(
            note.sign(&self.keypair)
                .map_err(|e| SignerError::Rejected(e.to_string())),
        )
    }
}

/// Declines everything, like a user hitting "deny" every time.
pub struct RejectingSigner {
    pubkey: Pubkey,
}

impl RejectingSigner {
    pub fn new(pubkey: Pubkey) -> Self {
        Self { pubkey }
    }
}

impl Signer for RejectingSigner {
    fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    fn sign(&self, _note: UnsignedNote) -> SignRequest {
        SignRequest::ready(Err(SignerError::Rejected("user declined".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind;

    #[test]
    fn local_signer_resolves_immediately() {
        let signer = LocalSigner::generate();
        let mut req = signer.sign(UnsignedNote::new(
            signer.pubkey(),
            kind::TEXT_NOTE,
            "hi",
            vec![],
        ));

        let note = req.try_take().unwrap().unwrap();
        assert!(note.is_valid());
        assert!(req.is_done());
        assert!(req.try_take().is_none());
    }

    #[test]
    fn dropped_responder_is_unavailable() {
        let (responder, mut req) = SignRequest::channel();
        assert!(req.try_take().is_none());
        drop(responder);
        assert_eq!(req.try_take(), Some(Err(SignerError::Unavailable)));
    }

    #[tokio::test]
    async fn deferred_signature_can_be_awaited() {
        let signer = LocalSigner::generate();
        let (responder, req) = SignRequest::channel();
        let unsigned = UnsignedNote::new(signer.pubkey(), kind::TEXT_NOTE, "later", vec![]);

        let mut inner = signer.sign(unsigned);
        responder.resolve(inner.try_take().unwrap());

        assert_eq!(req.await.unwrap().content, "later");
    }
}
