use crate::{relay::NormRelayUrl, Result};

use ewebsock::{Options, WsEvent, WsMessage, WsReceiver, WsSender};
use tracing::debug;

/// Called from the socket thread whenever something arrives, so a frame
/// loop that sleeps between polls knows to run again.
pub trait Wakeup: Send + Sync + Clone + 'static {
    fn wake(&self);
}

/// Wakes nobody. For owners that poll on a fixed tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopWakeup;

impl Wakeup for NoopWakeup {
    fn wake(&self) {}
}

/// One open (or opening) socket to a relay.
pub trait WebsocketConn {
    fn send(&mut self, msg: WsMessage);

    /// Next socket event without blocking
    fn try_recv(&mut self) -> Option<WsEvent>;

    fn close(&mut self);
}

/// Opens sockets. Relays keep a handle to one so they can reconnect on
/// their own.
pub trait Connector {
    fn connect(&self, url: &NormRelayUrl) -> Result<Box<dyn WebsocketConn>>;
}

pub struct EwebsockConn {
    sender: WsSender,
    receiver: WsReceiver,
}

impl WebsocketConn for EwebsockConn {
    fn send(&mut self, msg: WsMessage) {
        self.sender.send(msg);
    }

    fn try_recv(&mut self) -> Option<WsEvent> {
        self.receiver.try_recv()
    }

    fn close(&mut self) {
        self.sender.close();
    }
}

/// Real websockets through ewebsock
#[derive(Clone, Default)]
pub struct EwebsockConnector<W: Wakeup> {
    wakeup: W,
}

impl<W: Wakeup> EwebsockConnector<W> {
    pub fn new(wakeup: W) -> Self {
        Self { wakeup }
    }
}

impl<W: Wakeup> Connector for EwebsockConnector<W> {
    fn connect(&self, url: &NormRelayUrl) -> Result<Box<dyn WebsocketConn>> {
        let wakeup = self.wakeup.clone();
        debug!("opening websocket to {url}");
        let (sender, receiver) =
            ewebsock::connect_with_wakeup(url.as_str(), Options::default(), move || {
                wakeup.wake()
            })?;

        Ok(Box::new(EwebsockConn { sender, receiver }))
    }
}
