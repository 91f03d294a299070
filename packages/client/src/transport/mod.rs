//! Broker transport abstraction.
//!
//! A [`Transport`] opens one duplex [`Link`] of decoded frames. It knows nothing
//! about rooms, receipts or reconnection; the connection manager owns that.

mod websocket;

pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use souk_shared::protocol::{ClientFrame, ServerFrame};
use tokio::{sync::mpsc, task::AbortHandle};

use crate::error::TransportError;

/// Opens links to the broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new link to `url`, presenting `token` at the transport level.
    async fn open(&self, url: &str, token: Option<&str>) -> Result<Link, TransportError>;
}

/// One open connection to the broker, as a pair of frame channels.
///
/// The link is up while `inbound` yields frames; it is down once `inbound`
/// returns `None`. Dropping `outbound` closes the link gracefully.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
    io_task: Option<AbortHandle>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientFrame>,
        inbound: mpsc::UnboundedReceiver<ServerFrame>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            io_task: None,
        }
    }

    /// Attach the task driving the underlying socket, aborted when the link is lost.
    pub fn with_io_task(mut self, io_task: AbortHandle) -> Self {
        self.io_task = Some(io_task);
        self
    }

    /// Split into the outbound sender, the inbound receiver and the I/O task.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientFrame>,
        mpsc::UnboundedReceiver<ServerFrame>,
        Option<AbortHandle>,
    ) {
        (self.outbound, self.inbound, self.io_task)
    }
}
