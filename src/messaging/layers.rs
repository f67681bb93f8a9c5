use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(test)] use mockall::automock;

use crate::messaging::frame::Frame;
use crate::messaging::transport::Transport;

/// Downward seam of a [crate::messaging::channel::ReliableChannel]: the stage its frames
///  are handed to for transmission. That is either a raw [Transport] (connecting side,
///  via [TransportSink]) or a [crate::messaging::dispatcher::ConnectionDispatcher]
///  (accept side), which forwards to its own transport.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn send_frame(&self, frame: &Frame, to: SocketAddr) -> anyhow::Result<()>;
}

/// Upward seam of a channel: the single application consumer bound above it. Payloads
///  are handed over in arrival order, exactly once each.
///
/// This is a blocking call from the channel's point of view - the channel processes its
///  next inbound frame only after the handler returns. Non-trivial work should be
///  offloaded by the handler implementation.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn on_delivery(&self, payload: &str);
}


/// Adapts a raw [Transport] to the [FrameSink] seam for channels stacked directly on it.
pub struct TransportSink {
    transport: Arc<dyn Transport>,
}

impl TransportSink {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<TransportSink> {
        Arc::new(TransportSink { transport })
    }
}

#[async_trait::async_trait]
impl FrameSink for TransportSink {
    async fn send_frame(&self, frame: &Frame, to: SocketAddr) -> anyhow::Result<()> {
        self.transport.send(&frame.encode(), to).await
    }
}
