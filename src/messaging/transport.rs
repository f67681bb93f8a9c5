pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(test)] use mockall::automock;

/// Best-effort datagram transport. Implementations may silently drop frames (the UDP
///  implementation can even be configured to do so on purpose, to simulate a lossy
///  network); reliability is layered on top by [crate::messaging::channel::ReliableChannel].
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one datagram. Returning `Ok` means the datagram was handed to the network
    ///  (or intentionally discarded), not that it will arrive.
    async fn send(&self, payload: &str, to: SocketAddr) -> anyhow::Result<()>;

    /// Drains inbound datagrams, handing each one to `handler`. Runs until
    ///  [Transport::cancel_recv_loop] is called or the underlying endpoint fails.
    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);

    fn local_addr(&self) -> SocketAddr;
}


/// This trait decouples the transport implementation from what happens to a datagram
///  once it is received: on the accept side the handler is a
///  [crate::messaging::dispatcher::ConnectionDispatcher], on the connecting side it is
///  the [crate::messaging::channel::ReliableChannel] itself.
///
/// It is passed around as an `Arc<dyn ...>` to minimize dependencies of [Transport]
///  implementations.
#[async_trait::async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, payload: &str, from: SocketAddr);
}
