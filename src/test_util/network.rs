use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::messaging::transport::{DatagramHandler, Transport};


/// A process-local datagram fabric: endpoints are plain socket addresses, delivery is a
///  direct call into the registered handler. There is no real I/O and no inherent
///  delay, so tests on a paused tokio runtime are fully deterministic.
///
/// Loss is scripted rather than random: [InMemoryNetwork::drop_next_matching] discards
///  the next datagram whose wire text contains a given needle, exactly once.
pub struct InMemoryNetwork {
    handlers: Mutex<FxHashMap<SocketAddr, Arc<dyn DatagramHandler>>>,
    drop_once: Mutex<Vec<String>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<InMemoryNetwork> {
        Arc::new(InMemoryNetwork {
            handlers: Mutex::new(FxHashMap::default()),
            drop_once: Mutex::new(Vec::new()),
        })
    }

    /// Attaches the inbound handler for an endpoint, replacing any previous one. Tests
    ///  usually call this directly instead of spawning a [Transport::recv_loop] task.
    pub fn register(&self, addr: SocketAddr, handler: Arc<dyn DatagramHandler>) {
        self.handlers.lock().unwrap().insert(addr, handler);
    }

    pub fn deregister(&self, addr: SocketAddr) {
        self.handlers.lock().unwrap().remove(&addr);
    }

    /// Scripts one lost datagram: the next send whose encoded text contains `needle`
    ///  is silently discarded. Multiple pending needles are matched independently.
    pub fn drop_next_matching(&self, needle: impl Into<String>) {
        self.drop_once.lock().unwrap().push(needle.into());
    }

    /// An endpoint of this fabric, usable wherever a [Transport] is expected.
    pub fn transport(self: &Arc<Self>, addr: SocketAddr) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            network: self.clone(),
            addr,
            cancel: Notify::new(),
        })
    }

    async fn deliver(&self, payload: &str, from: SocketAddr, to: SocketAddr) {
        if self.consume_drop_script(payload) {
            debug!("scripted loss: discarding datagram to {:?}: {:?}", to, payload);
            return;
        }

        let handler = self.handlers.lock().unwrap().get(&to).cloned();
        match handler {
            Some(handler) => handler.on_datagram(payload, from).await,
            None => debug!("no endpoint registered at {:?} - dropping datagram {:?}", to, payload),
        }
    }

    fn consume_drop_script(&self, payload: &str) -> bool {
        let mut drops = self.drop_once.lock().unwrap();
        match drops.iter().position(|needle| payload.contains(needle.as_str())) {
            Some(idx) => {
                drops.remove(idx);
                true
            }
            None => false,
        }
    }
}


pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    addr: SocketAddr,
    cancel: Notify,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, payload: &str, to: SocketAddr) -> anyhow::Result<()> {
        self.network.deliver(payload, self.addr, to).await;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        self.network.register(self.addr, handler);
        self.cancel.notified().await;
        self.network.deregister(self.addr);
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        self.cancel.notify_one();
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}


#[cfg(test)]
mod test {
    use super::*;

    struct CountingHandler {
        count: Mutex<u32>,
    }
    #[async_trait]
    impl DatagramHandler for CountingHandler {
        async fn on_datagram(&self, _payload: &str, _from: SocketAddr) {
            *self.count.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn test_scripted_loss_drops_exactly_once() {
        let net = InMemoryNetwork::new();
        let addr_a: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:4002".parse().unwrap();

        let handler = Arc::new(CountingHandler { count: Mutex::new(0) });
        net.register(addr_b, handler.clone());
        net.drop_next_matching("doomed");

        let transport = net.transport(addr_a);
        transport.send("1;2;0;doomed", addr_b).await.unwrap();
        transport.send("1;2;0;doomed", addr_b).await.unwrap();
        transport.send("1;2;1;other", addr_b).await.unwrap();

        assert_eq!(*handler.count.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_send_to_unregistered_endpoint_is_dropped() {
        let net = InMemoryNetwork::new();
        let addr_a: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:4002".parse().unwrap();

        net.transport(addr_a).send("1;2;0;nobody", addr_b).await.unwrap();
    }
}
