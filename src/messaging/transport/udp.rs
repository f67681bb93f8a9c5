use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use crate::messaging::transport::{DatagramHandler, Transport};

const RECV_BUF_SIZE: usize = 64 * 1024;


/// UDP datagram transport with optional artificial loss.
///
/// `drop_probability` is the probability that a send is silently discarded instead of
///  hitting the socket. It exists so that the retransmission machinery above can be
///  exercised against a genuinely lossy network without leaving the process; production
///  endpoints use 0.0.
pub struct LossyUdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    drop_probability: f64,
    cancel: Notify,
}

impl LossyUdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<LossyUdpTransport> {
        Self::bind_lossy(addr, 0.0).await
    }

    pub async fn bind_lossy(addr: SocketAddr, drop_probability: f64) -> anyhow::Result<LossyUdpTransport> {
        if !(0.0..=1.0).contains(&drop_probability) {
            bail!("drop probability must be in [0, 1], was {}", drop_probability);
        }

        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("bound UDP endpoint to {:?}", local_addr);

        Ok(LossyUdpTransport {
            socket,
            local_addr,
            drop_probability,
            cancel: Notify::new(),
        })
    }
}

#[async_trait]
impl Transport for LossyUdpTransport {
    async fn send(&self, payload: &str, to: SocketAddr) -> anyhow::Result<()> {
        if self.drop_probability > 0.0 && rand::thread_rng().gen::<f64>() < self.drop_probability {
            trace!("simulating network loss: discarding datagram to {:?}", to);
            return Ok(());
        }

        trace!("sending datagram to {:?}: {:?}", to, payload);
        self.socket.send_to(payload.as_bytes(), to).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        info!("starting receive loop on {:?}", self.local_addr);

        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let (num_read, from) = tokio::select! {
                _ = self.cancel.notified() => {
                    info!("shutting down receive loop on {:?}", self.local_addr);
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => received?,
            };

            let payload = match std::str::from_utf8(&buf[..num_read]) {
                Ok(p) => p,
                Err(_) => {
                    debug!("received datagram from {:?} that is not valid UTF-8 - dropping", from);
                    continue;
                }
            };

            trace!("received datagram from {:?}: {:?}", from, payload);
            handler.on_datagram(payload, from).await;
        }
    }

    fn cancel_recv_loop(&self) {
        self.cancel.notify_one();
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}


#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    struct RecordingHandler {
        received: Mutex<Vec<(String, SocketAddr)>>,
        notify: Notify,
    }
    impl RecordingHandler {
        fn new() -> Arc<RecordingHandler> {
            Arc::new(RecordingHandler {
                received: Mutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }
    }
    #[async_trait]
    impl DatagramHandler for RecordingHandler {
        async fn on_datagram(&self, payload: &str, from: SocketAddr) {
            self.received.lock().unwrap().push((payload.to_string(), from));
            self.notify.notify_one();
        }
    }

    fn localhost_any() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_and_receive_roundtrip() {
        let sender = Arc::new(LossyUdpTransport::bind(localhost_any()).await.unwrap());
        let receiver = Arc::new(LossyUdpTransport::bind(localhost_any()).await.unwrap());

        let handler = RecordingHandler::new();
        let loop_handle = {
            let receiver = receiver.clone();
            let handler = handler.clone();
            tokio::spawn(async move { receiver.recv_loop(handler).await })
        };

        sender.send("1;2;0;hi there", receiver.local_addr()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handler.notify.notified())
            .await
            .expect("datagram was not delivered");

        let received = handler.received.lock().unwrap().clone();
        assert_eq!(received, vec![("1;2;0;hi there".to_string(), sender.local_addr())]);

        receiver.cancel_recv_loop();
        tokio::time::timeout(Duration::from_secs(5), loop_handle)
            .await
            .expect("receive loop did not shut down")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_loss_never_delivers() {
        let sender = Arc::new(LossyUdpTransport::bind_lossy(localhost_any(), 1.0).await.unwrap());
        let receiver = Arc::new(LossyUdpTransport::bind(localhost_any()).await.unwrap());

        let handler = RecordingHandler::new();
        {
            let receiver = receiver.clone();
            let handler = handler.clone();
            tokio::spawn(async move { receiver.recv_loop(handler).await });
        }

        for _ in 0..20 {
            sender.send("1;2;0;lost", receiver.local_addr()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(handler.received.lock().unwrap().is_empty());
        receiver.cancel_recv_loop();
    }

    #[tokio::test]
    async fn test_drop_probability_out_of_range_is_rejected() {
        assert!(LossyUdpTransport::bind_lossy(localhost_any(), 1.5).await.is_err());
        assert!(LossyUdpTransport::bind_lossy(localhost_any(), -0.1).await.is_err());
    }
}
