use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::messaging::channel::ReliableChannel;
use crate::messaging::frame::{Frame, UNKNOWN_ID};
use crate::messaging::layers::FrameSink;
use crate::messaging::transport::{DatagramHandler, Transport};
use crate::util::ids::SequentialIdAllocator;


/// A peer whose opening HELLO was admitted but not yet claimed by the application.
///  Produced by the dispatcher's admission logic, consumed exactly once by
///  [ConnectionDispatcher::accept].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PendingConnection {
    pub peer_id: i32,
    pub peer_addr: SocketAddr,
}


/// Accept-side multiplexer between one [Transport] and many [ReliableChannel]s.
///
/// Inbound frames are classified per datagram: a first HELLO from an unknown peer goes
///  into the bounded backlog for [ConnectionDispatcher::accept] to pick up, a handshake
///  ACK teaches the dispatcher which local channel has claimed that peer, and everything
///  addressed to a bound channel id is forwarded to that channel's intake.
///
/// The dispatcher never originates application data. Channels stacked on it use it as
///  their [FrameSink], which passes frames straight down to the transport.
pub struct ConnectionDispatcher {
    /// the well-known endpoint id of this dispatcher, minted by the injected allocator
    stage_id: i32,
    transport: Arc<dyn Transport>,
    backlog_tx: mpsc::Sender<PendingConnection>,
    backlog_rx: tokio::sync::Mutex<mpsc::Receiver<PendingConnection>>,
    /// peers whose HELLO was already admitted - a repeated HELLO is not a new connection
    admitted: Mutex<FxHashSet<i32>>,
    /// peer id -> id of the local channel that claimed it, learned from the handshake ACK
    partners: Mutex<FxHashMap<i32, i32>>,
    /// local channel id -> bound channel, the routing table for resolved destinations
    channels: Mutex<FxHashMap<i32, Arc<ReliableChannel>>>,
    cancel_accept: Notify,
    closed: AtomicBool,
}

impl ConnectionDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        backlog_capacity: usize,
        ids: &SequentialIdAllocator,
    ) -> anyhow::Result<Arc<ConnectionDispatcher>> {
        if backlog_capacity == 0 {
            bail!("backlog capacity must be at least 1");
        }

        let (backlog_tx, backlog_rx) = mpsc::channel(backlog_capacity);
        Ok(Arc::new(ConnectionDispatcher {
            stage_id: ids.next(),
            transport,
            backlog_tx,
            backlog_rx: tokio::sync::Mutex::new(backlog_rx),
            admitted: Mutex::new(FxHashSet::default()),
            partners: Mutex::new(FxHashMap::default()),
            channels: Mutex::new(FxHashMap::default()),
            cancel_accept: Notify::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn stage_id(&self) -> i32 {
        self.stage_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Removes and returns the oldest pending connection, suspending the caller while
    ///  the backlog is empty. Fails when the dispatcher is closed.
    pub async fn accept(&self) -> anyhow::Result<PendingConnection> {
        // registered before any await point so a close() racing the backlog lock
        //  cannot slip between the closed check and the wait
        let cancelled = self.cancel_accept.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        if self.closed.load(Ordering::Acquire) {
            bail!("dispatcher {} is closed", self.stage_id);
        }

        let mut backlog = self.backlog_rx.lock().await;
        if self.closed.load(Ordering::Acquire) {
            bail!("dispatcher {} is closed", self.stage_id);
        }

        tokio::select! {
            _ = cancelled.as_mut() => {
                bail!("accept on dispatcher {} was cancelled", self.stage_id)
            }
            next = backlog.recv() => {
                next.ok_or_else(|| anyhow!("dispatcher {} has shut down", self.stage_id))
            }
        }
    }

    /// Registers a channel in the routing table under its local id. Frames with that
    ///  destination id are forwarded to it from now on.
    pub fn bind_channel(&self, channel: Arc<ReliableChannel>) -> anyhow::Result<()> {
        match self.channels.lock().unwrap().entry(channel.local_id()) {
            Entry::Occupied(e) => {
                bail!(
                    "channel id {} is already bound to dispatcher {}",
                    e.key(),
                    self.stage_id
                );
            }
            Entry::Vacant(e) => {
                debug!("dispatcher {}: bound channel {}", self.stage_id, e.key());
                e.insert(channel);
                Ok(())
            }
        }
    }

    pub fn unbind_channel(&self, local_id: i32) -> anyhow::Result<()> {
        match self.channels.lock().unwrap().remove(&local_id) {
            Some(_) => {
                debug!("dispatcher {}: unbound channel {}", self.stage_id, local_id);
                Ok(())
            }
            None => bail!(
                "no channel with id {} is bound to dispatcher {}",
                local_id,
                self.stage_id
            ),
        }
    }

    /// Cancels pending and future [ConnectionDispatcher::accept] calls and stops frame
    ///  processing. Bound channels and the transport are left to their owners.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel_accept.notify_waiters();
        debug!("dispatcher {} closed", self.stage_id);
    }

    fn handle_frame(&self, frame: Frame, from: SocketAddr) {
        trace!("dispatcher {}: classifying frame {:?} from {:?}", self.stage_id, frame, from);

        if frame.is_hello() {
            if frame.seq != 0 || frame.sender_id < 0 || frame.dest_id != UNKNOWN_ID {
                debug!("dispatcher {}: dropping malformed handshake frame {:?}", self.stage_id, frame);
                return;
            }

            if !self.admitted.lock().unwrap().contains(&frame.sender_id) {
                self.admit(frame.sender_id, from);
                return;
            }

            // a retransmitted HELLO from an admitted peer is routed to the channel that
            //  claimed the peer, once the handshake ACK has revealed which one that is
            let partner = self.partners.lock().unwrap().get(&frame.sender_id).copied();
            match partner {
                Some(channel_id) => self.forward(channel_id, frame),
                None => debug!(
                    "dispatcher {}: HELLO from admitted peer {} has no partner channel yet - dropping",
                    self.stage_id, frame.sender_id
                ),
            }
            return;
        }

        if frame.is_ack() && frame.seq == 0 && frame.dest_id > 0 {
            let admitted = self.admitted.lock().unwrap().contains(&frame.sender_id);
            if admitted {
                // the handshake ACK names the local channel that claimed this peer
                self.partners.lock().unwrap().insert(frame.sender_id, frame.dest_id);
                debug!(
                    "dispatcher {}: peer {} is partnered with channel {}",
                    self.stage_id, frame.sender_id, frame.dest_id
                );
                self.forward(frame.dest_id, frame);
                return;
            }
        }

        if frame.dest_id > 0 {
            self.forward(frame.dest_id, frame);
            return;
        }

        debug!("dispatcher {}: dropping unroutable frame {:?} from {:?}", self.stage_id, frame, from);
    }

    fn admit(&self, peer_id: i32, peer_addr: SocketAddr) {
        let pending = PendingConnection { peer_id, peer_addr };
        match self.backlog_tx.try_send(pending) {
            Ok(()) => {
                self.admitted.lock().unwrap().insert(peer_id);
                debug!("dispatcher {}: admitted new peer {} at {:?}", self.stage_id, peer_id, peer_addr);
            }
            Err(_) => {
                warn!(
                    "dispatcher {}: backlog full - dropping connection attempt from peer {} at {:?}",
                    self.stage_id, peer_id, peer_addr
                );
            }
        }
    }

    fn forward(&self, channel_id: i32, frame: Frame) {
        let channel = self.channels.lock().unwrap().get(&channel_id).cloned();
        match channel {
            Some(channel) => {
                if let Err(e) = channel.receive(frame) {
                    debug!(
                        "dispatcher {}: dropping frame for channel {}: {:#} (the peer's retransmission will retry)",
                        self.stage_id, channel_id, e
                    );
                }
            }
            None => debug!(
                "dispatcher {}: no channel bound at id {} - dropping frame {:?}",
                self.stage_id, channel_id, frame
            ),
        }
    }
}

/// Downward path for channels stacked on the dispatcher: frames go straight to the
///  transport, the dispatcher adds nothing on the way down.
#[async_trait]
impl FrameSink for ConnectionDispatcher {
    async fn send_frame(&self, frame: &Frame, to: SocketAddr) -> anyhow::Result<()> {
        self.transport.send(&frame.encode(), to).await
    }
}

#[async_trait]
impl DatagramHandler for ConnectionDispatcher {
    async fn on_datagram(&self, payload: &str, from: SocketAddr) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match Frame::try_parse(payload) {
            Ok(frame) => self.handle_frame(frame, from),
            Err(e) => {
                debug!("dispatcher {}: dropping malformed datagram from {:?}: {:#}", self.stage_id, from, e);
            }
        }
    }
}
