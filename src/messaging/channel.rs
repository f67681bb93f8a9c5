use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::messaging::config::LinkConfig;
use crate::messaging::frame::{Frame, ACK, HELLO, UNKNOWN_ID};
use crate::messaging::layers::{DeliveryHandler, FrameSink};
use crate::messaging::transport::DatagramHandler;


/// A reliable send failed because the retransmission budget was exhausted without the
///  matching ACK arriving. The channel's session state is left untouched; it is up to
///  the caller whether to retry, reconnect or give up.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DeliveryTimeout {
    pub seq: u32,
    pub retransmissions: u32,
}
impl Display for DeliveryTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame with sequence number {} was not acknowledged after {} retransmissions",
            self.seq, self.retransmissions
        )
    }
}
impl std::error::Error for DeliveryTimeout {}


/// The per-channel counters, guarded by a single lock: every logically atomic protocol
///  transition ("accept ACK and wake the sender", "record peer and arm `remote_seq`")
///  happens in one critical section on this struct.
struct ChannelState {
    /// the peer's channel id, [UNKNOWN_ID] until the handshake resolves it
    peer_id: i32,
    /// sequence number of the next frame to send; advances only when the matching ACK
    ///  is processed
    local_seq: u32,
    /// sequence number expected from the peer next; advances only when a data frame
    ///  carrying exactly this number is delivered upward
    remote_seq: u32,
}


/// One reliable point-to-point session over a lossy datagram stage.
///
/// The channel implements stop-and-wait ARQ: a HELLO/ACK handshake resolves the peer's
///  identity, every data frame is numbered, and at most one frame is unacknowledged at
///  any time. [ReliableChannel::send] returns only once the peer has acknowledged (or
///  the retransmission budget is exhausted), so delivery order at the peer equals call
///  order here.
///
/// Inbound frames go through a bounded intake queue drained by a dedicated task; a full
///  queue rejects the frame and relies on the peer's retransmission, so the receive
///  path never blocks the stage below.
pub struct ReliableChannel {
    local_id: i32,
    peer_addr: SocketAddr,
    config: Arc<LinkConfig>,
    under: Arc<dyn FrameSink>,
    state: Mutex<ChannelState>,
    /// signaled whenever `local_seq` advances - the condition a pending send waits on
    ack_advanced: Notify,
    /// serializes reliable sends: window size 1
    send_gate: tokio::sync::Mutex<()>,
    above: Mutex<Option<Arc<dyn DeliveryHandler>>>,
    intake: mpsc::Sender<Frame>,
    shutdown: Arc<Notify>,
    closed: AtomicBool,
}

impl ReliableChannel {
    /// Creates a channel stacked on `under`, addressing the peer endpoint at
    ///  `peer_addr`. The peer's channel id is unknown until the handshake; call
    ///  [ReliableChannel::connect] to perform it.
    ///
    /// `local_id` must be unique among concurrently active channels - see
    ///  [crate::util::ids::random_channel_id]. Fails on an invalid `config`.
    pub fn new(
        under: Arc<dyn FrameSink>,
        local_id: i32,
        peer_addr: SocketAddr,
        config: Arc<LinkConfig>,
    ) -> anyhow::Result<Arc<ReliableChannel>> {
        config.validate()?;

        let (intake_tx, intake_rx) = mpsc::channel(config.channel_intake_capacity);
        let shutdown = Arc::new(Notify::new());

        let channel = Arc::new(ReliableChannel {
            local_id,
            peer_addr,
            config,
            under,
            state: Mutex::new(ChannelState {
                peer_id: UNKNOWN_ID,
                local_seq: 0,
                remote_seq: 0,
            }),
            ack_advanced: Notify::new(),
            send_gate: tokio::sync::Mutex::new(()),
            above: Mutex::new(None),
            intake: intake_tx,
            shutdown: shutdown.clone(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(Self::drain_intake(Arc::downgrade(&channel), intake_rx, shutdown));
        Ok(channel)
    }

    pub fn local_id(&self) -> i32 {
        self.local_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_id(&self) -> i32 {
        self.state.lock().unwrap().peer_id
    }

    /// A channel is established once it has seen at least one valid handshake frame
    ///  addressed to it: the peer's HELLO (resolving the peer id) or the ACK for its
    ///  own HELLO.
    pub fn is_established(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.peer_id != UNKNOWN_ID || state.local_seq > 0
    }

    /// Attaches the single application consumer for inbound payloads. Attaching a
    ///  second consumer is a configuration error.
    pub fn bind(&self, above: Arc<dyn DeliveryHandler>) -> anyhow::Result<()> {
        let mut guard = self.above.lock().unwrap();
        if guard.is_some() {
            bail!("cannot bind a second consumer onto channel {}", self.local_id);
        }
        *guard = Some(above);
        Ok(())
    }

    /// Performs the opening handshake: sends HELLO (sequence 0) and suspends the caller
    ///  until the peer acknowledges it or the retransmission budget runs out.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let _window = self.send_gate.lock().await;

        let frame = {
            let state = self.state.lock().unwrap();
            if state.local_seq > 0 {
                bail!("handshake already completed on channel {}", self.local_id);
            }
            Frame::hello(self.local_id, state.peer_id)
        };

        self.send_until_acked(frame).await
    }

    /// Sends one application payload reliably. Suspends the caller until the peer has
    ///  acknowledged the frame; fails with [DeliveryTimeout] when the retransmission
    ///  budget is exhausted first. At most one frame is in flight per channel -
    ///  concurrent senders queue behind each other.
    pub async fn send(&self, payload: &str) -> anyhow::Result<()> {
        if payload == HELLO || payload == ACK {
            bail!("payload {:?} is reserved for the protocol", payload);
        }

        let _window = self.send_gate.lock().await;

        let frame = {
            let state = self.state.lock().unwrap();
            Frame::new(self.local_id, state.peer_id, state.local_seq, payload)
        };

        self.send_until_acked(frame).await
    }

    /// Enqueues an inbound frame for processing. Called by the stage below (dispatcher
    ///  or datagram adapter); fails when the intake queue is full or the channel is
    ///  closed, in which case the frame is simply lost and the peer's retransmission
    ///  recovers.
    pub fn receive(&self, frame: Frame) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("channel {} is closed", self.local_id);
        }
        self.intake
            .try_send(frame)
            .map_err(|_| anyhow!("intake queue of channel {} is full", self.local_id))
    }

    /// Stops processing inbound frames. Does not affect the stage below; a send that is
    ///  currently pending keeps running until it resolves via ACK or timeout.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
        debug!("channel {} closed", self.local_id);
    }

    async fn drain_intake(
        channel: Weak<ReliableChannel>,
        mut intake: mpsc::Receiver<Frame>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.notified() => break,
                next = intake.recv() => match next {
                    Some(frame) => frame,
                    None => break,
                },
            };
            match channel.upgrade() {
                Some(channel) => channel.on_frame(frame).await,
                None => break,
            }
        }
        trace!("intake drain stopped");
    }

    /// The receive-path state machine, one parsed frame at a time. Frames that fail a
    ///  check are dropped with a logged reason and never affect state.
    async fn on_frame(&self, frame: Frame) {
        trace!("channel {}: processing frame {:?}", self.local_id, frame);

        if frame.is_hello() {
            self.on_hello(frame).await;
        } else if frame.is_ack() {
            self.on_ack(frame);
        } else {
            self.on_data(frame).await;
        }
    }

    async fn on_hello(&self, frame: Frame) {
        if frame.seq != 0 || frame.sender_id < 0 || frame.dest_id != UNKNOWN_ID {
            debug!("channel {}: dropping malformed handshake frame {:?}", self.local_id, frame);
            return;
        }

        let ack = {
            let mut state = self.state.lock().unwrap();
            if state.peer_id == UNKNOWN_ID {
                state.peer_id = frame.sender_id;
                debug!("channel {}: peer resolved to {}", self.local_id, state.peer_id);
            } else if state.peer_id != frame.sender_id {
                debug!(
                    "channel {}: dropping HELLO from unexpected peer {} (connected to {})",
                    self.local_id, frame.sender_id, state.peer_id
                );
                return;
            }
            // a repeated HELLO from the known peer re-arms the counter and gets re-acked
            state.remote_seq = 1;
            Frame::ack(self.local_id, state.peer_id, 0)
        };

        self.send_ack(ack).await;
    }

    fn on_ack(&self, frame: Frame) {
        let mut state = self.state.lock().unwrap();

        // during the handshake an ACK may arrive before the peer's HELLO resolved its id
        if frame.dest_id != self.local_id
            || (state.peer_id != UNKNOWN_ID && frame.sender_id != state.peer_id)
        {
            debug!("channel {}: dropping ACK with mismatched ids {:?}", self.local_id, frame);
            return;
        }

        if frame.seq == state.local_seq {
            state.local_seq += 1;
            trace!("channel {}: frame {} acknowledged", self.local_id, frame.seq);
            self.ack_advanced.notify_waiters();
        } else {
            debug!(
                "channel {}: dropping ACK with sequence number {} (in flight: {})",
                self.local_id, frame.seq, state.local_seq
            );
        }
    }

    async fn on_data(&self, frame: Frame) {
        let above = match self.above.lock().unwrap().clone() {
            Some(above) => above,
            None => {
                debug!(
                    "channel {}: no consumer bound - dropping data frame {:?}",
                    self.local_id, frame
                );
                return;
            }
        };

        let (deliver, ack) = {
            let mut state = self.state.lock().unwrap();

            if frame.dest_id != self.local_id
                || state.peer_id == UNKNOWN_ID
                || frame.sender_id != state.peer_id
            {
                debug!("channel {}: dropping data frame with mismatched ids {:?}", self.local_id, frame);
                return;
            }

            if frame.seq == state.remote_seq {
                state.remote_seq += 1;
                (true, Frame::ack(self.local_id, state.peer_id, frame.seq))
            } else if state.remote_seq > 0 && frame.seq == state.remote_seq - 1 {
                // duplicate of the frame just delivered - the peer lost our ACK
                (false, Frame::ack(self.local_id, state.peer_id, frame.seq))
            } else {
                debug!(
                    "channel {}: dropping data frame with sequence number {} (expecting {})",
                    self.local_id, frame.seq, state.remote_seq
                );
                return;
            }
        };

        if deliver {
            trace!("channel {}: delivering frame {} upward", self.local_id, frame.seq);
            above.on_delivery(&frame.payload).await;
        } else {
            debug!(
                "channel {}: re-acknowledging duplicate frame {} without re-delivering",
                self.local_id, frame.seq
            );
        }
        self.send_ack(ack).await;
    }

    /// ACKs are fire-and-forget: transmitted once, never retried, never awaited on.
    async fn send_ack(&self, ack: Frame) {
        if let Err(e) = self.under.send_frame(&ack, self.peer_addr).await {
            warn!("channel {}: error sending ACK: {:#}", self.local_id, e);
        }
    }

    /// Transmits `frame` and suspends until `local_seq` advances past its sequence
    ///  number, retransmitting the identical frame every `retransmit_interval`. Fails
    ///  with [DeliveryTimeout] once `max_retransmit` retransmissions went unanswered.
    async fn send_until_acked(&self, frame: Frame) -> anyhow::Result<()> {
        let seq = frame.seq;
        let mut retransmissions: u32 = 0;

        self.under.send_frame(&frame, self.peer_addr).await?;

        loop {
            let notified = self.ack_advanced.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().unwrap().local_seq != seq {
                trace!("channel {}: send of frame {} complete", self.local_id, seq);
                return Ok(());
            }

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = time::sleep(self.config.retransmit_interval) => {
                    if retransmissions == self.config.max_retransmit {
                        debug!(
                            "channel {}: giving up on frame {} to {:?} after {} retransmissions",
                            self.local_id, seq, self.peer_addr, retransmissions
                        );
                        return Err(DeliveryTimeout { seq, retransmissions }.into());
                    }
                    retransmissions += 1;
                    trace!(
                        "channel {}: retransmitting frame {} to {:?} ({}/{})",
                        self.local_id, seq, self.peer_addr, retransmissions, self.config.max_retransmit
                    );
                    self.under.send_frame(&frame, self.peer_addr).await?;
                }
            }
        }
    }
}

/// Connecting-side adapter: a channel stacked directly on a transport is itself the
///  transport's datagram handler.
#[async_trait]
impl DatagramHandler for ReliableChannel {
    async fn on_datagram(&self, payload: &str, from: SocketAddr) {
        let frame = match Frame::try_parse(payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("channel {}: dropping malformed datagram from {:?}: {:#}", self.local_id, from, e);
                return;
            }
        };
        if let Err(e) = self.receive(frame) {
            debug!("channel {}: dropping frame from {:?}: {:#}", self.local_id, from, e);
        }
    }
}
