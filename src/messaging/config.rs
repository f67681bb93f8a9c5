use std::time::Duration;

use anyhow::bail;

/// Tuning knobs for reliable channels and the dispatcher's routing into them.
///
/// The retransmission parameters apply per channel and per frame: an unacknowledged
///  data or handshake frame is re-sent every `retransmit_interval` until either the
///  matching ACK arrives or `max_retransmit` retransmissions have gone unanswered,
///  at which point the pending send fails with a delivery timeout.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub retransmit_interval: Duration,

    /// number of *re*-transmissions of an unacknowledged frame before giving up;
    ///  the initial transmission is not counted
    pub max_retransmit: u32,

    /// capacity of a channel's inbound frame queue. When the queue is full, further
    ///  frames for that channel are dropped and the peer's retransmission recovers.
    pub channel_intake_capacity: usize,
}

impl LinkConfig {
    pub fn new() -> LinkConfig {
        LinkConfig {
            retransmit_interval: Duration::from_millis(1000),
            max_retransmit: 10,
            channel_intake_capacity: 32,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_interval.is_zero() {
            bail!("retransmit interval must be non-zero");
        }
        if self.max_retransmit == 0 {
            bail!("a frame must be retransmitted at least once before giving up");
        }
        if self.channel_intake_capacity == 0 {
            bail!("channel intake capacity must be at least 1");
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}
