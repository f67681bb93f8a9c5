use anyhow::{anyhow, bail};

/// Handshake payload literal. A frame carrying exactly this payload (and sequence
///  number 0) opens a connection.
pub const HELLO: &str = "--HELLO--";

/// Acknowledgment payload literal, echoing the sequence number just accepted from
///  the peer.
pub const ACK: &str = "--ACK--";

/// The id value that stands for "unknown / not yet assigned", used for the peer id
///  until the handshake resolves it.
pub const UNKNOWN_ID: i32 = -1;


/// One wire-format unit: `senderId;destinationId;sequenceNumber;payload`.
///
/// Only the first three separators are structurally significant - the payload consumes
///  the rest of the string, so application payloads may themselves contain `;`. The
///  numeric fields have no escaping; a payload equal to one of the reserved literals
///  ([HELLO], [ACK]) is protocol traffic rather than application data.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub sender_id: i32,
    pub dest_id: i32,
    pub seq: u32,
    pub payload: String,
}

impl Frame {
    pub fn new(sender_id: i32, dest_id: i32, seq: u32, payload: impl Into<String>) -> Frame {
        Frame {
            sender_id,
            dest_id,
            seq,
            payload: payload.into(),
        }
    }

    /// the opening handshake frame - always sequence number 0
    pub fn hello(sender_id: i32, dest_id: i32) -> Frame {
        Frame::new(sender_id, dest_id, 0, HELLO)
    }

    pub fn ack(sender_id: i32, dest_id: i32, seq: u32) -> Frame {
        Frame::new(sender_id, dest_id, seq, ACK)
    }

    pub fn is_hello(&self) -> bool {
        self.payload == HELLO
    }

    pub fn is_ack(&self) -> bool {
        self.payload == ACK
    }

    pub fn encode(&self) -> String {
        format!("{};{};{};{}", self.sender_id, self.dest_id, self.seq, self.payload)
    }

    /// Parses a datagram's text into a frame, expecting exactly four `;`-separated
    ///  segments with numeric first three. The sequence number must be non-negative;
    ///  sender and destination ids may be negative (`-1` is "unknown").
    pub fn try_parse(raw: &str) -> anyhow::Result<Frame> {
        let mut segments = raw.splitn(4, ';');

        let sender_id = Self::parse_id(segments.next(), "sender id")?;
        let dest_id = Self::parse_id(segments.next(), "destination id")?;

        let seq_segment = segments
            .next()
            .ok_or_else(|| anyhow!("frame has no sequence number field: {:?}", raw))?;
        let seq: u32 = seq_segment
            .parse()
            .map_err(|_| anyhow!("sequence number is not a non-negative integer: {:?}", seq_segment))?;

        let payload = match segments.next() {
            Some(p) => p.to_string(),
            None => bail!("frame has no payload field: {:?}", raw),
        };

        Ok(Frame {
            sender_id,
            dest_id,
            seq,
            payload,
        })
    }

    fn parse_id(segment: Option<&str>, what: &str) -> anyhow::Result<i32> {
        let segment = segment.ok_or_else(|| anyhow!("frame has no {} field", what))?;
        if segment.is_empty() {
            bail!("frame has an empty {} field", what);
        }
        segment
            .parse()
            .map_err(|_| anyhow!("{} is not an integer: {:?}", what, segment))
    }
}
