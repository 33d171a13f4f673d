//! Counter wire protocol.
//!
//! Every frame starts with a four byte header: the total frame length
//! (header included) and a command code, both big-endian `u16`. The payload
//! fills the remaining `length - 4` bytes.
//!
//! | code | command | payload |
//! |------|---------|---------|
//! | 1    | update  | `u64` byte count, then the raw address |
//! | 2    | end     | empty |
//! | 3    | loss    | `u16` count of dropped packets |
//!
//! Anything else is a protocol violation and fatal to the channel that sent
//! it. The daemon itself only ever writes single "poll" bytes.

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 4;

/// The byte written to a counter to request its data.
pub const POLL_BYTE: u8 = b'x';

const CMD_UPDATE: u16 = 1;
const CMD_END: u16 = 2;
const CMD_LOSS: u16 = 3;

/// A decoded counter frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Bytes accounted to an address since the previous poll.
    Update { value: u64, address: Box<[u8]> },
    /// The counter has reported everything it had for the current poll.
    End,
    /// The counter missed packets.
    Loss { count: u16 },
}

/// A frame that violates the protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame length {0} is shorter than the header")]
    ShortFrame(u16),

    #[error("unknown command {0}")]
    UnknownCommand(u16),

    #[error("update payload of {0} bytes is shorter than the counter value")]
    ShortUpdate(usize),

    #[error("end frame carries a {0} byte payload")]
    EndWithPayload(usize),

    #[error("loss payload must be 2 bytes, got {0}")]
    BadLoss(usize),

    #[error("address of {0} bytes does not fit in a frame")]
    Oversized(usize),
}

impl Packet {
    /// Encode this packet as a wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let (command, payload_len) = match self {
            Packet::Update { address, .. } => (CMD_UPDATE, 8 + address.len()),
            Packet::End => (CMD_END, 0),
            Packet::Loss { .. } => (CMD_LOSS, 2),
        };
        let total = u16::try_from(HEADER_LEN + payload_len).map_err(|_| {
            ProtocolError::Oversized(payload_len.saturating_sub(8))
        })?;

        let mut frame = Vec::with_capacity(usize::from(total));
        frame.extend_from_slice(&total.to_be_bytes());
        frame.extend_from_slice(&command.to_be_bytes());
        match self {
            Packet::Update { value, address } => {
                frame.extend_from_slice(&value.to_be_bytes());
                frame.extend_from_slice(address);
            }
            Packet::End => {}
            Packet::Loss { count } => frame.extend_from_slice(&count.to_be_bytes()),
        }
        Ok(frame)
    }

    fn decode(command: u16, payload: &[u8]) -> Result<Self, ProtocolError> {
        match command {
            CMD_UPDATE => {
                let Some((value, address)) = payload.split_first_chunk::<8>() else {
                    return Err(ProtocolError::ShortUpdate(payload.len()));
                };
                Ok(Packet::Update {
                    value: u64::from_be_bytes(*value),
                    address: address.into(),
                })
            }
            CMD_END if payload.is_empty() => Ok(Packet::End),
            CMD_END => Err(ProtocolError::EndWithPayload(payload.len())),
            CMD_LOSS => {
                let count: [u8; 2] = payload
                    .try_into()
                    .map_err(|_| ProtocolError::BadLoss(payload.len()))?;
                Ok(Packet::Loss {
                    count: u16::from_be_bytes(count),
                })
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Incremental frame decoder.
///
/// Bytes are appended as they arrive from the socket and complete frames are
/// pulled out one at a time, so decoding never depends on how the stream was
/// chunked.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// After an error the decoder state is unspecified; the channel is
    /// expected to be torn down.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        let Some(header) = self.buf.first_chunk::<HEADER_LEN>() else {
            return Ok(None);
        };
        let length = u16::from_be_bytes([header[0], header[1]]);
        let command = u16::from_be_bytes([header[2], header[3]]);
        let frame_len = usize::from(length);
        if frame_len < HEADER_LEN {
            return Err(ProtocolError::ShortFrame(length));
        }
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let packet = Packet::decode(command, &self.buf[HEADER_LEN..frame_len]);
        self.buf.drain(..frame_len);
        packet.map(Some)
    }
}
