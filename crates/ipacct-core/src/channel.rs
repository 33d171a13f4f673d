//! Counter channels.
//!
//! A [`CounterChannel`] wraps the socket shared with one counter subprocess.
//! It turns poll requests into single poll bytes and decoded frames into calls
//! on an injected [`CounterHooks`] record, so the same channel type serves
//! the gather engine, debugging tools and tests alike.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::rc::Rc;
use std::time::SystemTime;

use ipacct_config::GroupId;
use mio::net::UnixStream;
use nix::unistd::Pid;
use tracing::trace;

use crate::event::{AccountRecord, LossRecord};
use crate::protocol::{FrameDecoder, POLL_BYTE, Packet, ProtocolError};
use crate::reactor::Pollable;

const RECV_CHUNK: usize = 8192;

type UpdateHook<S> = Box<dyn Fn(&mut S, AccountRecord)>;
type EndHook<S> = Box<dyn Fn(&mut S, GroupId)>;
type LossHook<S> = Box<dyn Fn(&mut S, LossRecord)>;

/// What a channel does with decoded frames.
///
/// `S` is the caller's state, lent to the hooks for the duration of each
/// read.
pub struct CounterHooks<S> {
    pub on_update: UpdateHook<S>,
    pub on_end: EndHook<S>,
    pub on_loss: LossHook<S>,
}

impl<S> CounterHooks<S> {
    pub fn new(
        on_update: impl Fn(&mut S, AccountRecord) + 'static,
        on_end: impl Fn(&mut S, GroupId) + 'static,
        on_loss: impl Fn(&mut S, LossRecord) + 'static,
    ) -> Self {
        Self {
            on_update: Box::new(on_update),
            on_end: Box::new(on_end),
            on_loss: Box::new(on_loss),
        }
    }
}

/// Why a channel was torn down.
#[derive(Debug)]
pub enum CloseReason {
    /// The counter closed its end of the socket.
    Eof,
    /// The channel was draining and delivered its final "end".
    Drained,
    Protocol(ProtocolError),
    Io(io::Error),
    /// The counter process was reaped while its channel was still open.
    Exited(String),
}

impl CloseReason {
    /// Whether this is the orderly end of a draining channel.
    pub fn is_drained(&self) -> bool {
        matches!(self, CloseReason::Drained)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => f.write_str("counter closed its socket"),
            CloseReason::Drained => f.write_str("drained"),
            CloseReason::Protocol(e) => write!(f, "protocol violation: {e}"),
            CloseReason::Io(e) => write!(f, "socket error: {e}"),
            CloseReason::Exited(status) => write!(f, "counter exited ({status})"),
        }
    }
}

/// Outcome of handling readiness on a channel.
#[derive(Debug)]
pub enum ChannelState {
    Open,
    Closed(CloseReason),
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }
}

/// The daemon's end of a counter socket.
pub struct CounterChannel<S> {
    group: GroupId,
    pid: Option<Pid>,
    stream: UnixStream,
    decoder: FrameDecoder,
    requesting: bool,
    last_request: Option<SystemTime>,
    closing: bool,
    hooks: Rc<CounterHooks<S>>,
}

impl<S> CounterChannel<S> {
    /// Wrap a connected socket. The socket is switched to non-blocking mode.
    pub fn new(
        group: GroupId,
        stream: StdUnixStream,
        pid: Option<Pid>,
        hooks: Rc<CounterHooks<S>>,
    ) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            group,
            pid,
            stream: UnixStream::from_std(stream),
            decoder: FrameDecoder::new(),
            requesting: false,
            last_request: None,
            closing: false,
            hooks,
        })
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Process id of the counter, if this channel belongs to a spawned one.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// When the last poll byte was written.
    pub fn last_request(&self) -> Option<SystemTime> {
        self.last_request
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Ask the counter for its data on the next writable event.
    pub fn request_data(&mut self) {
        self.requesting = true;
    }

    /// Close the channel right after the next "end".
    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    /// Write the pending poll byte, if any.
    pub fn handle_write(&mut self) -> ChannelState {
        while self.requesting {
            match self.stream.write(&[POLL_BYTE]) {
                Ok(0) => break,
                Ok(_) => {
                    self.requesting = false;
                    self.last_request = Some(SystemTime::now());
                    trace!(group = self.group, "poll sent");
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return ChannelState::Closed(CloseReason::Io(e)),
            }
        }
        ChannelState::Open
    }

    /// Read everything available and deliver complete frames to the hooks.
    pub fn handle_read(&mut self, state: &mut S) -> ChannelState {
        let mut buf = [0u8; RECV_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    let delivered = self.deliver(state);
                    if self.decoder.buffered() > 0 {
                        trace!(
                            group = self.group,
                            bytes = self.decoder.buffered(),
                            "discarding partial frame at end of stream"
                        );
                    }
                    return match delivered {
                        ChannelState::Open => ChannelState::Closed(CloseReason::Eof),
                        closed => closed,
                    };
                }
                Ok(n) => {
                    self.decoder.extend(&buf[..n]);
                    let delivered = self.deliver(state);
                    if !delivered.is_open() {
                        return delivered;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ChannelState::Open,
                Err(e) => return ChannelState::Closed(CloseReason::Io(e)),
            }
        }
    }

    fn deliver(&mut self, state: &mut S) -> ChannelState {
        loop {
            let packet = match self.decoder.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => return ChannelState::Open,
                Err(e) => return ChannelState::Closed(CloseReason::Protocol(e)),
            };
            match packet {
                Packet::Update { value, address } => {
                    let record = AccountRecord {
                        timestamp: self.stamp(),
                        group: self.group,
                        address: address.into(),
                        value,
                    };
                    (self.hooks.on_update)(state, record);
                }
                Packet::Loss { count } => {
                    let record = LossRecord {
                        timestamp: self.stamp(),
                        group: self.group,
                        count,
                    };
                    (self.hooks.on_loss)(state, record);
                }
                Packet::End => {
                    (self.hooks.on_end)(state, self.group);
                    if self.closing {
                        return ChannelState::Closed(CloseReason::Drained);
                    }
                }
            }
        }
    }

    fn stamp(&self) -> SystemTime {
        self.last_request.unwrap_or_else(SystemTime::now)
    }
}

impl<S> Pollable for CounterChannel<S> {
    fn source(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    fn wants_write(&self) -> bool {
        self.requesting
    }
}

impl<S> fmt::Debug for CounterChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterChannel")
            .field("group", &self.group)
            .field("pid", &self.pid)
            .field("requesting", &self.requesting)
            .field("closing", &self.closing)
            .field("buffered", &self.decoder.buffered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Seen {
        updates: Vec<AccountRecord>,
        ends: Vec<GroupId>,
        losses: Vec<LossRecord>,
    }

    fn recording_hooks() -> Rc<CounterHooks<Seen>> {
        Rc::new(CounterHooks::new(
            |s: &mut Seen, r| s.updates.push(r),
            |s: &mut Seen, g| s.ends.push(g),
            |s: &mut Seen, r| s.losses.push(r),
        ))
    }

    fn channel(group: GroupId) -> (CounterChannel<Seen>, StdUnixStream) {
        let (ours, theirs) = StdUnixStream::pair().unwrap();
        let channel = CounterChannel::new(group, ours, None, recording_hooks()).unwrap();
        (channel, theirs)
    }

    fn frames(packets: &[Packet]) -> Vec<u8> {
        packets.iter().flat_map(|p| p.encode().unwrap()).collect()
    }

    fn update(value: u64, address: &[u8]) -> Packet {
        Packet::Update {
            value,
            address: address.into(),
        }
    }

    #[test]
    fn test_poll_request_writes_one_byte() {
        let (mut channel, mut peer) = channel(2);
        assert!(!channel.wants_write());

        channel.request_data();
        assert!(channel.wants_write());
        assert!(channel.handle_write().is_open());
        assert!(!channel.wants_write());
        assert!(channel.last_request().is_some());

        let mut byte = [0u8; 1];
        peer.read_exact(&mut byte).unwrap();
        assert_eq!(byte, [POLL_BYTE]);

        // Nothing pending, nothing written.
        assert!(channel.handle_write().is_open());
    }

    #[test]
    fn test_updates_carry_poll_timestamp() {
        let (mut channel, mut peer) = channel(3);
        channel.request_data();
        channel.handle_write();
        let polled_at = channel.last_request().unwrap();

        peer.write_all(&frames(&[
            update(100, &[10, 0, 0, 1]),
            Packet::Loss { count: 4 },
            Packet::End,
        ]))
        .unwrap();

        let mut seen = Seen::default();
        assert!(channel.handle_read(&mut seen).is_open());
        assert_eq!(seen.updates.len(), 1);
        assert_eq!(seen.updates[0].timestamp, polled_at);
        assert_eq!(seen.updates[0].group, 3);
        assert_eq!(seen.updates[0].value, 100);
        assert_eq!(seen.updates[0].address.as_bytes(), &[10, 0, 0, 1]);
        assert_eq!(seen.losses[0].count, 4);
        assert_eq!(seen.losses[0].timestamp, polled_at);
        assert_eq!(seen.ends, vec![3]);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let (mut channel, mut peer) = channel(1);
        let bytes = frames(&[update(5, &[1, 2, 3, 4]), Packet::End]);
        let mut seen = Seen::default();

        peer.write_all(&bytes[..6]).unwrap();
        assert!(channel.handle_read(&mut seen).is_open());
        assert!(seen.updates.is_empty());

        peer.write_all(&bytes[6..]).unwrap();
        assert!(channel.handle_read(&mut seen).is_open());
        assert_eq!(seen.updates.len(), 1);
        assert_eq!(seen.ends, vec![1]);
    }

    #[test]
    fn test_closing_channel_closes_after_end() {
        let (mut channel, mut peer) = channel(7);
        channel.mark_closing();
        peer.write_all(&frames(&[
            update(1, &[1, 1, 1, 1]),
            Packet::End,
            update(2, &[2, 2, 2, 2]),
        ]))
        .unwrap();

        let mut seen = Seen::default();
        let state = channel.handle_read(&mut seen);
        assert!(matches!(state, ChannelState::Closed(CloseReason::Drained)));
        assert_eq!(seen.updates.len(), 1);
        assert_eq!(seen.ends, vec![7]);
    }

    #[test]
    fn test_unknown_command_closes_channel() {
        let (mut channel, mut peer) = channel(1);
        peer.write_all(&[0x00, 0x04, 0x00, 0x09]).unwrap();

        let mut seen = Seen::default();
        let state = channel.handle_read(&mut seen);
        assert!(matches!(
            state,
            ChannelState::Closed(CloseReason::Protocol(ProtocolError::UnknownCommand(9)))
        ));
        assert!(seen.ends.is_empty());
    }

    #[test]
    fn test_eof_delivers_complete_frames_first() {
        let (mut channel, mut peer) = channel(4);
        peer.write_all(&frames(&[update(9, &[8, 8, 8, 8])])).unwrap();
        peer.write_all(&[0x00, 0x10]).unwrap();
        drop(peer);

        let mut seen = Seen::default();
        let state = channel.handle_read(&mut seen);
        assert!(matches!(state, ChannelState::Closed(CloseReason::Eof)));
        assert_eq!(seen.updates.len(), 1);
        assert_eq!(seen.updates[0].value, 9);
    }

    #[test]
    fn test_unsolicited_update_is_stamped_now() {
        let (mut channel, mut peer) = channel(4);
        let before = SystemTime::now();
        peer.write_all(&frames(&[update(1, &[0; 16])])).unwrap();

        let mut seen = Seen::default();
        channel.handle_read(&mut seen);
        assert!(seen.updates[0].timestamp >= before);
        assert_eq!(seen.updates[0].address.len(), 16);
    }
}
