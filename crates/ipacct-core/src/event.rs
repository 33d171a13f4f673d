//! Events passed from the gather thread to the writer thread.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ipacct_config::GroupId;

/// Raw address bytes as reported by a counter (4 bytes for IPv4, 16 for IPv6).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RawAddress(Box<[u8]>);

impl RawAddress {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Box<[u8]>> for RawAddress {
    fn from(bytes: Box<[u8]>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for RawAddress {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawAddress(")?;
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        f.write_str(")")
    }
}

/// Bytes accounted to one address during a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    /// When the poll that produced this record was sent.
    pub timestamp: SystemTime,
    pub group: GroupId,
    pub address: RawAddress,
    pub value: u64,
}

/// Packets a counter reports it could not account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossRecord {
    pub timestamp: SystemTime,
    pub group: GroupId,
    pub count: u16,
}

/// An entry in the event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A polling round begins.
    StartWrite,
    Account(AccountRecord),
    Loss(LossRecord),
    /// Every live counter has reported for the current round.
    EndWrite,
    /// No further events follow.
    Terminate,
}

impl Event {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::StartWrite => "start_write",
            Event::Account(_) => "account",
            Event::Loss(_) => "loss",
            Event::EndWrite => "end_write",
            Event::Terminate => "terminate",
        }
    }

    /// Timestamp carried by record events.
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Event::Account(record) => Some(record.timestamp),
            Event::Loss(record) => Some(record.timestamp),
            _ => None,
        }
    }
}

/// Seconds since the Unix epoch, clamped to zero for earlier times.
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
