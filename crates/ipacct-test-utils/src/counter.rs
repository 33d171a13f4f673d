//! Fake counters.
//!
//! [`FakeCounter`] plays the counter side of the wire protocol on a thread,
//! answering each poll byte from a script. [`shell_counter_args`] builds the
//! arguments for a `/bin/sh` stand-in that the daemon can spawn as a real
//! child process.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use ipacct_config::GroupId;
use ipacct_core::protocol::Packet;

/// An update frame.
pub fn update(value: u64, address: &[u8]) -> Packet {
    Packet::Update {
        value,
        address: address.into(),
    }
}

/// Concatenated wire frames.
pub fn frames(packets: &[Packet]) -> Vec<u8> {
    packets
        .iter()
        .flat_map(|p| p.encode().expect("test packet must encode"))
        .collect()
}

/// What a [`FakeCounter`] does when polled.
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer with these frames.
    Reply(Vec<Packet>),
    /// Answer with arbitrary bytes.
    Raw(Vec<u8>),
    /// Close the socket without answering.
    Die,
}

/// A counter simulated on a thread.
pub struct FakeCounter {
    group: GroupId,
    handle: JoinHandle<usize>,
}

impl FakeCounter {
    /// Answer every poll with the same frames until the daemon closes the
    /// socket.
    pub fn answering(group: GroupId, packets: Vec<Packet>) -> (UnixStream, Self) {
        Self::start(group, Vec::new(), Some(frames(&packets)))
    }

    /// Run one step per poll. Once the script is used up, further polls are
    /// read but never answered.
    pub fn scripted(group: GroupId, steps: Vec<Step>) -> (UnixStream, Self) {
        Self::start(group, steps, None)
    }

    fn start(group: GroupId, steps: Vec<Step>, repeat: Option<Vec<u8>>) -> (UnixStream, Self) {
        let (daemon_end, mut counter_end) = UnixStream::pair().expect("socketpair failed");
        let handle = thread::Builder::new()
            .name(format!("fake-counter-{group}"))
            .spawn(move || {
                let mut steps = steps.into_iter();
                let mut polls = 0;
                let mut byte = [0u8; 1];
                while let Ok(1) = counter_end.read(&mut byte) {
                    polls += 1;
                    let reply = match steps.next() {
                        Some(Step::Reply(packets)) => frames(&packets),
                        Some(Step::Raw(bytes)) => bytes,
                        Some(Step::Die) => break,
                        None => match &repeat {
                            Some(bytes) => bytes.clone(),
                            None => continue,
                        },
                    };
                    if counter_end.write_all(&reply).is_err() {
                        break;
                    }
                }
                polls
            })
            .expect("failed to spawn fake counter thread");
        (daemon_end, Self { group, handle })
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Wait for the counter to see end of stream; returns the polls it read.
    pub fn join(self) -> usize {
        self.handle.join().expect("fake counter panicked")
    }
}

/// Arguments making `/bin/sh` behave like a counter that answers every poll
/// with `packets` until its stdin is closed.
///
/// Use with `exe = "/bin/sh"`; the daemon appends the group and kind, which
/// the script ignores.
pub fn shell_counter_args(packets: &[Packet]) -> Vec<String> {
    let escaped = printf_escaped(packets);
    let script = format!(
        "while [ \"$(dd bs=1 count=1 2>/dev/null | wc -c)\" -eq 1 ]; do printf '{escaped}'; done"
    );
    vec!["-c".to_string(), script, "ipacct-test-counter".to_string()]
}

/// Arguments making `/bin/sh` wait for one poll, sleep `delay_secs`, answer
/// with `packets` and exit with `code` while the daemon still holds the
/// socket open.
pub fn answer_once_then_exit_args(packets: &[Packet], delay_secs: f32, code: i32) -> Vec<String> {
    let escaped = printf_escaped(packets);
    let script = format!(
        "dd bs=1 count=1 of=/dev/null 2>/dev/null; sleep {delay_secs}; printf '{escaped}'; exit {code}"
    );
    vec!["-c".to_string(), script, "ipacct-test-counter".to_string()]
}

fn printf_escaped(packets: &[Packet]) -> String {
    frames(packets)
        .iter()
        .map(|b| format!("\\{b:03o}"))
        .collect()
}

/// Arguments making `/bin/sh` exit right away with `code`.
pub fn failing_counter_args(code: i32) -> Vec<String> {
    vec!["-c".to_string(), format!("exit {code}"), "ipacct-test-counter".to_string()]
}
