//! Counter subprocess spawning.
//!
//! Each counter gets one end of a Unix socket pair as both stdin and stdout.
//! Startup failures are detected synchronously through a close-on-exec
//! handshake pipe: a successful `execv` closes the pipe without writing to
//! it, while a failing child writes a diagnostic before exiting. The parent
//! reads the pipe to end-of-file and knows which case it is in.

use std::ffi::{CStr, CString, c_char};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use ipacct_config::GroupId;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::socket::{self, SockFlag, SockType, socketpair};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, dup2, fork, pipe2, read, write};
use tracing::debug;

/// Exit code of a child that could not exec the counter.
const EXEC_FAILED: i32 = 127;

/// A running counter and the daemon's end of its socket.
#[derive(Debug)]
pub struct SpawnedCounter {
    pub group: GroupId,
    pub pid: Pid,
    pub stream: UnixStream,
}

/// Errors from starting a counter.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("argument {0:?} contains a NUL byte")]
    Argument(String),

    #[error("failed to create counter socket: {0}")]
    Socket(Errno),

    #[error("failed to create handshake pipe: {0}")]
    Pipe(Errno),

    #[error("fork failed: {0}")]
    Fork(Errno),

    #[error("failed to read handshake pipe: {0}")]
    HandshakeRead(Errno),

    #[error("counter for group {group} failed to start: {message}")]
    Startup { group: GroupId, message: String },
}

fn cstring(arg: &str) -> Result<CString, SpawnError> {
    CString::new(arg).map_err(|_| SpawnError::Argument(arg.to_string()))
}

/// Start `exe [exe_args...] <group> <kind>` with its stdio on a fresh socket.
pub fn spawn_counter(
    exe: &str,
    exe_args: &[String],
    group: GroupId,
    kind: &str,
) -> Result<SpawnedCounter, SpawnError> {
    let path = cstring(exe)?;
    let mut argv = Vec::with_capacity(exe_args.len() + 3);
    argv.push(path.clone());
    for arg in exe_args {
        argv.push(cstring(arg)?);
    }
    argv.push(cstring(&group.to_string())?);
    argv.push(cstring(kind)?);
    let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let (parent_end, child_end) = socketpair(
        socket::AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(SpawnError::Socket)?;
    let (status_rx, status_tx) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;

    let pid = match fork_process()? {
        ForkResult::Child => exec_counter(&child_end, &status_tx, &path, &argv_ptrs),
        ForkResult::Parent { child } => child,
    };
    drop(child_end);
    drop(status_tx);

    let message = read_handshake(&status_rx)?;
    if !message.is_empty() {
        let status = reap(pid, true);
        debug!(group, pid = pid.as_raw(), %status, "failed counter reaped");
        return Err(SpawnError::Startup { group, message });
    }

    debug!(group, pid = pid.as_raw(), exe, kind, "counter started");
    Ok(SpawnedCounter {
        group,
        pid,
        stream: UnixStream::from(parent_end),
    })
}

#[allow(unsafe_code)]
fn fork_process() -> Result<ForkResult, SpawnError> {
    // SAFETY: between fork and exec the child only calls async-signal-safe
    // functions (dup2, signal, execv, write, _exit) and allocates nothing.
    // The argv pointer array is built before the fork.
    unsafe { fork() }.map_err(SpawnError::Fork)
}

/// Runs in the forked child. `argv` must end with a null pointer.
#[allow(unsafe_code)]
fn exec_counter(socket: &OwnedFd, status: &OwnedFd, path: &CStr, argv: &[*const c_char]) -> ! {
    let fd = socket.as_raw_fd();
    if let Err(errno) = dup2(fd, 0).and_then(|_| dup2(fd, 1)) {
        report_and_exit(status, b"redirecting stdio failed: ", errno);
    }
    // The Rust runtime ignores SIGPIPE and an ignored disposition survives exec.
    // SAFETY: SIG_DFL installs no handler.
    if let Err(errno) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        report_and_exit(status, b"resetting SIGPIPE failed: ", errno);
    }
    // SAFETY: `path` and every non-null entry of `argv` point into CStrings
    // owned by the parent frame, and `argv` is null-terminated.
    unsafe { libc::execv(path.as_ptr(), argv.as_ptr()) };
    report_and_exit(status, b"exec failed: ", Errno::last())
}

#[allow(unsafe_code)]
fn report_and_exit(status: &OwnedFd, context: &[u8], errno: Errno) -> ! {
    let _ = write(status, context);
    let _ = write(status, errno.desc().as_bytes());
    // SAFETY: `_exit` ends the child without running the parent's atexit
    // handlers or flushing its stdio buffers.
    unsafe { libc::_exit(EXEC_FAILED) }
}

fn read_handshake(status: &OwnedFd) -> Result<String, SpawnError> {
    let mut message = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match read(status.as_raw_fd(), &mut buf) {
            Ok(0) => return Ok(String::from_utf8_lossy(&message).into_owned()),
            Ok(n) => message.extend_from_slice(&buf[..n]),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(SpawnError::HandshakeRead(errno)),
        }
    }
}

/// Outcome of waiting for a counter process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaped {
    StillRunning,
    Exited { code: i32 },
    Signaled { signal: &'static str },
    /// The pid is not (or no longer) a child of this process.
    NotChild,
}

impl Reaped {
    pub fn is_running(&self) -> bool {
        matches!(self, Reaped::StillRunning)
    }
}

impl fmt::Display for Reaped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reaped::StillRunning => f.write_str("still running"),
            Reaped::Exited { code } => write!(f, "exit status {code}"),
            Reaped::Signaled { signal } => write!(f, "killed by {signal}"),
            Reaped::NotChild => f.write_str("not a child process"),
        }
    }
}

/// Collect the exit status of `pid`, waiting for it when `block` is set.
pub fn reap(pid: Pid, block: bool) -> Reaped {
    let flags = if block {
        None
    } else {
        Some(WaitPidFlag::WNOHANG)
    };
    loop {
        match waitpid(pid, flags) {
            Ok(WaitStatus::StillAlive) => return Reaped::StillRunning,
            Ok(WaitStatus::Exited(_, code)) => return Reaped::Exited { code },
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Reaped::Signaled {
                    signal: signal.as_str(),
                };
            }
            Ok(_) if block => continue,
            Ok(_) => return Reaped::StillRunning,
            Err(Errno::EINTR) => continue,
            Err(_) => return Reaped::NotChild,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{Read, Write};

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string(), "counter".to_string()]
    }

    #[test]
    fn test_counter_receives_group_and_kind() {
        let mut counter =
            spawn_counter("/bin/sh", &sh(r#"printf '%s %s' "$1" "$2""#), 5, "ipv4src/24").unwrap();
        assert_eq!(counter.group, 5);

        let mut output = String::new();
        counter.stream.read_to_string(&mut output).unwrap();
        assert_eq!(output, "5 ipv4src/24");
        assert_eq!(reap(counter.pid, true), Reaped::Exited { code: 0 });
    }

    #[test]
    fn test_counter_stdin_is_the_socket() {
        let script = "dd bs=1 count=1 of=/dev/null 2>/dev/null; printf polled";
        let mut counter = spawn_counter("/bin/sh", &sh(script), 1, "ipv6dst").unwrap();

        counter.stream.write_all(b"x").unwrap();
        let mut output = String::new();
        counter.stream.read_to_string(&mut output).unwrap();
        assert_eq!(output, "polled");
        assert_eq!(reap(counter.pid, true), Reaped::Exited { code: 0 });
    }

    #[test]
    fn test_counter_starts_with_default_sigpipe() {
        const SIGPIPE_BIT: u64 = 1 << (Signal::SIGPIPE as u64 - 1);
        let script = r#"sed -n 's/^SigIgn:[[:space:]]*//p' /proc/$$/status"#;
        let mut counter = spawn_counter("/bin/sh", &sh(script), 1, "ipv4src").unwrap();

        let mut output = String::new();
        counter.stream.read_to_string(&mut output).unwrap();
        let ignored = u64::from_str_radix(output.trim(), 16).unwrap();
        assert_eq!(ignored & SIGPIPE_BIT, 0, "SigIgn {output}");
        assert_eq!(reap(counter.pid, true), Reaped::Exited { code: 0 });
    }

    #[test]
    fn test_missing_executable_is_a_startup_error() {
        let err = spawn_counter("/nonexistent/ipacct-counter", &[], 3, "ipv4src").unwrap_err();
        match err {
            SpawnError::Startup { group, message } => {
                assert_eq!(group, 3);
                assert!(message.starts_with("exec failed: "), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_nul_in_argument_is_rejected() {
        let err = spawn_counter("/bin/sh", &[], 1, "ipv4\0src").unwrap_err();
        assert!(matches!(err, SpawnError::Argument(_)));
    }

    #[test]
    fn test_reap_reports_signals_and_strangers() {
        let counter = spawn_counter("/bin/sh", &sh("kill -TERM $$"), 1, "ipv4src").unwrap();
        assert_eq!(
            reap(counter.pid, true),
            Reaped::Signaled { signal: "SIGTERM" }
        );
        assert_eq!(reap(counter.pid, false), Reaped::NotChild);
    }
}
