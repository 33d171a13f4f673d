//! Control requests for the gather engine.
//!
//! Requests can come from signal handlers or from other threads. They only
//! raise an atomic flag and wake the reactor; the gather thread consumes
//! the flags on its next loop iteration.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::SigId;
use signal_hook::consts::signal::{SIGCHLD, SIGINT, SIGTERM, SIGUSR1};
use tracing::debug;

use crate::reactor::ReactorHandle;

/// Thread-safe handle for steering a running gather engine.
#[derive(Debug, Clone)]
pub struct GatherControl {
    terminate: Arc<AtomicBool>,
    poll_now: Arc<AtomicBool>,
    child_exited: Arc<AtomicBool>,
    reactor: ReactorHandle,
}

impl GatherControl {
    pub fn new(reactor: ReactorHandle) -> Self {
        Self {
            terminate: Arc::new(AtomicBool::new(false)),
            poll_now: Arc::new(AtomicBool::new(false)),
            child_exited: Arc::new(AtomicBool::new(false)),
            reactor,
        }
    }

    /// Stop polling, run one final round and let every counter drain.
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.reactor.wake();
    }

    /// Start a round immediately.
    pub fn request_poll(&self) {
        self.poll_now.store(true, Ordering::SeqCst);
        self.reactor.wake();
    }

    /// A child process may have exited and needs reaping.
    pub fn notify_child_exit(&self) {
        self.child_exited.store(true, Ordering::SeqCst);
        self.reactor.wake();
    }

    pub(crate) fn take_terminate(&self) -> bool {
        self.terminate.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_poll(&self) -> bool {
        self.poll_now.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn take_child_exit(&self) -> bool {
        self.child_exited.swap(false, Ordering::SeqCst)
    }

    /// Route process signals to this engine until the guard is dropped.
    ///
    /// SIGTERM and SIGINT request termination, SIGUSR1 an immediate poll and
    /// SIGCHLD a reaping pass.
    pub fn install_signal_handlers(&self) -> io::Result<SignalGuard> {
        let mut ids = Vec::new();
        let routes = [
            (SIGTERM, &self.terminate),
            (SIGINT, &self.terminate),
            (SIGUSR1, &self.poll_now),
            (SIGCHLD, &self.child_exited),
        ];
        for (signal, flag) in routes {
            ids.push(signal_hook::flag::register(signal, Arc::clone(flag))?);
            ids.push(signal_hook::low_level::pipe::register(
                signal,
                self.reactor.wake_pipe()?,
            )?);
        }
        debug!(handlers = ids.len(), "signal handlers installed");
        Ok(SignalGuard { ids })
    }
}

/// Unregisters the signal handlers installed by
/// [`GatherControl::install_signal_handlers`] on drop.
#[derive(Debug)]
pub struct SignalGuard {
    ids: Vec<SigId>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
