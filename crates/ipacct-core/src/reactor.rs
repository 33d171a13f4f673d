//! Scheduler-reactor event loop.
//!
//! A single-threaded loop combining a time-ordered callback queue with
//! readiness dispatch over Unix stream sockets. The loop sleeps until the
//! earliest of: the next due callback, readiness on a registered channel, a
//! wake request from another thread, or the maximum poll slice.
//!
//! The reactor does not own the channels it waits on. They live in a
//! [`Registry`] owned by the [`Dispatch`] context, which the reactor consults
//! on every iteration.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UnixStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace};

const WAKE: Token = Token(0);
const EVENTS_CAPACITY: usize = 64;
/// Deadline used when `now + delay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A deferred unit of work run on the reactor thread.
pub type Callback<C> = Box<dyn FnOnce(&mut C, &mut Scheduler<C>)>;

/// Identifies a scheduled callback so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Time-ordered callback queue.
///
/// Callbacks due at the same instant run in ascending `priority` order, then
/// in insertion order.
pub struct Scheduler<C> {
    queue: BinaryHeap<Reverse<(Instant, i32, u64)>>,
    callbacks: HashMap<u64, Callback<C>>,
    next_id: u64,
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            callbacks: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `callback` to run at `at`.
    pub fn schedule_at<F>(&mut self, at: Instant, priority: i32, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut C, &mut Scheduler<C>) + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push(Reverse((at, priority, id)));
        self.callbacks.insert(id, Box::new(callback));
        TimerHandle(id)
    }

    /// Schedule `callback` to run once `delay` has elapsed.
    pub fn schedule_after<F>(&mut self, delay: Duration, priority: i32, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut C, &mut Scheduler<C>) + 'static,
    {
        let now = Instant::now();
        let at = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.schedule_at(at, priority, callback)
    }

    /// Cancel a pending callback. Returns `false` if it already ran or was
    /// cancelled before.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if self.callbacks.remove(&handle.0).is_none() {
            return false;
        }
        self.queue.retain(|Reverse((_, _, id))| *id != handle.0);
        true
    }

    /// Whether any callback is still pending.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Number of pending callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Due time of the earliest pending callback.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Run every callback due at or before `now`. Returns how many ran.
    pub fn run_due(&mut self, ctx: &mut C, now: Instant) -> usize {
        let mut ran = 0;
        while let Some(&Reverse((at, _, id))) = self.queue.peek() {
            if at > now {
                break;
            }
            self.queue.pop();
            if let Some(callback) = self.callbacks.remove(&id) {
                callback(ctx, self);
                ran += 1;
            }
        }
        ran
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Readiness reported for a registered channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// The peer closed its end (read or write side).
    pub hangup: bool,
    pub error: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// A channel the reactor can wait on.
///
/// Readability is always of interest; writability only while
/// [`Pollable::wants_write`] returns true.
pub trait Pollable {
    fn source(&mut self) -> &mut UnixStream;
    fn wants_write(&self) -> bool;
}

fn interest_for(wants_write: bool) -> Interest {
    if wants_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

struct Entry<T> {
    item: T,
    interest: Interest,
}

/// Channels registered with a [`Reactor`], keyed by token.
pub struct Registry<T> {
    registry: mio::Registry,
    entries: BTreeMap<Token, Entry<T>>,
    next_token: usize,
}

impl<T: Pollable> Registry<T> {
    /// Register a channel and return its token.
    pub fn insert(&mut self, mut item: T) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let interest = interest_for(item.wants_write());
        self.registry.register(item.source(), token, interest)?;
        self.entries.insert(token, Entry { item, interest });
        Ok(token)
    }

    /// Deregister a channel and hand it back. Tokens are never reused.
    pub fn remove(&mut self, token: Token) -> Option<T> {
        let mut entry = self.entries.remove(&token)?;
        if let Err(e) = self.registry.deregister(entry.item.source()) {
            debug!(token = token.0, error = %e, "deregister failed");
        }
        Some(entry.item)
    }

    pub fn get(&self, token: Token) -> Option<&T> {
        self.entries.get(&token).map(|e| &e.item)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.entries.get_mut(&token).map(|e| &mut e.item)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, &T)> {
        self.entries.iter().map(|(token, e)| (*token, &e.item))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Token, &mut T)> {
        self.entries.iter_mut().map(|(token, e)| (*token, &mut e.item))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-register every channel whose write interest changed.
    pub fn sync(&mut self) -> io::Result<()> {
        for (token, entry) in &mut self.entries {
            let wanted = interest_for(entry.item.wants_write());
            if wanted != entry.interest {
                self.registry
                    .reregister(entry.item.source(), *token, wanted)?;
                entry.interest = wanted;
            }
        }
        Ok(())
    }
}

/// Cross-thread handle that interrupts a reactor wait.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    wake_tx: Arc<StdUnixStream>,
}

impl ReactorHandle {
    /// Make the reactor return from its current (or next) wait.
    pub fn wake(&self) {
        match (&*self.wake_tx).write(&[1]) {
            Ok(_) => {}
            // A full buffer already guarantees a wake-up.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!(error = %e, "reactor wake failed"),
        }
    }

    /// A new descriptor for the wake socket, for registration with
    /// `signal_hook::low_level::pipe`.
    pub fn wake_pipe(&self) -> io::Result<StdUnixStream> {
        self.wake_tx.try_clone()
    }
}

/// The context a [`Reactor`] drives.
pub trait Dispatch: Sized + 'static {
    /// Called once per iteration after due callbacks ran and before waiting.
    fn prepare(&mut self, scheduler: &mut Scheduler<Self>) -> io::Result<()>;

    /// True once no channels are left to wait on.
    fn is_idle(&self) -> bool;

    /// Handle readiness on a registered channel.
    fn dispatch(&mut self, token: Token, readiness: Readiness, scheduler: &mut Scheduler<Self>);
}

/// Scheduler-reactor loop.
pub struct Reactor<C> {
    poll: Poll,
    scheduler: Scheduler<C>,
    wake_rx: UnixStream,
    handle: ReactorHandle,
    max_slice: Duration,
}

impl<C> Reactor<C> {
    /// Create a reactor whose waits never exceed `max_slice`.
    pub fn new(max_slice: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let (rx, tx) = StdUnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        let mut wake_rx = UnixStream::from_std(rx);
        poll.registry()
            .register(&mut wake_rx, WAKE, Interest::READABLE)?;

        Ok(Self {
            poll,
            scheduler: Scheduler::new(),
            wake_rx,
            handle: ReactorHandle {
                wake_tx: Arc::new(tx),
            },
            max_slice,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Create an empty channel registry bound to this reactor.
    pub fn registry<T: Pollable>(&self) -> io::Result<Registry<T>> {
        Ok(Registry {
            registry: self.poll.registry().try_clone()?,
            entries: BTreeMap::new(),
            next_token: WAKE.0 + 1,
        })
    }

    pub fn scheduler(&mut self) -> &mut Scheduler<C> {
        &mut self.scheduler
    }

    fn timeout(&mut self, now: Instant) -> Duration {
        match self.scheduler.next_deadline() {
            Some(at) => at.saturating_duration_since(now).min(self.max_slice),
            None => self.max_slice,
        }
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wake_rx.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(error = %e, "draining wake socket failed");
                    return;
                }
            }
        }
    }
}

impl<C: Dispatch> Reactor<C> {
    /// Run until no callbacks are pending and the context has no channels.
    pub fn run(&mut self, ctx: &mut C) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.scheduler.run_due(ctx, Instant::now());
            ctx.prepare(&mut self.scheduler)?;

            if self.scheduler.is_empty() && ctx.is_idle() {
                debug!("nothing left to wait for, leaving event loop");
                return Ok(());
            }

            let timeout = self.timeout(Instant::now());
            trace!(timeout_ms = timeout.as_millis() as u64, "waiting");
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                if event.token() == WAKE {
                    self.drain_wake();
                    continue;
                }
                ctx.dispatch(event.token(), Readiness::from(event), &mut self.scheduler);
            }
        }
    }
}
