//! Gather engine.
//!
//! Owns every counter channel and drives polling rounds on the reactor
//! thread. A round starts with `StartWrite`, asks each live counter for its
//! data, forwards every update and loss report as it arrives, and ends with
//! exactly one `EndWrite` once each counter has either sent "end" or died.
//!
//! Lifecycle:
//!
//! ```text
//! Running --terminate--> Draining --writer done--> Terminated
//! ```
//!
//! Termination runs one last round; each channel closes itself after that
//! round's "end", and the reactor returns once none are left.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use ipacct_config::GroupId;
use mio::Token;
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelState, CloseReason, CounterChannel, CounterHooks};
use crate::control::GatherControl;
use crate::event::Event;
use crate::periodic::{Periodic, PeriodicError};
use crate::queue::EventSender;
use crate::reactor::{Dispatch, Reactor, Readiness, Registry, Scheduler};
use crate::spawn::{self, SpawnedCounter};

const POLL_PRIORITY: i32 = 0;

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Draining,
    Terminated,
}

/// Groups whose "end" is awaited in the current round.
#[derive(Debug, Default)]
pub struct Round {
    pending: BTreeSet<GroupId>,
    open: bool,
    number: u64,
}

impl Round {
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Sequence number of the most recently opened round (1-based).
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn pending(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.pending.iter().copied()
    }

    fn open(&mut self, groups: impl IntoIterator<Item = GroupId>) {
        self.pending = groups.into_iter().collect();
        self.open = true;
        self.number += 1;
    }

    /// Returns true if removing `group` completed the round.
    fn finish(&mut self, group: GroupId) -> bool {
        if !self.open || !self.pending.remove(&group) {
            return false;
        }
        if self.pending.is_empty() {
            self.open = false;
            return true;
        }
        false
    }
}

/// Engine state lent to the channel hooks.
pub struct GatherState {
    lifecycle: Lifecycle,
    round: Round,
    queue: EventSender,
}

impl GatherState {
    fn emit(&self, event: Event) {
        if let Err(e) = self.queue.send(event) {
            warn!(error = %e, "writer is gone");
        }
    }

    fn finish_channel(&mut self, group: GroupId) {
        if self.round.finish(group) {
            debug!(round = self.round.number(), "round complete");
            self.emit(Event::EndWrite);
        }
    }
}

fn reporting_hooks() -> CounterHooks<GatherState> {
    CounterHooks::new(
        |state: &mut GatherState, record| state.emit(Event::Account(record)),
        |state: &mut GatherState, group| state.finish_channel(group),
        |state: &mut GatherState, record| state.emit(Event::Loss(record)),
    )
}

/// A counter channel as owned by the gather engine.
pub type Channel = CounterChannel<GatherState>;

/// Supervises the counters and turns their reports into queue events.
pub struct GatherEngine {
    channels: Registry<Channel>,
    state: GatherState,
    hooks: Rc<CounterHooks<GatherState>>,
    periodic: Periodic<GatherEngine>,
    control: GatherControl,
    children: HashMap<Pid, GroupId>,
    final_round_deferred: bool,
}

impl GatherEngine {
    /// Create an engine polling every `interval` and reporting to `queue`.
    pub fn new(reactor: &Reactor<Self>, interval: Duration, queue: EventSender) -> io::Result<Self> {
        Ok(Self {
            channels: reactor.registry()?,
            state: GatherState {
                lifecycle: Lifecycle::Running,
                round: Round::default(),
                queue,
            },
            hooks: Rc::new(reporting_hooks()),
            periodic: Periodic::new(interval, POLL_PRIORITY, |engine: &mut GatherEngine, sched| {
                engine.trigger(sched)
            }),
            control: GatherControl::new(reactor.handle()),
            children: HashMap::new(),
            final_round_deferred: false,
        })
    }

    /// Handle for steering the engine from other threads or signal handlers.
    pub fn control(&self) -> GatherControl {
        self.control.clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle
    }

    pub fn round(&self) -> &Round {
        &self.state.round
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether the next periodic round is scheduled.
    pub fn is_polling(&self) -> bool {
        self.periodic.is_scheduled()
    }

    /// Take over a connected counter socket. `pid` is reaped by the engine.
    pub fn add_channel(
        &mut self,
        group: GroupId,
        stream: UnixStream,
        pid: Option<Pid>,
    ) -> io::Result<Token> {
        let channel = CounterChannel::new(group, stream, pid, Rc::clone(&self.hooks))?;
        let token = self.channels.insert(channel)?;
        if let Some(pid) = pid {
            self.children.insert(pid, group);
        }
        debug!(group, token = token.0, pid = pid.map(Pid::as_raw), "counter registered");
        Ok(token)
    }

    pub fn add_counter(&mut self, counter: SpawnedCounter) -> io::Result<Token> {
        self.add_channel(counter.group, counter.stream, Some(counter.pid))
    }

    /// Schedule periodic rounds; the first one runs one interval from now.
    pub fn start(&mut self, scheduler: &mut Scheduler<Self>) -> Result<(), PeriodicError> {
        info!(
            counters = self.channels.len(),
            interval_secs = self.periodic.interval().as_secs(),
            "gathering started"
        );
        self.periodic.schedule(scheduler)
    }

    /// Periodic trigger: open a new round if possible.
    pub fn trigger(&mut self, scheduler: &mut Scheduler<Self>) {
        if self.state.lifecycle != Lifecycle::Running {
            debug!(lifecycle = ?self.state.lifecycle, "not running, poll skipped");
            return;
        }
        if self.channels.is_empty() {
            self.give_up(scheduler);
            return;
        }
        if self.state.round.is_open() {
            warn!(
                round = self.state.round.number(),
                pending = ?self.state.round.pending,
                "previous round still outstanding, poll skipped"
            );
            return;
        }
        self.start_round();
    }

    /// Forced trigger: poll now and restart the interval from here.
    pub fn poll_now(&mut self, scheduler: &mut Scheduler<Self>) {
        if self.state.lifecycle != Lifecycle::Running {
            debug!("immediate poll ignored while draining");
            return;
        }
        info!("immediate poll requested");
        let periodic = self.periodic.clone();
        if let Err(e) = periodic.call_now(self, scheduler) {
            warn!(error = %e, "immediate poll failed");
        }
    }

    /// Stop polling, run a final round and drain every channel.
    pub fn terminate(&mut self, scheduler: &mut Scheduler<Self>) {
        if self.state.lifecycle != Lifecycle::Running {
            debug!("terminate already in progress");
            return;
        }
        info!(counters = self.channels.len(), "terminating, running final round");
        self.periodic.stop(scheduler);
        self.state.lifecycle = Lifecycle::Draining;
        if self.state.round.is_open() {
            debug!(
                round = self.state.round.number(),
                "final round deferred until the current one completes"
            );
            self.final_round_deferred = true;
        } else {
            self.issue_final_round();
        }
    }

    /// Mark the engine terminated once the writer consumed everything.
    pub fn mark_terminated(&mut self) {
        self.state.lifecycle = Lifecycle::Terminated;
    }

    /// Collect exited counters without blocking.
    pub fn reap_children(&mut self, scheduler: &mut Scheduler<Self>) {
        let pids: Vec<Pid> = self.children.keys().copied().collect();
        for pid in pids {
            let status = spawn::reap(pid, false);
            if status.is_running() {
                continue;
            }
            let Some(group) = self.children.remove(&pid) else {
                continue;
            };
            let live = self
                .channels
                .iter()
                .find(|(_, c)| c.pid() == Some(pid))
                .map(|(token, _)| token);
            let Some(token) = live else {
                info!(group, pid = pid.as_raw(), %status, "counter reaped");
                continue;
            };
            // Deliver whatever the counter wrote before exiting.
            let outcome = match self.channels.get_mut(token) {
                Some(channel) => channel.handle_read(&mut self.state),
                None => ChannelState::Open,
            };
            let reason = match outcome {
                ChannelState::Closed(CloseReason::Eof) | ChannelState::Open => {
                    CloseReason::Exited(status.to_string())
                }
                ChannelState::Closed(reason) => reason,
            };
            self.close_channel(token, reason, scheduler);
        }
    }

    /// Wait for every counter not reaped yet. Used after the reactor returned.
    pub fn reap_remaining(&mut self) {
        for (pid, group) in self.children.drain() {
            let status = spawn::reap(pid, true);
            info!(group, pid = pid.as_raw(), %status, "counter reaped");
        }
    }

    fn start_round(&mut self) {
        self.state.emit(Event::StartWrite);
        self.state
            .round
            .open(self.channels.iter().map(|(_, c)| c.group()));
        for (_, channel) in self.channels.iter_mut() {
            channel.request_data();
        }
        debug!(
            round = self.state.round.number(),
            counters = self.channels.len(),
            "round started"
        );
    }

    fn issue_final_round(&mut self) {
        self.final_round_deferred = false;
        if self.channels.is_empty() {
            return;
        }
        self.start_round();
        for (_, channel) in self.channels.iter_mut() {
            channel.mark_closing();
        }
    }

    fn give_up(&mut self, scheduler: &mut Scheduler<Self>) {
        error!("no counters left, shutting down");
        self.periodic.stop(scheduler);
        self.state.lifecycle = Lifecycle::Draining;
    }

    fn close_channel(&mut self, token: Token, reason: CloseReason, scheduler: &mut Scheduler<Self>) {
        let Some(channel) = self.channels.remove(token) else {
            return;
        };
        let group = channel.group();
        drop(channel);

        let draining = self.state.lifecycle != Lifecycle::Running;
        match &reason {
            CloseReason::Drained => info!(group, "counter drained"),
            CloseReason::Protocol(_) => error!(group, %reason, "counter channel closed"),
            _ if draining => info!(group, %reason, "counter channel closed while draining"),
            _ => error!(group, %reason, "counter died"),
        }

        self.state.finish_channel(group);
        if self.channels.is_empty() && self.state.lifecycle == Lifecycle::Running {
            self.give_up(scheduler);
        }
    }
}

impl Dispatch for GatherEngine {
    fn prepare(&mut self, scheduler: &mut Scheduler<Self>) -> io::Result<()> {
        if self.control.take_child_exit() {
            self.reap_children(scheduler);
        }
        if self.control.take_terminate() {
            self.terminate(scheduler);
        }
        if self.control.take_poll() {
            self.poll_now(scheduler);
        }
        if self.final_round_deferred && !self.state.round.is_open() {
            self.issue_final_round();
        }
        self.channels.sync()
    }

    fn is_idle(&self) -> bool {
        self.channels.is_empty()
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness, scheduler: &mut Scheduler<Self>) {
        let Some(channel) = self.channels.get_mut(token) else {
            return;
        };
        let mut outcome = ChannelState::Open;
        if readiness.writable {
            outcome = channel.handle_write();
        }
        if outcome.is_open() && (readiness.readable || readiness.hangup || readiness.error) {
            outcome = channel.handle_read(&mut self.state);
        }
        if let ChannelState::Closed(reason) = outcome {
            self.close_channel(token, reason, scheduler);
        }
    }
}
