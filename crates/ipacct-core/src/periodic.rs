//! Restartable fixed-interval task on top of the [`Scheduler`].

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::reactor::{Scheduler, TimerHandle};

/// Errors from misusing a [`Periodic`] task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeriodicError {
    #[error("periodic task is already scheduled")]
    AlreadyScheduled,
}

type Task<C> = dyn Fn(&mut C, &mut Scheduler<C>);

struct Inner<C> {
    interval: Duration,
    priority: i32,
    pending: Cell<Option<TimerHandle>>,
    task: Box<Task<C>>,
}

/// A task invoked every `interval` on the reactor thread.
///
/// Cloning yields another handle to the same task. When the timer fires the
/// next run is scheduled before the task body executes, so the body may
/// freely [`stop`](Periodic::stop) or [`call_now`](Periodic::call_now) it.
pub struct Periodic<C> {
    inner: Rc<Inner<C>>,
}

impl<C> Clone for Periodic<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<C: 'static> Periodic<C> {
    pub fn new<F>(interval: Duration, priority: i32, task: F) -> Self
    where
        F: Fn(&mut C, &mut Scheduler<C>) + 'static,
    {
        Self {
            inner: Rc::new(Inner {
                interval,
                priority,
                pending: Cell::new(None),
                task: Box::new(task),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.pending.get().is_some()
    }

    /// Schedule the next run one interval from now without running the task.
    pub fn schedule(&self, scheduler: &mut Scheduler<C>) -> Result<(), PeriodicError> {
        if self.is_scheduled() {
            return Err(PeriodicError::AlreadyScheduled);
        }
        let this = self.clone();
        let handle = scheduler.schedule_after(self.inner.interval, self.inner.priority, move |ctx, sched| {
            this.fire(ctx, sched)
        });
        self.inner.pending.set(Some(handle));
        Ok(())
    }

    /// Schedule the next run, then run the task immediately.
    pub fn start(&self, ctx: &mut C, scheduler: &mut Scheduler<C>) -> Result<(), PeriodicError> {
        self.schedule(scheduler)?;
        (self.inner.task)(ctx, scheduler);
        Ok(())
    }

    /// Cancel the pending run, if any.
    pub fn stop(&self, scheduler: &mut Scheduler<C>) {
        if let Some(handle) = self.inner.pending.take() {
            scheduler.cancel(handle);
        }
    }

    /// Run the task now.
    ///
    /// A scheduled task restarts its interval from now; an unscheduled one
    /// runs once and stays unscheduled.
    pub fn call_now(&self, ctx: &mut C, scheduler: &mut Scheduler<C>) -> Result<(), PeriodicError> {
        if self.is_scheduled() {
            self.stop(scheduler);
            self.start(ctx, scheduler)
        } else {
            (self.inner.task)(ctx, scheduler);
            Ok(())
        }
    }

    fn fire(&self, ctx: &mut C, scheduler: &mut Scheduler<C>) {
        self.inner.pending.set(None);
        // Only fails if the task was rescheduled between firing and here,
        // which cannot happen on the reactor thread.
        let _ = self.schedule(scheduler);
        (self.inner.task)(ctx, scheduler);
    }
}
