//! Event queue between the gather thread and the writer thread.
//!
//! An unbounded FIFO: producers never block, so a slow storage backend can
//! never stall counter polling. The consumer blocks on a plain OS thread.

use tokio::sync::mpsc;

use crate::event::Event;

/// Create a connected sender/receiver pair.
pub fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

/// The receiving side was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event queue closed, {0} event dropped")]
pub struct QueueClosed(pub &'static str);

/// Producer half of the event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn send(&self, event: Event) -> Result<(), QueueClosed> {
        let kind = event.kind();
        self.tx.send(event).map_err(|_| QueueClosed(kind))
    }
}

/// Consumer half of the event queue.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Block until the next event arrives. `None` once every sender is gone.
    ///
    /// Must not be called from inside an async runtime.
    pub fn recv_blocking(&mut self) -> Option<Event> {
        self.rx.blocking_recv()
    }

    /// Take an event if one is ready.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drain everything queued right now.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fifo_order_and_depth() {
        let (tx, mut rx) = event_queue();
        tx.send(Event::StartWrite).unwrap();
        tx.send(Event::EndWrite).unwrap();
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.recv_blocking(), Some(Event::StartWrite));
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.drain(), vec![Event::EndWrite]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_receiver_sees_end_once_senders_drop() {
        let (tx, mut rx) = event_queue();
        let other = tx.clone();
        std::thread::spawn(move || {
            other.send(Event::Terminate).unwrap();
        })
        .join()
        .unwrap();
        drop(tx);
        assert_eq!(rx.recv_blocking(), Some(Event::Terminate));
        assert_eq!(rx.recv_blocking(), None);
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = event_queue();
        drop(rx);
        assert_eq!(tx.send(Event::EndWrite), Err(QueueClosed("end_write")));
    }
}
