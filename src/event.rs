//! Outbound notification queue.
//!
//! A bounded FIFO the host drains with `pop_event()`. Overflow drops the
//! oldest non-terminal entry and queues a single `Down` ahead of the
//! survivors so the host knows to resynchronize; terminal events are never
//! dropped.

use crate::lease::Lease;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Notifications delivered to the host, in production order.
#[derive(Debug, Clone)]
pub enum Event {
    /// The client hit a fatal I/O error (or lost events to overflow) and
    /// needs the host to resynchronize or recreate it.
    Down,
    /// A server made an offer; the host may `select()` it.
    Offer(Arc<Lease>),
    /// An ACK produced a lease; the host must `accept()` or `decline()`.
    Granted(Arc<Lease>),
    /// The server NAKed or REQUESTING timed out; the probe is back in INIT.
    Retracted,
    /// A renewal or rebind succeeded; the new lease replaces the old.
    Extended(Arc<Lease>),
    /// The lease ran out without a successful renewal.
    Expired,
    /// The probe was cancelled by the host.
    Cancelled,
}

impl Event {
    /// Terminal events end the probe's story; overflow must not lose them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Expired | Event::Cancelled)
    }
}

#[derive(Debug)]
pub struct EventQueue {
    queue: VecDeque<Event>,
    capacity: usize,
    down_pending: bool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            down_pending: false,
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.queue.len() >= self.capacity {
            match self.queue.iter().position(|e| !e.is_terminal()) {
                Some(idx) => {
                    warn!("event queue overflow, dropping oldest pending event");
                    self.queue.remove(idx);
                    if !self.down_pending {
                        self.queue.push_front(Event::Down);
                        self.down_pending = true;
                    }
                }
                None => {
                    // Queue full of terminal events; nothing is droppable.
                    // Grow past the bound rather than lose a terminal.
                }
            }
        }
        self.queue.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        let event = self.queue.pop_front();
        if matches!(event, Some(Event::Down)) {
            self.down_pending = false;
        }
        event
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = EventQueue::new(8);
        q.push(Event::Retracted);
        q.push(Event::Expired);
        assert!(matches!(q.pop(), Some(Event::Retracted)));
        assert!(matches!(q.pop(), Some(Event::Expired)));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest_and_signals_down() {
        let mut q = EventQueue::new(3);
        q.push(Event::Retracted);
        q.push(Event::Down);
        q.push(Event::Retracted);
        // Overflow: first Retracted dropped, Down inserted at the front.
        q.push(Event::Expired);

        assert!(matches!(q.pop(), Some(Event::Down)));
        assert!(matches!(q.pop(), Some(Event::Down)));
        assert!(matches!(q.pop(), Some(Event::Retracted)));
        assert!(matches!(q.pop(), Some(Event::Expired)));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_overflow_preserves_survivor_order() {
        let mut q = EventQueue::new(2);
        q.push(Event::Retracted);
        q.push(Event::Expired);
        q.push(Event::Cancelled);

        // Retracted (non-terminal) was dropped; the terminals survive in
        // order behind the Down marker.
        assert!(matches!(q.pop(), Some(Event::Down)));
        assert!(matches!(q.pop(), Some(Event::Expired)));
        assert!(matches!(q.pop(), Some(Event::Cancelled)));
    }

    #[test]
    fn test_terminal_events_never_dropped() {
        let mut q = EventQueue::new(2);
        q.push(Event::Expired);
        q.push(Event::Cancelled);
        q.push(Event::Expired);

        let mut terminals = 0;
        while let Some(e) = q.pop() {
            if e.is_terminal() {
                terminals += 1;
            }
        }
        assert_eq!(terminals, 3);
    }

    #[test]
    fn test_single_down_marker_per_overflow_burst() {
        let mut q = EventQueue::new(2);
        for _ in 0..6 {
            q.push(Event::Retracted);
        }
        let mut downs = 0;
        while let Some(e) = q.pop() {
            if matches!(e, Event::Down) {
                downs += 1;
            }
        }
        assert_eq!(downs, 1);
    }
}
