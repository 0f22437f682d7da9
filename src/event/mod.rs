//! The event queue driving the single-threaded cooperative run loop
//! (§4.F). Nothing in this crate spawns a thread or an async task: a
//! `Node` is advanced by repeatedly popping one `Event` and reacting to
//! it, in FIFO order, until the queue runs dry for this tick.

use std::collections::VecDeque;

use crate::connection::ConnectionId;
use crate::identity::Uid;

/// One unit of work for the run loop to react to.
#[derive(Clone, Debug)]
pub enum Event {
    /// Nothing to do this tick; lets an embedder's outer poll loop yield.
    Continue,
    /// Bytes are available to read on a connection.
    NewData(ConnectionId),
    /// A new inbound core-to-core connection has been accepted and
    /// allocated a slot, and is ready to begin its handshake.
    NewCoreConnection(ConnectionId),
    /// A friend request cert has arrived on `connection_id`, claiming to
    /// be from `from_uid` and addressed `to_uid`.
    FriendRequest {
        connection_id: ConnectionId,
        from_uid: Uid,
        to_uid: Uid,
    },
    /// The app (or an auto-accept policy) has approved a pending friend
    /// request previously surfaced via `FriendRequest`.
    AcceptFriendRequest {
        connection_id: ConnectionId,
        from_uid: Uid,
    },
    /// A connection should begin a graceful close.
    RequestConnectionClosing(ConnectionId),
    /// A connection should be torn down immediately, without waiting for
    /// in-flight requests to drain.
    RequestConnectionAbort(ConnectionId),
}

/// A FIFO queue of pending events. Bounded only by available memory: the
/// queue itself never rejects a push, since pushing an event always
/// corresponds to work already accepted elsewhere (e.g. a connection
/// already present in the, itself bounded, connection pool).
#[derive(Default)]
pub struct EventQueue {
    queue: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue { queue: VecDeque::new() }
    }

    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_drain_in_fifo_order() {
        let mut q = EventQueue::new();
        q.push(Event::NewData(1));
        q.push(Event::NewData(2));
        q.push(Event::RequestConnectionClosing(1));

        assert!(matches!(q.pop(), Some(Event::NewData(1))));
        assert!(matches!(q.pop(), Some(Event::NewData(2))));
        assert!(matches!(q.pop(), Some(Event::RequestConnectionClosing(1))));
        assert!(q.pop().is_none());
    }
}
