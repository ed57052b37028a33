//! Mailboxes and promise/future reply cells.
//!
//! Services in the kernel are actors: each owns private state, drains a
//! mailbox of typed messages on its own thread, and is single-threaded
//! with respect to that state. Long-running requests carry a [`Promise`];
//! the caller suspends on the matching [`ReplyFuture`] until the service
//! fulfills it. The future owns the shared cell, so the pending reply's
//! storage outlives the wait even if the service thread exits first.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

struct MailboxInner<M> {
    queue: Mutex<MailboxQueue<M>>,
    ready: Condvar,
}

struct MailboxQueue<M> {
    messages: VecDeque<M>,
    closed: bool,
}

/// A multi-producer, single-consumer mailbox.
///
/// Cloning yields another sender handle; exactly one thread should drain
/// it. Messages pushed after [`Mailbox::close`] are dropped.
pub struct Mailbox<M> {
    inner: Arc<MailboxInner<M>>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Mailbox {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Mailbox<M> {
    /// Empty open mailbox.
    pub fn new() -> Self {
        Mailbox {
            inner: Arc::new(MailboxInner {
                queue: Mutex::new(MailboxQueue {
                    messages: VecDeque::new(),
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Enqueue a message. Returns false when the mailbox is closed.
    pub fn push(&self, message: M) -> bool {
        let mut queue = self.inner.queue.lock();
        if queue.closed {
            return false;
        }
        queue.messages.push_back(message);
        self.inner.ready.notify_one();
        true
    }

    /// Block until a message arrives. Returns `None` once the mailbox is
    /// closed and drained, which is the service's shutdown signal.
    pub fn recv(&self) -> Option<M> {
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(message) = queue.messages.pop_front() {
                return Some(message);
            }
            if queue.closed {
                return None;
            }
            self.inner.ready.wait(&mut queue);
        }
    }

    /// Close the mailbox; pending messages are still delivered.
    pub fn close(&self) {
        let mut queue = self.inner.queue.lock();
        queue.closed = true;
        self.inner.ready.notify_all();
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().messages.len()
    }

    /// Whether no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum ReplyState<T> {
    Pending,
    Fulfilled(T),
    Abandoned,
}

struct ReplyCell<T> {
    state: Mutex<ReplyState<T>>,
    ready: Condvar,
}

/// The fulfilling half of a reply pair.
pub struct Promise<T> {
    cell: Arc<ReplyCell<T>>,
    fulfilled: bool,
}

/// The waiting half of a reply pair.
pub struct ReplyFuture<T> {
    cell: Arc<ReplyCell<T>>,
}

/// Create a linked promise/future pair.
pub fn promise<T>() -> (Promise<T>, ReplyFuture<T>) {
    let cell = Arc::new(ReplyCell {
        state: Mutex::new(ReplyState::Pending),
        ready: Condvar::new(),
    });
    (
        Promise {
            cell: Arc::clone(&cell),
            fulfilled: false,
        },
        ReplyFuture { cell },
    )
}

impl<T> Promise<T> {
    /// Deliver the reply and wake the waiter.
    pub fn fulfill(mut self, value: T) {
        *self.cell.state.lock() = ReplyState::Fulfilled(value);
        self.fulfilled = true;
        self.cell.ready.notify_all();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.fulfilled {
            let mut state = self.cell.state.lock();
            if matches!(*state, ReplyState::Pending) {
                *state = ReplyState::Abandoned;
                self.cell.ready.notify_all();
            }
        }
    }
}

impl<T> ReplyFuture<T> {
    /// Block until the promise is fulfilled. Returns `None` when the
    /// promise was dropped unfulfilled (the service died mid-request).
    pub fn wait(self) -> Option<T> {
        let mut state = self.cell.state.lock();
        loop {
            match std::mem::replace(&mut *state, ReplyState::Pending) {
                ReplyState::Fulfilled(value) => return Some(value),
                ReplyState::Abandoned => return None,
                ReplyState::Pending => self.cell.ready.wait(&mut state),
            }
        }
    }
}
