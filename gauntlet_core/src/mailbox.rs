//! Listener registry with pre-listener buffering.
//!
//! Messages delivered before anyone listens are queued FIFO. The first
//! listener to attach receives the whole queue, in order, before any later
//! message; from then on messages go straight to the attached listeners.
//! A listener is the sending half of an unbounded channel, so delivery
//! never blocks and never re-enters the mailbox.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Identifies an attached listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receiving side handed to a listener.
#[derive(Debug)]
pub struct Subscription<M> {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Waits for the next message. `None` once the mailbox is closed.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    /// Returns an already-delivered message without waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }
}

struct MailboxInner<M> {
    queue: VecDeque<M>,
    listeners: Vec<(ListenerId, mpsc::UnboundedSender<M>)>,
    /// Set once the first listener has taken the queue
    flushed: bool,
    closed: bool,
    next_id: u64,
}

/// Shared, cloneable mailbox.
pub struct Mailbox<M> {
    inner: Arc<Mutex<MailboxInner<M>>>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Clone + Send + 'static> Mailbox<M> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MailboxInner {
                queue: VecDeque::new(),
                listeners: Vec::new(),
                flushed: false,
                closed: false,
                next_id: 0,
            })),
        }
    }

    /// Delivers a message, or queues it if no listener has attached yet.
    ///
    /// Returns `false` if the mailbox is closed and the message was dropped.
    pub fn deliver(&self, msg: M) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        if !inner.flushed {
            inner.queue.push_back(msg);
            return true;
        }
        // Listeners whose receiver is gone are pruned on the way.
        inner.listeners.retain(|(_, tx)| tx.send(msg.clone()).is_ok());
        true
    }

    /// Attaches a listener. The first one receives the buffered queue.
    pub fn add_listener(&self) -> Subscription<M> {
        let mut inner = self.inner.lock().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;

        if !inner.flushed {
            inner.flushed = true;
            while let Some(msg) = inner.queue.pop_front() {
                let _ = tx.send(msg);
            }
        }
        if !inner.closed {
            inner.listeners.push((id, tx));
        }
        Subscription { id, rx }
    }

    /// Detaches a listener. Returns `false` if it was not attached.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Drops all listeners (their `recv` returns `None`) and refuses
    /// further deliveries.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.listeners.clear();
    }

    /// Number of messages waiting for the first listener.
    pub fn queued(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().unwrap().listeners.len()
    }
}

impl<M: Clone + Send + 'static> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}
