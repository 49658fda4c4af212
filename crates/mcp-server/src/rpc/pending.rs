//! Correlation slots for in-flight backend requests.
//!
//! A slot is fulfilled at most once. Once settled (answered or cancelled) it leaves a tombstone
//! so a late or duplicate reply can be told apart from a reply for an id that never existed.

use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot};

const TOMBSTONE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Delivered,
    /// No slot was ever registered for the id.
    Unknown,
    /// The caller gave up (timeout or cancellation) before the reply arrived.
    Cancelled,
    /// The slot was already fulfilled; a second reply is a protocol violation.
    AlreadyFulfilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Fulfilled,
    Cancelled,
}

impl Settled {
    fn completion(self) -> Completion {
        match self {
            Self::Fulfilled => Completion::AlreadyFulfilled,
            Self::Cancelled => Completion::Cancelled,
        }
    }
}

#[derive(Default)]
struct Tombstones {
    order: VecDeque<u64>,
    states: HashMap<u64, Settled>,
}

impl Tombstones {
    fn bury(&mut self, id: u64, state: Settled) {
        if self.states.insert(id, state).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.states.remove(&old);
            }
        }
    }

    fn get(&self, id: u64) -> Option<Settled> {
        self.states.get(&id).copied()
    }
}

/// One-shot reply slots keyed by request id.
pub(crate) struct SlotMap<T> {
    waiting: HashMap<u64, oneshot::Sender<T>>,
    settled: Tombstones,
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self {
            waiting: HashMap::new(),
            settled: Tombstones::default(),
        }
    }
}

impl<T> SlotMap<T> {
    pub(crate) fn register(&mut self, id: u64) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        rx
    }

    pub(crate) fn complete(&mut self, id: u64, value: T) -> Completion {
        match self.waiting.remove(&id) {
            Some(tx) => {
                self.settled.bury(id, Settled::Fulfilled);
                // The receiver may have been dropped by a caller that lost interest;
                // the slot still counts as fulfilled.
                let _ = tx.send(value);
                Completion::Delivered
            }
            None => self
                .settled
                .get(id)
                .map_or(Completion::Unknown, Settled::completion),
        }
    }

    pub(crate) fn cancel(&mut self, id: u64) -> bool {
        if self.waiting.remove(&id).is_some() {
            self.settled.bury(id, Settled::Cancelled);
            true
        } else {
            false
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<oneshot::Sender<T>> {
        let ids: Vec<u64> = self.waiting.keys().copied().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tx) = self.waiting.remove(&id) {
                self.settled.bury(id, Settled::Cancelled);
                out.push(tx);
            }
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}

/// Streaming slots: any number of partial deliveries followed by exactly one terminal one.
pub(crate) struct StreamMap<T> {
    open: HashMap<u64, mpsc::UnboundedSender<T>>,
    settled: Tombstones,
}

impl<T> Default for StreamMap<T> {
    fn default() -> Self {
        Self {
            open: HashMap::new(),
            settled: Tombstones::default(),
        }
    }
}

impl<T> StreamMap<T> {
    pub(crate) fn register(&mut self, id: u64) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.open.insert(id, tx);
        rx
    }

    pub(crate) fn push(&mut self, id: u64, value: T) -> Completion {
        match self.open.get(&id) {
            Some(tx) => {
                let _ = tx.send(value);
                Completion::Delivered
            }
            None => self.lookup_settled(id),
        }
    }

    pub(crate) fn finish(&mut self, id: u64, value: T) -> Completion {
        match self.open.remove(&id) {
            Some(tx) => {
                self.settled.bury(id, Settled::Fulfilled);
                let _ = tx.send(value);
                Completion::Delivered
            }
            None => self.lookup_settled(id),
        }
    }

    pub(crate) fn cancel(&mut self, id: u64) -> bool {
        if self.open.remove(&id).is_some() {
            self.settled.bury(id, Settled::Cancelled);
            true
        } else {
            false
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<mpsc::UnboundedSender<T>> {
        let ids: Vec<u64> = self.open.keys().copied().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tx) = self.open.remove(&id) {
                self.settled.bury(id, Settled::Cancelled);
                out.push(tx);
            }
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.open.len()
    }

    fn lookup_settled(&self, id: u64) -> Completion {
        self.settled
            .get(id)
            .map_or(Completion::Unknown, Settled::completion)
    }
}
