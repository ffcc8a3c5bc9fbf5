use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender};

struct QueueState<T> {
    items: VecDeque<T>,
    /// How many entries at the head came in through `add_first`.
    front: usize,
    closed: bool,
}

/// Mutex-guarded double-ended queue with an advisory wake channel.
///
/// Producers never block on the wake channel: when it is full the
/// notification is dropped, and the consumer re-checks [`CallQueue::len`]
/// after every wake anyway.
pub struct CallQueue<T> {
    state: Mutex<QueueState<T>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl<T> CallQueue<T> {
    pub fn new(wake_capacity: usize) -> Self {
        let (wake_tx, wake_rx) = bounded(wake_capacity.max(1));
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                front: 0,
                closed: false,
            }),
            wake_tx,
            wake_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the tail. A closed queue hands the item back.
    pub fn add_last(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.notify();
        Ok(())
    }

    /// Insert ahead of every tail insert still queued, behind earlier head
    /// inserts. A closed queue hands the item back.
    pub fn add_first(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(item);
            }
            let at = state.front;
            state.items.insert(at, item);
            state.front += 1;
        }
        self.notify();
        Ok(())
    }

    pub fn pop_first(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        state.front = state.front.saturating_sub(1);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further inserts and hand back everything still queued.
    pub fn close(&self) -> Vec<T> {
        let mut state = self.lock();
        state.closed = true;
        state.front = 0;
        state.items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn wake_signal(&self) -> &Receiver<()> {
        &self.wake_rx
    }

    /// Nudge the consumer without inserting anything.
    pub fn notify(&self) {
        let _ = self.wake_tx.try_send(());
    }
}
