//! Single-use result slot shared by the scheduler and the IPC bridge.
//!
//! A [`Resolver`] is consumed by [`Resolver::resolve`], so a slot can only
//! ever be filled once. Dropping the resolver unfilled marks the slot
//! abandoned and wakes the waiter.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("completion abandoned before it was resolved")]
pub struct Abandoned;

enum SlotState<T> {
    Empty,
    Ready(T),
    Abandoned,
    Taken,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
    notify: Notify,
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fill(&self, next: SlotState<T>) -> bool {
        {
            let mut state = self.lock();
            if !matches!(*state, SlotState::Empty) {
                return false;
            }
            *state = next;
        }
        self.ready.notify_all();
        self.notify.notify_one();
        true
    }
}

fn take<T>(state: &mut SlotState<T>) -> Option<Result<T, Abandoned>> {
    match std::mem::replace(state, SlotState::Taken) {
        SlotState::Ready(value) => Some(Ok(value)),
        SlotState::Empty => {
            *state = SlotState::Empty;
            None
        }
        SlotState::Abandoned | SlotState::Taken => Some(Err(Abandoned)),
    }
}

/// Create a connected resolver/waiter pair.
pub fn completion<T>() -> (Resolver<T>, Pending<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState::Empty),
        ready: Condvar::new(),
        notify: Notify::new(),
    });
    (
        Resolver {
            slot: Arc::clone(&slot),
        },
        Pending { slot },
    )
}

/// Producer half. Exactly one value can ever be delivered through it.
pub struct Resolver<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Resolver<T> {
    /// Returns `false` if the slot was already filled.
    pub fn resolve(self, value: T) -> bool {
        self.slot.fill(SlotState::Ready(value))
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        let _ = self.slot.fill(SlotState::Abandoned);
    }
}

/// Consumer half.
pub struct Pending<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Pending<T> {
    /// Block the calling thread until the slot is resolved.
    pub fn wait(self) -> Result<T, Abandoned> {
        let mut state = self.slot.lock();
        loop {
            if let Some(result) = take(&mut state) {
                return result;
            }
            state = self
                .slot
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`. `None` means the time ran out first.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Abandoned>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.lock();
        loop {
            if let Some(result) = take(&mut state) {
                return Some(result);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .slot
                .ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn try_take(&self) -> Option<Result<T, Abandoned>> {
        take(&mut self.slot.lock())
    }

    pub async fn wait_async(&self) -> Result<T, Abandoned> {
        loop {
            let notified = self.slot.notify.notified();
            if let Some(result) = self.try_take() {
                return result;
            }
            notified.await;
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.slot.lock(), SlotState::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolves_across_threads() {
        let (resolver, pending) = completion();
        let worker = thread::spawn(move || resolver.resolve(7));
        assert_eq!(pending.wait(), Ok(7));
        worker.join().unwrap();
    }

    #[test]
    fn dropped_resolver_abandons() {
        let (resolver, pending) = completion::<u32>();
        drop(resolver);
        assert!(pending.is_resolved());
        assert_eq!(pending.wait(), Err(Abandoned));
    }

    #[test]
    fn wait_timeout_reports_elapsed_then_value() {
        let (resolver, pending) = completion();
        assert!(pending.wait_timeout(Duration::from_millis(20)).is_none());
        resolver.resolve("late");
        assert_eq!(
            pending.wait_timeout(Duration::from_millis(20)),
            Some(Ok("late"))
        );
        assert_eq!(pending.try_take(), Some(Err(Abandoned)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_wait_sees_resolution_from_blocking_thread() {
        let (resolver, pending) = completion();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            resolver.resolve(String::from("done"));
        });
        assert_eq!(pending.wait_async().await.as_deref(), Ok("done"));
    }
}
