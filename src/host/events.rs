//! Per-view engine event subscriptions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{HostError, Resource};
use crate::engine::{EngineHandle, NativeStr, Word};
use crate::scheduler::Scheduler;

/// Frame identifier passed with document-ready notifications.
pub type FrameHandle = usize;

pub(crate) type LoadUrlBeginListener = dyn Fn(&LoadRequest) -> bool + Send + Sync;
pub(crate) type DocumentReadyListener = dyn Fn(FrameHandle) + Send + Sync;
pub(crate) type TitleChangedListener = dyn Fn(&str) + Send + Sync;
pub(crate) type ClosingListener = dyn Fn() -> bool + Send + Sync;
pub(crate) type DestroyListener = dyn Fn() + Send + Sync;

/// Callbacks in registration order, each removable through its
/// [`Subscription`].
pub(crate) struct Listeners<F: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Arc<F>)>>,
}

impl<F: ?Sized + Send + Sync + 'static> Listeners<F> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Arc<F>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(self: &Arc<Self>, callback: Arc<F>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, callback));
        let list = Arc::downgrade(self);
        Subscription {
            stop: Some(Box::new(move || {
                if let Some(list) = list.upgrade() {
                    list.lock().retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Current callbacks. Dispatch runs on this copy so a callback may stop
    /// itself or subscribe others.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.lock().iter().map(|(_, callback)| Arc::clone(callback)).collect()
    }
}

/// Stop handle returned by the `View::on_*` methods. Dropping it keeps the
/// callback registered.
pub struct Subscription {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.stop.is_some())
            .finish()
    }
}

pub(crate) struct ViewEvents {
    pub(crate) load_url_begin: Arc<Listeners<LoadUrlBeginListener>>,
    pub(crate) document_ready: Arc<Listeners<DocumentReadyListener>>,
    pub(crate) title_changed: Arc<Listeners<TitleChangedListener>>,
    pub(crate) closing: Arc<Listeners<ClosingListener>>,
    pub(crate) destroy: Arc<Listeners<DestroyListener>>,
}

impl ViewEvents {
    pub(crate) fn new() -> Self {
        Self {
            load_url_begin: Listeners::new(),
            document_ready: Listeners::new(),
            title_changed: Listeners::new(),
            closing: Listeners::new(),
            destroy: Listeners::new(),
        }
    }
}

/// A request the engine is about to send. A `load_url_begin` callback that
/// answers it returns `true`, which also cancels the network load.
pub struct LoadRequest {
    view: EngineHandle,
    url: String,
    job: Word,
    scheduler: Scheduler,
}

impl LoadRequest {
    pub(crate) fn new(view: EngineHandle, url: String, job: Word, scheduler: Scheduler) -> Self {
        Self {
            view,
            url,
            job,
            scheduler,
        }
    }

    pub fn view(&self) -> EngineHandle {
        self.view
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The engine's net job handle, for direct `wkeNet*` calls.
    pub fn job(&self) -> Word {
        self.job
    }

    pub fn set_mime_type(&self, mime: &str) -> Result<(), HostError> {
        let mime = NativeStr::new(mime)?;
        self.scheduler
            .call("wkeNetSetMIMEType", &[self.job, mime.word()])?;
        Ok(())
    }

    /// Hand `data` to the engine as the response body. The engine copies it.
    pub fn set_data(&self, data: &[u8]) -> Result<(), HostError> {
        self.scheduler
            .call("wkeNetSetData", &[self.job, data.as_ptr() as Word, data.len()])?;
        Ok(())
    }

    pub fn respond(&self, resource: &Resource) -> Result<(), HostError> {
        self.set_mime_type(&resource.mime)?;
        self.set_data(&resource.data)?;
        debug!(target: "resource", view = self.view, url = %self.url, bytes = resource.data.len(), "request answered locally");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_run_in_order_until_stopped() {
        let list: Arc<Listeners<dyn Fn(&mut Vec<&'static str>) + Send + Sync>> = Listeners::new();
        let first = list.add(Arc::new(|seen: &mut Vec<&'static str>| seen.push("first")));
        let _second = list.add(Arc::new(|seen: &mut Vec<&'static str>| seen.push("second")));

        let mut seen = Vec::new();
        for callback in list.snapshot() {
            callback(&mut seen);
        }
        assert_eq!(seen, vec!["first", "second"]);

        first.stop();
        assert_eq!(list.snapshot().len(), 1);
        seen.clear();
        for callback in list.snapshot() {
            callback(&mut seen);
        }
        assert_eq!(seen, vec!["second"]);
    }

    #[test]
    fn stopping_after_the_list_is_gone_is_harmless() {
        let hits = Arc::new(AtomicUsize::new(0));
        let list: Arc<Listeners<DestroyListener>> = Listeners::new();
        let counter = Arc::clone(&hits);
        let subscription = list.add(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        for callback in list.snapshot() {
            callback();
        }
        drop(list);
        subscription.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
