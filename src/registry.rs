//! Handle-keyed lookup of host-side view and window wrappers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::engine::EngineHandle;

/// Native window handle, distinct from the view handle it belongs to.
pub type WindowHandle = usize;

struct ViewEntry<V> {
    view: V,
    parent: Option<EngineHandle>,
}

struct WindowEntry<W> {
    window: W,
    view: EngineHandle,
}

struct RegistryState<V, W> {
    views: HashMap<EngineHandle, ViewEntry<V>>,
    children: HashMap<EngineHandle, Vec<EngineHandle>>,
    windows: HashMap<WindowHandle, WindowEntry<W>>,
}

/// Everything removed by one [`ViewRegistry::unregister`].
pub struct Unregistered<V, W> {
    /// The target first, then its descendants depth-first.
    pub views: Vec<(EngineHandle, V)>,
    pub windows: Vec<(WindowHandle, W)>,
}

impl<V, W> Unregistered<V, W> {
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Descendants of the target that now need destroying.
    pub fn children(&self) -> &[(EngineHandle, V)] {
        self.views.get(1..).unwrap_or(&[])
    }
}

/// Registry of live views and windows.
///
/// Children are indexed by parent, so removing a view removes its whole
/// subtree without scanning unrelated entries.
pub struct ViewRegistry<V, W> {
    state: Mutex<RegistryState<V, W>>,
}

impl<V, W> Default for ViewRegistry<V, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, W> ViewRegistry<V, W> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                views: HashMap::new(),
                children: HashMap::new(),
                windows: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<V, W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false`, leaving the existing entry, if `handle` is taken.
    pub fn register_view(&self, handle: EngineHandle, view: V, parent: Option<EngineHandle>) -> bool {
        let mut state = self.lock();
        if state.views.contains_key(&handle) {
            debug!(target: "registry", handle, "view already registered");
            return false;
        }
        state.views.insert(handle, ViewEntry { view, parent });
        if let Some(parent) = parent {
            state.children.entry(parent).or_default().push(handle);
        }
        info!(target: "registry", handle, ?parent, views = state.views.len(), "view registered");
        true
    }

    pub fn register_window(&self, handle: WindowHandle, view: EngineHandle, window: W) -> bool {
        let mut state = self.lock();
        if state.windows.contains_key(&handle) {
            debug!(target: "registry", handle, "window already registered");
            return false;
        }
        state.windows.insert(handle, WindowEntry { window, view });
        true
    }

    pub fn contains(&self, handle: EngineHandle) -> bool {
        self.lock().views.contains_key(&handle)
    }

    pub fn parent_of(&self, handle: EngineHandle) -> Option<EngineHandle> {
        self.lock().views.get(&handle).and_then(|entry| entry.parent)
    }

    pub fn children_of(&self, handle: EngineHandle) -> Vec<EngineHandle> {
        self.lock().children.get(&handle).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `handle` and, recursively, every view whose parent is removed,
    /// together with their windows.
    pub fn unregister(&self, handle: EngineHandle) -> Unregistered<V, W> {
        let mut state = self.lock();
        let mut removed = Unregistered {
            views: Vec::new(),
            windows: Vec::new(),
        };

        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            let Some(entry) = state.views.remove(&current) else {
                continue;
            };
            if let Some(parent) = entry.parent {
                if let Some(siblings) = state.children.get_mut(&parent) {
                    siblings.retain(|child| *child != current);
                    if siblings.is_empty() {
                        state.children.remove(&parent);
                    }
                }
            }
            if let Some(children) = state.children.remove(&current) {
                stack.extend(children.into_iter().rev());
            }
            removed.views.push((current, entry.view));
        }

        if removed.is_empty() {
            return removed;
        }

        let owned: Vec<WindowHandle> = state
            .windows
            .iter()
            .filter(|(_, entry)| removed.views.iter().any(|(view, _)| *view == entry.view))
            .map(|(window, _)| *window)
            .collect();
        for window in owned {
            if let Some(entry) = state.windows.remove(&window) {
                removed.windows.push((window, entry.window));
            }
        }

        info!(
            target: "registry",
            handle,
            cascaded = removed.views.len() - 1,
            views = state.views.len(),
            "view unregistered"
        );
        removed
    }

    pub fn unregister_window(&self, handle: WindowHandle) -> Option<W> {
        self.lock().windows.remove(&handle).map(|entry| entry.window)
    }

    pub fn handles(&self) -> Vec<EngineHandle> {
        self.lock().views.keys().copied().collect()
    }
}

impl<V: Clone, W> ViewRegistry<V, W> {
    pub fn view(&self, handle: EngineHandle) -> Option<V> {
        self.lock().views.get(&handle).map(|entry| entry.view.clone())
    }
}

impl<V, W: Clone> ViewRegistry<V, W> {
    pub fn window(&self, handle: WindowHandle) -> Option<W> {
        self.lock().windows.get(&handle).map(|entry| entry.window.clone())
    }

    pub fn window_of(&self, view: EngineHandle) -> Option<(WindowHandle, W)> {
        self.lock()
            .windows
            .iter()
            .find(|(_, entry)| entry.view == view)
            .map(|(handle, entry)| (*handle, entry.window.clone()))
    }
}
