use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use super::events::{FrameHandle, LoadRequest, Subscription, ViewEvents};
use super::HostError;
use crate::engine::{read_c_str, EngineHandle, IntoWord, NativeStr, Word};
use crate::ipc::IpcBridge;
use crate::registry::WindowHandle;
use crate::scheduler::Scheduler;

/// Engine window flavours accepted by `wkeCreateWebWindow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Popup,
    Transparent,
    /// Embedded inside a parent view's window.
    Control,
}

impl WindowType {
    pub(crate) fn word(self) -> Word {
        match self {
            WindowType::Popup => 0,
            WindowType::Transparent => 1,
            WindowType::Control => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Default for Rect {
    fn default() -> Self {
        Self {
            x: 200,
            y: 200,
            width: 800,
            height: 600,
        }
    }
}

struct ViewState {
    handle: EngineHandle,
    parent: Option<EngineHandle>,
    kind: WindowType,
    scheduler: Scheduler,
    bridge: IpcBridge,
    events: ViewEvents,
    destroyed: watch::Sender<bool>,
}

/// Host-side wrapper around one engine web view.
#[derive(Clone)]
pub struct View {
    state: Arc<ViewState>,
}

impl View {
    pub(crate) fn new(
        handle: EngineHandle,
        parent: Option<EngineHandle>,
        kind: WindowType,
        scheduler: Scheduler,
        bridge: IpcBridge,
    ) -> Self {
        let (destroyed, _) = watch::channel(false);
        Self {
            state: Arc::new(ViewState {
                handle,
                parent,
                kind,
                scheduler,
                bridge,
                events: ViewEvents::new(),
                destroyed,
            }),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.state.handle
    }

    pub fn parent(&self) -> Option<EngineHandle> {
        self.state.parent
    }

    pub fn kind(&self) -> WindowType {
        self.state.kind
    }

    fn call(&self, name: &str, rest: &[Word]) -> Result<Word, HostError> {
        let mut args = Vec::with_capacity(rest.len() + 1);
        args.push(self.state.handle);
        args.extend_from_slice(rest);
        Ok(self.state.scheduler.call(name, &args)?.0)
    }

    pub fn load_url(&self, url: &str) -> Result<(), HostError> {
        let url = NativeStr::new(url)?;
        self.call("wkeLoadURL", &[url.word()])?;
        Ok(())
    }

    pub fn url(&self) -> Result<String, HostError> {
        let raw = self.call("wkeGetURL", &[])?;
        // SAFETY: the engine returns null or a NUL-terminated buffer it owns
        // until the next call on this view, and we copy it immediately.
        Ok(unsafe { read_c_str(raw) }.unwrap_or_default())
    }

    pub fn reload(&self) -> Result<bool, HostError> {
        Ok(self.call("wkeReload", &[])? != 0)
    }

    pub fn resize(&self, width: i32, height: i32) -> Result<(), HostError> {
        self.call("wkeResize", &[width.into_word(), height.into_word()])?;
        Ok(())
    }

    /// Evaluate `script` in the main frame, waiting until it has run.
    pub fn run_js(&self, script: &str) -> Result<(), HostError> {
        let script = NativeStr::new(script)?;
        self.call("wkeRunJS", &[script.word()])?;
        Ok(())
    }

    pub fn show(&self) -> Result<(), HostError> {
        self.call("wkeShowWindow", &[true.into_word()])?;
        Ok(())
    }

    pub fn hide(&self) -> Result<(), HostError> {
        self.call("wkeShowWindow", &[false.into_word()])?;
        Ok(())
    }

    /// Ask the engine to destroy the view. Registry cleanup happens when
    /// the engine reports the destruction back.
    pub fn destroy(&self) -> Result<(), HostError> {
        self.call("wkeDestroyWebWindow", &[])?;
        Ok(())
    }

    pub fn is_document_ready(&self) -> Result<bool, HostError> {
        Ok(self.call("wkeIsDocumentReady", &[])? != 0)
    }

    pub fn window_handle(&self) -> Result<WindowHandle, HostError> {
        self.call("wkeGetWindowHandle", &[])
    }

    /// Call a global script function of this page and await its value.
    pub async fn call_js_func(&self, name: &str, args: Vec<Value>) -> Result<Value, HostError> {
        Ok(self
            .state
            .bridge
            .call_js_func(self.state.handle, name, args)
            .await?)
    }

    pub fn is_destroyed(&self) -> bool {
        *self.state.destroyed.borrow()
    }

    /// Resolves once the engine has destroyed this view.
    pub async fn wait_destroyed(&self) {
        let mut destroyed = self.state.destroyed.subscribe();
        // The sender lives in `self`, so this only ends on a `true` value.
        let _ = destroyed.wait_for(|done| *done).await;
    }

    /// Called for every request the page starts. Callbacks run in
    /// registration order; the first to return `true` answers the request
    /// and the rest are skipped.
    pub fn on_load_url_begin<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LoadRequest) -> bool + Send + Sync + 'static,
    {
        self.state.events.load_url_begin.add(Arc::new(callback))
    }

    pub fn on_document_ready<F>(&self, callback: F) -> Subscription
    where
        F: Fn(FrameHandle) + Send + Sync + 'static,
    {
        self.state.events.document_ready.add(Arc::new(callback))
    }

    pub fn on_title_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.state.events.title_changed.add(Arc::new(callback))
    }

    /// Any callback returning `false` keeps the window open.
    pub fn on_closing<F>(&self, callback: F) -> Subscription
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.state.events.closing.add(Arc::new(callback))
    }

    pub fn on_destroy<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.events.destroy.add(Arc::new(callback))
    }

    pub fn is_main_frame(&self, frame: FrameHandle) -> Result<bool, HostError> {
        Ok(self.call("wkeIsMainFrame", &[frame])? != 0)
    }

    pub(crate) fn dispatch_load_url_begin(&self, request: &LoadRequest) -> bool {
        self.state
            .events
            .load_url_begin
            .snapshot()
            .iter()
            .any(|callback| callback(request))
    }

    pub(crate) fn dispatch_document_ready(&self, frame: FrameHandle) {
        for callback in self.state.events.document_ready.snapshot() {
            callback(frame);
        }
    }

    pub(crate) fn dispatch_title_changed(&self, title: &str) {
        for callback in self.state.events.title_changed.snapshot() {
            callback(title);
        }
    }

    pub(crate) fn dispatch_closing(&self) -> bool {
        self.state
            .events
            .closing
            .snapshot()
            .iter()
            .all(|callback| callback())
    }

    /// Flip the destroyed signal. Destroy callbacks run on the first call only.
    pub(crate) fn mark_destroyed(&self) {
        if self.state.destroyed.send_replace(true) {
            return;
        }
        for callback in self.state.events.destroy.snapshot() {
            callback();
        }
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("handle", &self.state.handle)
            .field("parent", &self.state.parent)
            .field("kind", &self.state.kind)
            .finish()
    }
}

/// Native window hosting a view.
#[derive(Debug, Clone)]
pub struct Window {
    handle: WindowHandle,
    view: View,
}

impl Window {
    pub(crate) fn new(handle: WindowHandle, view: View) -> Self {
        Self { handle, view }
    }

    pub fn handle(&self) -> WindowHandle {
        self.handle
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn show(&self) -> Result<(), HostError> {
        self.view.show()
    }

    pub fn hide(&self) -> Result<(), HostError> {
        self.view.hide()
    }

    pub fn destroy(&self) -> Result<(), HostError> {
        self.view.destroy()
    }
}
