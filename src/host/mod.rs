//! Application-facing facade over the engine.

mod callbacks;
mod events;
mod resource;
mod script;
mod view;

use std::ffi::NulError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

pub use events::{FrameHandle, LoadRequest, Subscription};
pub use resource::{Resource, ResourceLoader};
pub use view::{Rect, View, Window, WindowType};

use crate::config::{Config, ConfigError};
use crate::engine::{
    read_c_str, EngineHandle, GatewayError, IntoWord, LibraryGateway, NativeGateway, NativeStr,
    WideStr, Word, Words,
};
use crate::ipc::{self, Handler, IpcBridge, IpcError};
use crate::registry::{ViewRegistry, WindowHandle};
use crate::scheduler::{CallHandle, JobHandle, Scheduler, SchedulerError, SchedulerOptions};

use self::callbacks::{
    closing_callback_word, destroy_callback_word, document_ready_callback_word,
    load_url_begin_callback_word, native_function_word, script_context_callback_word,
    title_changed_callback_word,
};
use self::script::EngineScriptHost;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("string passed to the engine contains a NUL byte: {0}")]
    InteriorNul(#[from] NulError),
    #[error("engine could not create a {0:?} window")]
    CreateWindow(WindowType),
    #[error("the host must be created inside a tokio runtime")]
    NoRuntime,
    #[error("invalid resource domain {0:?}")]
    InvalidDomain(String),
}

pub(crate) struct HostInner {
    config: Config,
    scheduler: Scheduler,
    registry: Arc<ViewRegistry<View, Window>>,
    bridge: IpcBridge,
    resources: Arc<ResourceLoader>,
    boot_scripts: Mutex<Vec<String>>,
    /// Strong self-reference handed to the engine as callback parameter.
    anchor: Mutex<Option<Word>>,
}

impl HostInner {
    fn param(&self) -> Word {
        self as *const HostInner as Word
    }

    fn boot_scripts(&self) -> MutexGuard<'_, Vec<String>> {
        self.boot_scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bind_function(&self, name: &str, function: callbacks::NativeFunction) -> Result<(), HostError> {
        let name = NativeStr::new(name)?;
        self.scheduler.call(
            "wkeJsBindFunction",
            &[name.word(), native_function_word(function), self.param(), 1],
        )?;
        Ok(())
    }

    fn initialize(&self) -> Result<(), HostError> {
        if self.scheduler.call("wkeIsInitialize", &[])?.0 == 0 {
            self.scheduler.call("wkeInitialize", &[])?;
        }
        self.bind_function(ipc::JS_TO_HOST, callbacks::js_to_host)?;
        self.bind_function(ipc::REGISTER_HANDLER, callbacks::register_handler)?;
        Ok(())
    }

    fn create_window(
        &self,
        kind: WindowType,
        parent: Option<EngineHandle>,
        rect: Rect,
    ) -> Result<View, HostError> {
        let (handle, _) = self.scheduler.call(
            "wkeCreateWebWindow",
            &[
                kind.word(),
                parent.unwrap_or(0),
                rect.x.into_word(),
                rect.y.into_word(),
                rect.width.into_word(),
                rect.height.into_word(),
            ],
        )?;
        if handle == 0 {
            return Err(HostError::CreateWindow(kind));
        }

        let view = View::new(
            handle,
            parent,
            kind,
            self.scheduler.clone(),
            self.bridge.clone(),
        );
        self.registry.register_view(handle, view.clone(), parent);
        let window = view.window_handle()?;
        self.registry
            .register_window(window, handle, Window::new(window, view.clone()));

        let param = self.param();
        self.scheduler.call(
            "wkeOnWindowDestroy",
            &[handle, destroy_callback_word(callbacks::on_window_destroy), param],
        )?;
        self.scheduler.call(
            "wkeOnDidCreateScriptContext",
            &[
                handle,
                script_context_callback_word(callbacks::on_script_context),
                param,
            ],
        )?;
        self.scheduler.call(
            "wkeOnLoadUrlBegin",
            &[
                handle,
                load_url_begin_callback_word(callbacks::on_load_url_begin),
                param,
            ],
        )?;
        self.scheduler.call(
            "wkeOnDocumentReady2",
            &[
                handle,
                document_ready_callback_word(callbacks::on_document_ready),
                param,
            ],
        )?;
        self.scheduler.call(
            "wkeOnTitleChanged",
            &[
                handle,
                title_changed_callback_word(callbacks::on_title_changed),
                param,
            ],
        )?;
        self.scheduler.call(
            "wkeOnWindowClosing",
            &[handle, closing_callback_word(callbacks::on_window_closing), param],
        )?;
        self.serve_local_files(&view);

        let storage = WideStr::new(&self.config.storage_dir().to_string_lossy());
        self.scheduler
            .call("wkeSetLocalStorageFullPath", &[handle, storage.word()])?;
        let cookies = WideStr::new(&self.config.cookie_path().to_string_lossy());
        self.scheduler
            .call("wkeSetCookieJarFullPath", &[handle, cookies.word()])?;

        debug!(target: "host", handle, window, ?kind, "window created");
        Ok(view)
    }

    fn script_argument(&self, es: Word) -> Result<Option<String>, HostError> {
        let (value, _) = self.scheduler.call("jsArg", &[es, 0])?;
        let (text, _) = self.scheduler.call("jsToTempString", &[es, value])?;
        // SAFETY: the temporary string stays valid until the next script
        // call on this exec state; it is copied before returning.
        Ok(unsafe { read_c_str(text) })
    }

    fn relay_script_message(&self, es: Word) {
        match self.script_argument(es) {
            Ok(Some(payload)) => self.bridge.on_script_message(es, &payload),
            Ok(None) => debug!(target: "host", "script relay called without a message"),
            Err(err) => error!(target: "host", error = %err, "failed to read script message"),
        }
    }

    fn relay_handler_registration(&self, es: Word) {
        match self.script_argument(es) {
            Ok(Some(channel)) => self.bridge.on_register_handler(es, &channel),
            Ok(None) => debug!(target: "host", "handler registration without a channel"),
            Err(err) => error!(target: "host", error = %err, "failed to read channel name"),
        }
    }

    /// Engine-reported destruction: drop the view and its subtree, then ask
    /// the engine to destroy the orphaned children too.
    fn view_destroyed(&self, handle: EngineHandle) {
        let removed = self.registry.unregister(handle);
        if removed.is_empty() {
            debug!(target: "host", handle, "destroy reported for unknown view");
            return;
        }
        for (view_handle, view) in &removed.views {
            self.bridge.forget_view(*view_handle);
            view.mark_destroyed();
        }
        for (child, _) in removed.children() {
            if let Err(err) = self.scheduler.call("wkeDestroyWebWindow", &[*child]) {
                warn!(target: "host", child, error = %err, "failed to destroy child view");
            }
        }
    }

    fn inject_boot_scripts(&self, view: EngineHandle) {
        if !self.registry.contains(view) {
            return;
        }
        let script = self.boot_scripts().join(";\n");
        let result = NativeStr::new(&script)
            .map_err(HostError::from)
            .and_then(|script| {
                self.scheduler
                    .call("wkeRunJS", &[view, script.word()])
                    .map_err(HostError::from)
            });
        if let Err(err) = result {
            error!(target: "host", view, error = %err, "boot script injection failed");
        }
    }

    /// Answer requests for bound domains from disk before anything else
    /// sees them.
    fn serve_local_files(&self, view: &View) {
        let resources = Arc::clone(&self.resources);
        view.on_load_url_begin(move |request| {
            let Some(resource) = resources.load(request.url()) else {
                return false;
            };
            match request.respond(&resource) {
                Ok(()) => true,
                Err(err) => {
                    warn!(target: "resource", url = %request.url(), error = %err, "failed to hand resource to engine");
                    false
                }
            }
        });
    }

    fn load_url_begin(&self, handle: EngineHandle, url: Word, job: Word) -> bool {
        let Some(view) = self.registry.view(handle) else {
            return false;
        };
        // SAFETY: the engine passes a NUL-terminated URL valid for this call.
        let Some(url) = (unsafe { read_c_str(url) }) else {
            return false;
        };
        let request = LoadRequest::new(handle, url, job, self.scheduler.clone());
        view.dispatch_load_url_begin(&request)
    }

    fn document_ready(&self, handle: EngineHandle, frame: FrameHandle) {
        if let Some(view) = self.registry.view(handle) {
            view.dispatch_document_ready(frame);
        }
    }

    fn title_changed(&self, handle: EngineHandle, title: Word) {
        let Some(view) = self.registry.view(handle) else {
            return;
        };
        let text = match self.scheduler.call("wkeGetString", &[title]) {
            // SAFETY: `wkeGetString` returns a NUL-terminated buffer owned by
            // the engine string, copied before this callback returns.
            Ok((raw, _)) => unsafe { read_c_str(raw) }.unwrap_or_default(),
            Err(err) => {
                warn!(target: "host", handle, error = %err, "failed to read title");
                return;
            }
        };
        view.dispatch_title_changed(&text);
    }

    /// Whether the engine may close the view's window.
    fn window_closing(&self, handle: EngineHandle) -> bool {
        match self.registry.view(handle) {
            Some(view) => view.dispatch_closing(),
            None => true,
        }
    }
}

/// Handle to a running engine: scheduler, IPC bridge, registry and
/// resource bindings. Cheap to clone.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Load the engine library named by `config` and start it.
    pub fn launch(config: Config) -> Result<Self, HostError> {
        config.ensure_temp_dir()?;
        let gateway = LibraryGateway::load(config.library_path())?;
        info!(target: "host", path = %gateway.path().display(), "engine library loaded");
        let host = Self::with_gateway(config, Arc::new(gateway))?;

        let scheduler = host.inner.scheduler.clone();
        host.add_loop(move || {
            if let Err(err) = scheduler.call("wkeUpdate", &[]) {
                debug!(target: "host", error = %err, "engine update failed");
            }
        });
        Ok(host)
    }

    /// Start a host over any gateway. Must run inside a tokio runtime.
    pub fn with_gateway(config: Config, gateway: Arc<dyn NativeGateway>) -> Result<Self, HostError> {
        config.validate()?;
        config.ensure_temp_dir()?;
        let runtime = Handle::try_current().map_err(|_| HostError::NoRuntime)?;

        let scheduler = Scheduler::new(gateway, SchedulerOptions::from(&config));
        scheduler.spawn()?;

        let registry = Arc::new(ViewRegistry::new());
        let scripts = Arc::new(EngineScriptHost::new(
            scheduler.clone(),
            Arc::downgrade(&registry),
        ));
        let bridge = match IpcBridge::new(scripts, runtime, config.ipc_timeout()) {
            Ok(bridge) => bridge,
            Err(err) => {
                scheduler.shutdown();
                scheduler.join();
                return Err(err.into());
            }
        };
        let boot = ipc::boot_script(config.ipc_timeout());

        let host = Self {
            inner: Arc::new(HostInner {
                config,
                scheduler,
                registry,
                bridge,
                resources: Arc::new(ResourceLoader::new()),
                boot_scripts: Mutex::new(vec![boot]),
                anchor: Mutex::new(None),
            }),
        };
        *host.anchor() = Some(Arc::into_raw(Arc::clone(&host.inner)) as Word);

        if let Err(err) = host.on_engine_thread(|inner| inner.initialize()) {
            host.shutdown();
            return Err(err);
        }
        info!(target: "host", "engine initialized");
        Ok(host)
    }

    fn anchor(&self) -> MutexGuard<'_, Option<Word>> {
        self.inner
            .anchor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `task` on the bound thread as one uninterrupted unit.
    fn on_engine_thread<T, F>(&self, task: F) -> Result<T, HostError>
    where
        T: Send + 'static,
        F: FnOnce(&HostInner) -> Result<T, HostError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.scheduler.run_blocking(move || task(&*inner))?
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn ipc(&self) -> &IpcBridge {
        &self.inner.bridge
    }

    pub fn resources(&self) -> &ResourceLoader {
        &self.inner.resources
    }

    pub fn call_func(&self, name: &str, args: &[Word]) -> Result<Words, HostError> {
        Ok(self.inner.scheduler.call(name, args)?)
    }

    pub fn call_func_async(&self, name: &str, args: &[Word]) -> CallHandle {
        self.inner.scheduler.call_async(name, args)
    }

    /// Like [`Host::call_func`], ahead of everything already queued.
    pub fn call_func_first(&self, name: &str, args: &[Word]) -> Result<Words, HostError> {
        Ok(self.inner.scheduler.call_priority(name, args)?)
    }

    pub fn add_job<F>(&self, job: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.scheduler.add_job(job)
    }

    pub fn add_loop<F>(&self, task: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.scheduler.add_loop(task)
    }

    pub fn handle<H, Params>(&self, channel: impl Into<String>, handler: H)
    where
        H: Handler<Params>,
    {
        self.inner.bridge.handle(channel, handler)
    }

    pub async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, HostError> {
        Ok(self.inner.bridge.invoke(channel, args).await?)
    }

    pub fn send(&self, channel: &str, args: Vec<Value>) -> Result<(), HostError> {
        Ok(self.inner.bridge.send(channel, args)?)
    }

    /// Script run in every new script context, after the built-in ones.
    pub fn add_boot_script(&self, script: impl Into<String>) {
        self.inner.boot_scripts().push(script.into());
    }

    pub fn version(&self) -> Result<u32, HostError> {
        Ok(self.inner.scheduler.call("wkeVersion", &[])?.0 as u32)
    }

    pub fn version_string(&self) -> Result<String, HostError> {
        let (raw, _) = self.inner.scheduler.call("wkeVersionString", &[])?;
        // SAFETY: the engine returns a static NUL-terminated string or null.
        Ok(unsafe { read_c_str(raw) }.unwrap_or_default())
    }

    pub fn create_popup_window(&self, rect: Rect) -> Result<View, HostError> {
        self.on_engine_thread(move |inner| inner.create_window(WindowType::Popup, None, rect))
    }

    pub fn create_transparent_window(&self, rect: Rect) -> Result<View, HostError> {
        self.on_engine_thread(move |inner| inner.create_window(WindowType::Transparent, None, rect))
    }

    pub fn create_control_window(&self, parent: &View, rect: Rect) -> Result<View, HostError> {
        let parent = parent.handle();
        self.on_engine_thread(move |inner| {
            inner.create_window(WindowType::Control, Some(parent), rect)
        })
    }

    pub fn view(&self, handle: EngineHandle) -> Option<View> {
        self.inner.registry.view(handle)
    }

    pub fn window(&self, handle: WindowHandle) -> Option<Window> {
        self.inner.registry.window(handle)
    }

    pub fn view_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Apply an engine-reported destruction of `handle`. The engine's
    /// destroy callback lands here.
    pub fn view_destroyed(&self, handle: EngineHandle) {
        let result = self.on_engine_thread(move |inner| {
            inner.view_destroyed(handle);
            Ok(())
        });
        if let Err(err) = result {
            debug!(target: "host", handle, error = %err, "destroy not applied");
        }
    }

    /// Finalize the engine and stop the bound thread. Queued calls fail
    /// with [`SchedulerError::ShutDown`].
    pub fn shutdown(&self) {
        let scheduler = &self.inner.scheduler;
        if scheduler.is_shut_down() {
            return;
        }
        if let Err(err) = scheduler.call("wkeFinalize", &[]) {
            warn!(target: "host", error = %err, "engine finalize failed");
        }
        scheduler.shutdown();
        scheduler.join();

        for handle in self.inner.registry.handles() {
            if let Some(view) = self.inner.registry.view(handle) {
                view.mark_destroyed();
            }
        }

        if let Some(anchor) = self.anchor().take() {
            // SAFETY: produced by `Arc::into_raw` in `with_gateway` and
            // taken exactly once; the engine is finalized so no callback
            // can observe it any more.
            drop(unsafe { Arc::from_raw(anchor as *const HostInner) });
        }
        info!(target: "host", "host shut down");
    }
}
