use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{Handler, HostFn, Route};
use super::message::IpcMessage;
use super::{IpcError, ScriptContext, ScriptHost, CALL_JS_FUNC};
use crate::completion::{completion, Pending, Resolver};
use crate::engine::{panic_message, EngineHandle};

type Outcome = Result<Value, IpcError>;

struct Inner {
    routes: Mutex<HashMap<String, Route>>,
    pending: Mutex<HashMap<String, Resolver<Outcome>>>,
    scripts: Arc<dyn ScriptHost>,
    runtime: Handle,
    timeout: Duration,
}

impl Inner {
    fn routes(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Resolver<Outcome>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a correlation entry when its waiter goes away, whatever the
/// reason (reply, timeout, or the invoking future being dropped).
struct PendingEntry<'a> {
    inner: &'a Inner,
    id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(self.id);
    }
}

/// Bidirectional channel registry and correlation table.
///
/// Host-registered channels run on the runtime's blocking pool. Channels a
/// page registered are proxied: invoking one posts a request into that
/// page and waits for the matching reply, bounded by a timeout.
#[derive(Clone)]
pub struct IpcBridge {
    inner: Arc<Inner>,
}

impl IpcBridge {
    pub fn new(
        scripts: Arc<dyn ScriptHost>,
        runtime: Handle,
        timeout: Duration,
    ) -> Result<Self, IpcError> {
        if timeout.is_zero() {
            return Err(IpcError::ZeroTimeout);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                routes: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                scripts,
                runtime,
                timeout,
            }),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Register a host handler, replacing any previous route for `channel`.
    pub fn handle<H, Params>(&self, channel: impl Into<String>, handler: H)
    where
        H: Handler<Params>,
    {
        let channel = channel.into();
        debug!(target: "ipc", %channel, "host handler registered");
        self.inner.routes().insert(channel, Route::host(handler));
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.inner.routes().contains_key(channel)
    }

    /// Correlation entries still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    pub async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, IpcError> {
        self.invoke_with_timeout(channel, args, self.inner.timeout)
            .await
    }

    /// Like [`IpcBridge::invoke`] with an explicit bound on page round trips.
    pub async fn invoke_with_timeout(
        &self,
        channel: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, IpcError> {
        if timeout.is_zero() {
            return Err(IpcError::ZeroTimeout);
        }
        match self.route(channel)? {
            Route::Host(call) => self.run_host(channel, call, args).await,
            Route::Script(view) => self.round_trip(view, channel, args, timeout).await,
        }
    }

    /// Fire-and-forget. Only the lookup can fail; handler errors are logged.
    pub fn send(&self, channel: &str, args: Vec<Value>) -> Result<(), IpcError> {
        match self.route(channel)? {
            Route::Host(call) => {
                let channel = channel.to_string();
                self.inner.runtime.spawn_blocking(move || {
                    if let Err(err) = run_guarded(&channel, &call, args) {
                        error!(target: "ipc", %channel, error = %err, "handler failed");
                    }
                });
                Ok(())
            }
            Route::Script(view) => self.post(view, &IpcMessage::notification(channel, args)),
        }
    }

    /// Call the global script function `name` in `view` and await its value.
    pub async fn call_js_func(
        &self,
        view: EngineHandle,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, IpcError> {
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(Value::from(name));
        call_args.extend(args);
        self.round_trip(view, CALL_JS_FUNC, call_args, self.inner.timeout)
            .await
    }

    /// Entry point for the page's `JS_TO_HOST` relay.
    pub fn on_script_message(&self, context: ScriptContext, payload: &str) {
        let message = match IpcMessage::parse(payload) {
            Ok(message) => message,
            Err(err) => {
                error!(target: "ipc", error = %err, %payload, "unparsable script message");
                return;
            }
        };
        debug!(target: "ipc", %payload, "script -> host");

        if message.is_reply() {
            self.resolve_reply(message);
            return;
        }
        if message.channel.is_empty() {
            debug!(target: "ipc", "script message without channel or reply id ignored");
            return;
        }

        let Some(view) = self.inner.scripts.view_for_context(context) else {
            error!(target: "ipc", channel = %message.channel, context, "no view for script context");
            return;
        };
        let bridge = self.clone();
        self.inner
            .runtime
            .spawn(async move { bridge.answer(view, message).await });
    }

    /// Entry point for the page's `REGISTER_HANDLER` relay.
    pub fn on_register_handler(&self, context: ScriptContext, channel: &str) {
        let Some(view) = self.inner.scripts.view_for_context(context) else {
            error!(target: "ipc", %channel, context, "script handler registered from unknown context");
            return;
        };
        info!(target: "ipc", %channel, view, "script handler registered");
        self.inner
            .routes()
            .insert(channel.to_string(), Route::Script(view));
    }

    /// Drop every page-registered route pointing at `view`.
    pub fn forget_view(&self, view: EngineHandle) {
        self.inner
            .routes()
            .retain(|_, route| !matches!(route, Route::Script(owner) if *owner == view));
    }

    pub(crate) fn downgrade(&self) -> WeakBridge {
        WeakBridge {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn route(&self, channel: &str) -> Result<Route, IpcError> {
        let route = self.inner.routes().get(channel).cloned();
        route.ok_or_else(|| {
            error!(target: "ipc", %channel, "ipc channel not registered");
            IpcError::ChannelNotFound(channel.to_string())
        })
    }

    fn post(&self, view: EngineHandle, message: &IpcMessage) -> Result<(), IpcError> {
        let script = message.to_script()?;
        debug!(target: "ipc", view, channel = %message.channel, "host -> script");
        self.inner.scripts.post_script(view, script)?;
        Ok(())
    }

    async fn run_host(&self, channel: &str, call: HostFn, args: Vec<Value>) -> Outcome {
        let name = channel.to_string();
        match self
            .inner
            .runtime
            .spawn_blocking(move || run_guarded(&name, &call, args))
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => Err(IpcError::HandlerFault {
                channel: channel.to_string(),
                message: err.to_string(),
            }),
        }
    }

    async fn round_trip(
        &self,
        view: EngineHandle,
        channel: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Outcome {
        let id = Uuid::new_v4().simple().to_string();
        let (resolver, pending) = completion();
        self.inner.pending().insert(id.clone(), resolver);
        let _entry = PendingEntry {
            inner: &self.inner,
            id: &id,
        };

        self.post(view, &IpcMessage::request(id.as_str(), channel, args))?;

        match tokio::time::timeout(timeout, pending.wait_async()).await {
            Ok(delivered) => delivered.unwrap_or(Err(IpcError::Abandoned)),
            Err(_) => self.expire(view, channel, &id, &pending, timeout).await,
        }
    }

    /// The deadline passed. Whichever side removes the entry first owns the
    /// outcome, so a reply that claimed it at the deadline still wins.
    async fn expire(
        &self,
        view: EngineHandle,
        channel: &str,
        id: &str,
        pending: &Pending<Outcome>,
        timeout: Duration,
    ) -> Outcome {
        if self.inner.pending().remove(id).is_some() {
            warn!(target: "ipc", %channel, view, ?timeout, "timed out waiting for script handler");
            return Err(IpcError::Timeout(timeout));
        }
        pending
            .wait_async()
            .await
            .unwrap_or(Err(IpcError::Abandoned))
    }

    fn resolve_reply(&self, message: IpcMessage) {
        let resolver = self.inner.pending().remove(&message.reply_id);
        match resolver {
            Some(resolver) => {
                resolver.resolve(message.outcome());
            }
            None => {
                debug!(target: "ipc", reply_id = %message.reply_id, "late or duplicate reply dropped");
            }
        }
    }

    async fn answer(&self, view: EngineHandle, message: IpcMessage) {
        let IpcMessage {
            id, channel, args, ..
        } = message;
        if id.is_empty() {
            // Lookup failures are already logged by `route`.
            let _ = self.send(&channel, args);
            return;
        }

        let outcome = self.invoke(&channel, args).await;
        if let Err(err) = self.post(view, &IpcMessage::reply(id, outcome)) {
            error!(target: "ipc", %channel, view, error = %err, "failed to deliver reply");
        }
    }
}

/// Non-owning bridge reference for script hosts the bridge itself owns.
#[derive(Clone)]
pub(crate) struct WeakBridge {
    inner: Weak<Inner>,
}

impl WeakBridge {
    pub(crate) fn upgrade(&self) -> Option<IpcBridge> {
        self.inner.upgrade().map(|inner| IpcBridge { inner })
    }
}

fn run_guarded(channel: &str, call: &HostFn, args: Vec<Value>) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(|| call(args))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(target: "ipc", %channel, %message, "handler panicked");
            Err(IpcError::HandlerFault {
                channel: channel.to_string(),
                message,
            })
        }
    }
}
