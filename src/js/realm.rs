use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use rquickjs::{Context, Function};
use tracing::{debug, info, warn};

use super::runtime::QuickJsEngine;
use super::RealmError;
use crate::config::Config;
use crate::engine::EngineHandle;
use crate::ipc::{self, DeliveryError, IpcBridge, ScriptContext, ScriptHost, WeakBridge};
use crate::scheduler::Scheduler;

/// In-process page realm: one QuickJS context per view, evaluated on the
/// scheduler's bound thread.
///
/// Stands in for the engine's own script runtime wherever pages are
/// headless, and speaks the same relay protocol. The script context handed
/// to the bridge is the view handle itself.
pub struct QuickJsRealm {
    this: Weak<QuickJsRealm>,
    scheduler: Scheduler,
    bridge: OnceLock<WeakBridge>,
    /// `Context` frees its QuickJS context on every drop, so it is shared
    /// through an `Arc` and never cloned itself.
    contexts: Mutex<HashMap<EngineHandle, Arc<Context>>>,
    engine: QuickJsEngine,
}

impl QuickJsRealm {
    pub fn new(scheduler: Scheduler) -> Result<Arc<Self>, RealmError> {
        let engine = QuickJsEngine::new()?;
        let realm = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            scheduler: scheduler.clone(),
            bridge: OnceLock::new(),
            contexts: Mutex::new(HashMap::new()),
            engine,
        });

        let weak = Arc::downgrade(&realm);
        scheduler.add_loop(move || {
            if let Some(realm) = weak.upgrade() {
                realm.engine.execute_pending_jobs();
            }
        });
        Ok(realm)
    }

    /// Connect page relays to `bridge`. Only the first call takes effect.
    pub fn attach(&self, bridge: &IpcBridge) {
        if self.bridge.set(bridge.downgrade()).is_err() {
            warn!(target: "quickjs", "realm already attached to a bridge");
        }
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<EngineHandle, Arc<Context>>> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self, view: EngineHandle) -> Result<Arc<Context>, RealmError> {
        self.contexts()
            .get(&view)
            .cloned()
            .ok_or(RealmError::UnknownView(view))
    }

    fn bridge(&self) -> Option<IpcBridge> {
        self.bridge.get().and_then(WeakBridge::upgrade)
    }

    /// Create the page for `view` and run the IPC boot script in it.
    pub fn open_view(&self, view: EngineHandle) -> Result<(), RealmError> {
        let realm = self.strong()?;
        self.scheduler
            .run_blocking(move || realm.open_on_engine_thread(view))?
    }

    fn open_on_engine_thread(&self, view: EngineHandle) -> Result<(), RealmError> {
        if self.contexts().contains_key(&view) {
            return Err(RealmError::ViewExists(view));
        }
        let context = Arc::new(self.engine.new_context(view)?);
        self.install_relays(&context, view)?;
        self.contexts().insert(view, Arc::clone(&context));

        let timeout = self
            .bridge()
            .map(|bridge| bridge.timeout())
            .unwrap_or_else(|| Config::default().ipc_timeout());
        if let Err(err) = self
            .engine
            .eval(&context, &ipc::boot_script(timeout), "ipc-boot.js")
        {
            self.contexts().remove(&view);
            return Err(err);
        }
        info!(target: "quickjs", view, "page opened");
        Ok(())
    }

    fn install_relays(&self, context: &Context, view: EngineHandle) -> Result<(), RealmError> {
        let to_host = self.this.clone();
        let register = self.this.clone();
        context
            .with(|ctx| {
                let global = ctx.globals();
                global.set("window", global.clone())?;
                global.set("top", global.clone())?;

                let relay = Function::new(ctx.clone(), move |payload: String| {
                    match to_host.upgrade().and_then(|realm| realm.bridge()) {
                        Some(bridge) => bridge.on_script_message(view, &payload),
                        None => debug!(target: "quickjs", view, "message dropped, no bridge"),
                    }
                })?
                .with_name(ipc::JS_TO_HOST)?;
                global.set(ipc::JS_TO_HOST, relay)?;

                let announce = Function::new(ctx.clone(), move |channel: String| {
                    match register.upgrade().and_then(|realm| realm.bridge()) {
                        Some(bridge) => bridge.on_register_handler(view, &channel),
                        None => debug!(target: "quickjs", view, %channel, "registration dropped, no bridge"),
                    }
                })?
                .with_name(ipc::REGISTER_HANDLER)?;
                global.set(ipc::REGISTER_HANDLER, announce)
            })
            .map_err(|err| RealmError::Engine(err.to_string()))
    }

    /// Evaluate page script in `view` and wait for it to finish.
    pub fn eval(&self, view: EngineHandle, source: &str) -> Result<(), RealmError> {
        self.evaluate::<()>(view, source)
    }

    /// Evaluate page script in `view` and convert its completion value.
    pub fn evaluate<V>(&self, view: EngineHandle, source: &str) -> Result<V, RealmError>
    where
        V: for<'js> rquickjs::FromJs<'js> + Send + 'static,
    {
        let realm = self.strong()?;
        let source = source.to_string();
        self.scheduler.run_blocking(move || {
            let context = realm.context(view)?;
            realm.engine.eval_with::<V>(&context, &source, "page.js")
        })?
    }

    /// Drop the page for `view`. Returns whether it existed.
    pub fn close_view(&self, view: EngineHandle) -> Result<bool, RealmError> {
        let realm = self.strong()?;
        let closed = self
            .scheduler
            .run_blocking(move || realm.contexts().remove(&view).is_some())?;
        if closed {
            if let Some(bridge) = self.bridge() {
                bridge.forget_view(view);
            }
            info!(target: "quickjs", view, "page closed");
        }
        Ok(closed)
    }

    pub fn views(&self) -> Vec<EngineHandle> {
        self.contexts().keys().copied().collect()
    }

    fn strong(&self) -> Result<Arc<Self>, RealmError> {
        self.this.upgrade().ok_or(RealmError::Closed)
    }

    fn run_posted(&self, view: EngineHandle, script: &str) {
        let result = self
            .context(view)
            .and_then(|context| self.engine.eval(&context, script, "ipc-message.js"));
        if let Err(err) = result {
            warn!(target: "quickjs", view, error = %err, "posted script failed");
        }
    }
}

impl ScriptHost for QuickJsRealm {
    fn post_script(&self, view: EngineHandle, script: String) -> Result<(), DeliveryError> {
        let undeliverable = |reason: &str| DeliveryError {
            view,
            reason: reason.to_string(),
        };
        if self.scheduler.is_shut_down() {
            return Err(undeliverable("engine thread has shut down"));
        }
        if !self.contexts().contains_key(&view) {
            return Err(undeliverable("no page open for view"));
        }
        let realm = self.strong().map_err(|_| undeliverable("realm dropped"))?;
        self.scheduler
            .add_job(move || realm.run_posted(view, &script));
        Ok(())
    }

    fn view_for_context(&self, context: ScriptContext) -> Option<EngineHandle> {
        self.contexts().contains_key(&context).then_some(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{GatewayError, NativeGateway, Word, Words};
    use crate::scheduler::SchedulerOptions;

    struct IdleGateway;

    impl NativeGateway for IdleGateway {
        fn invoke(&self, _name: &str, _args: &[Word]) -> Result<Words, GatewayError> {
            Ok((0, 0))
        }
    }

    fn realm() -> (Scheduler, Arc<QuickJsRealm>) {
        let scheduler = Scheduler::new(Arc::new(IdleGateway), SchedulerOptions::default());
        scheduler.spawn().unwrap();
        let realm = QuickJsRealm::new(scheduler.clone()).unwrap();
        (scheduler, realm)
    }

    #[test]
    fn pages_survive_repeated_evaluation_and_teardown() {
        let (scheduler, realm) = realm();
        realm.open_view(1).unwrap();
        realm.open_view(2).unwrap();

        realm.eval(1, "globalThis.count = 0").unwrap();
        for _ in 0..3 {
            realm.eval(1, "globalThis.count += 1").unwrap();
        }
        let count: i32 = realm.evaluate(1, "globalThis.count").unwrap();
        assert_eq!(count, 3);
        let kind: String = realm.evaluate(2, "typeof ipc.invoke").unwrap();
        assert_eq!(kind, "function");

        assert!(realm.close_view(1).unwrap());
        assert!(matches!(
            realm.eval(1, "1"),
            Err(RealmError::UnknownView(1))
        ));
        assert_eq!(realm.views(), vec![2]);

        scheduler.shutdown();
        scheduler.join();
        drop(realm);
    }

    #[test]
    fn opening_a_view_twice_is_rejected() {
        let (scheduler, realm) = realm();
        realm.open_view(7).unwrap();
        assert!(matches!(realm.open_view(7), Err(RealmError::ViewExists(7))));
        let still_there: bool = realm.evaluate(7, "typeof ipc === 'object'").unwrap();
        assert!(still_there);
        scheduler.shutdown();
        scheduler.join();
    }
}
