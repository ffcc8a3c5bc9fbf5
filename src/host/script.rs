use std::sync::Weak;

use tracing::warn;

use super::view::{View, Window};
use crate::engine::{EngineHandle, NativeStr};
use crate::ipc::{DeliveryError, ScriptContext, ScriptHost};
use crate::registry::ViewRegistry;
use crate::scheduler::Scheduler;

/// Runs page scripts through the engine's `wkeRunJS`.
pub(crate) struct EngineScriptHost {
    scheduler: Scheduler,
    registry: Weak<ViewRegistry<View, Window>>,
}

impl EngineScriptHost {
    pub(crate) fn new(scheduler: Scheduler, registry: Weak<ViewRegistry<View, Window>>) -> Self {
        Self {
            scheduler,
            registry,
        }
    }
}

impl ScriptHost for EngineScriptHost {
    fn post_script(&self, view: EngineHandle, script: String) -> Result<(), DeliveryError> {
        if self.scheduler.is_shut_down() {
            return Err(DeliveryError {
                view,
                reason: "engine thread has shut down".into(),
            });
        }
        let script = NativeStr::new(&script).map_err(|err| DeliveryError {
            view,
            reason: err.to_string(),
        })?;

        let scheduler = self.scheduler.clone();
        self.scheduler.add_job(move || {
            if let Err(err) = scheduler.call("wkeRunJS", &[view, script.word()]) {
                warn!(target: "host", view, error = %err, "script delivery failed");
            }
        });
        Ok(())
    }

    fn view_for_context(&self, context: ScriptContext) -> Option<EngineHandle> {
        let view = self.scheduler.call("jsGetWebView", &[context]).ok()?.0;
        let registry = self.registry.upgrade()?;
        registry.contains(view).then_some(view)
    }
}
