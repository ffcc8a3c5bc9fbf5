use rquickjs::{Context, Ctx, Error as JsError, Function, Runtime, Value};

use super::RealmError;
use crate::engine::EngineHandle;

const MAX_JOBS: usize = 1000;

/// QuickJS runtime shared by every page context of a realm.
///
/// Contexts created here get a `console` that forwards to `tracing` under
/// the `quickjs` target, tagged with the owning view.
pub struct QuickJsEngine {
    runtime: Runtime,
}

impl QuickJsEngine {
    pub fn new() -> Result<Self, RealmError> {
        let runtime = Runtime::new().map_err(engine_error)?;
        Ok(Self { runtime })
    }

    /// A fresh global scope for `view` with `console` installed.
    pub fn new_context(&self, view: EngineHandle) -> Result<Context, RealmError> {
        let context = Context::full(&self.runtime).map_err(engine_error)?;
        context
            .with(|ctx| {
                let log_fn = Function::new(ctx.clone(), move |level: String, message: String| {
                    log_from_js(view, &level, &message);
                })?
                .with_name("__host_log")?;
                ctx.globals().set("__host_log", log_fn)?;
                ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())
            })
            .map_err(engine_error)?;
        Ok(context)
    }

    /// Evaluate a script and discard the result.
    pub fn eval(&self, context: &Context, source: &str, filename: &str) -> Result<(), RealmError> {
        self.eval_with::<()>(context, source, filename)
    }

    /// Evaluate a script, convert its completion value and run the promise
    /// jobs it queued.
    pub fn eval_with<V>(&self, context: &Context, source: &str, filename: &str) -> Result<V, RealmError>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let script = with_source_url(source, filename);
        let value = context.with(|ctx| match ctx.eval::<V, _>(script) {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => Err(RealmError::Script(
                capture_exception_message(&ctx)
                    .unwrap_or_else(|| "QuickJS exception".to_string()),
            )),
            Err(err) => Err(engine_error(err)),
        })?;

        self.execute_pending_jobs();
        Ok(value)
    }

    /// Run queued promise continuations. Returns how many ran.
    pub fn execute_pending_jobs(&self) -> usize {
        let mut job_count = 0;
        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    job_count += 1;
                    if job_count >= MAX_JOBS {
                        tracing::warn!(
                            target: "quickjs",
                            "Stopped processing jobs after {} iterations (possible infinite loop)",
                            MAX_JOBS
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(job_exception) => {
                    tracing::error!(
                        target: "quickjs",
                        "Job execution error: {:?}",
                        job_exception
                    );
                    break;
                }
            }
        }

        if job_count > 0 {
            tracing::trace!(target: "quickjs", "Executed {} pending jobs", job_count);
        }
        job_count
    }
}

fn engine_error(err: JsError) -> RealmError {
    RealmError::Engine(err.to_string())
}

fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
    let mut script = String::with_capacity(source.len() + filename.len() + 32);
    script.push_str(source);
    if !source.ends_with('\n') {
        script.push('\n');
    }
    script.push_str("//# sourceURL=");
    script.push_str(filename);
    script.push('\n');
    script.into_bytes()
}

fn log_from_js(view: EngineHandle, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: "quickjs", view, "{message}"),
        "warn" => tracing::warn!(target: "quickjs", view, "{message}"),
        "debug" => tracing::debug!(target: "quickjs", view, "{message}"),
        _ => tracing::info!(target: "quickjs", view, "{message}"),
    }
}

fn capture_exception_message(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            if let Ok(stack) = obj.get::<_, String>("stack") {
                return Some(format!("Error: {}\nStack: {}", message, stack));
            }
            return Some(format!("Error: {}", message));
        }
    }
    if let Some(text) = exception.as_string().and_then(|text| text.to_string().ok()) {
        return Some(text);
    }

    Some(format!("{:?}", exception))
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            if (typeof value === 'object') {
                return JSON.stringify(value);
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logAt = (level) => (...args) => {
        try {
            global.__host_log(level, args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    if (typeof global.console !== 'object' || global.console === null) {
        global.console = {};
    }

    global.console.log = logAt('info');
    global.console.info = logAt('info');
    global.console.warn = logAt('warn');
    global.console.error = logAt('error');
    global.console.debug = logAt('debug');
})();
"#;
