//! Request/response messaging between host handlers and page script.

mod args;
mod bridge;
mod handler;
mod message;

use std::time::Duration;

use thiserror::Error;

pub use args::{ArgError, ArgList, Extract, FromArg, IntoReply, Json, Rest};
pub use bridge::IpcBridge;
pub(crate) use bridge::WeakBridge;
pub use handler::Handler;
pub use message::IpcMessage;

use crate::engine::EngineHandle;

/// Page-global namespace holding the script side's own tables.
pub const NAMESPACE: &str = "__mb";
/// Page-global API object (`ipc.invoke`, `ipc.sent`, `ipc.handle`).
pub const IPC_OBJECT: &str = "ipc";
/// Native-bound relay the page calls with a JSON message.
pub const JS_TO_HOST: &str = "__js2go";
/// Page function the host calls with a JSON message.
pub const HOST_TO_JS: &str = "__go2js";
/// Native-bound relay announcing a page-side channel.
pub const REGISTER_HANDLER: &str = "__register_handler";
/// Page-only channel that calls a global script function by name.
pub const CALL_JS_FUNC: &str = "callJsFunc";

const BOOT_TEMPLATE: &str = include_str!("boot.js");

/// Opaque script execution context passed alongside page messages.
pub type ScriptContext = usize;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("ipc channel {0} not registered")]
    ChannelNotFound(String),
    #[error("timed out after {0:?} waiting for ipc handler")]
    Timeout(Duration),
    #[error("ipc timeout must be greater than zero")]
    ZeroTimeout,
    #[error("handler for channel {channel} faulted: {message}")]
    HandlerFault { channel: String, message: String },
    #[error("argument {index}: {source}")]
    Argument {
        index: usize,
        #[source]
        source: ArgError,
    },
    /// Error text reported by the other side or returned by a handler.
    #[error("{0}")]
    Remote(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("malformed ipc message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("ipc call abandoned before a reply arrived")]
    Abandoned,
}

#[derive(Debug, Error)]
#[error("could not deliver script to view {view}: {reason}")]
pub struct DeliveryError {
    pub view: EngineHandle,
    pub reason: String,
}

/// Where page scripts run.
///
/// The bridge only posts scripts and maps script contexts back to views;
/// everything about how a page evaluates them belongs to the implementor.
pub trait ScriptHost: Send + Sync + 'static {
    /// Queue `script` for evaluation in `view`. Must not wait for it to run.
    fn post_script(&self, view: EngineHandle, script: String) -> Result<(), DeliveryError>;

    /// View that owns a script execution context, if it is still alive.
    fn view_for_context(&self, context: ScriptContext) -> Option<EngineHandle>;
}

/// Page script installing the `ipc` API. Run it in every new script context.
pub fn boot_script(timeout: Duration) -> String {
    BOOT_TEMPLATE
        .replace("{{NAMESPACE}}", NAMESPACE)
        .replace("{{IPC}}", IPC_OBJECT)
        .replace("{{JS_TO_HOST}}", JS_TO_HOST)
        .replace("{{HOST_TO_JS}}", HOST_TO_JS)
        .replace("{{REGISTER_HANDLER}}", REGISTER_HANDLER)
        .replace("{{CALL_JS_FUNC}}", CALL_JS_FUNC)
        .replace("{{TIMEOUT_MS}}", &timeout.as_millis().to_string())
}
