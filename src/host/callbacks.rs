//! `extern "C"` entry points handed to the engine.
//!
//! Every callback receives the address of the owning [`HostInner`] as its
//! user parameter. The engine invokes them on the bound thread, so calls
//! they make through the scheduler run immediately.

use std::ffi::c_char;
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use super::HostInner;
use crate::engine::{panic_message, EngineHandle, Word};

/// `jsValue (*)(jsExecState es, void* param)`
pub(crate) type NativeFunction = extern "C" fn(Word, Word) -> Word;
/// `void (*)(wkeWebView webView, void* param)`
pub(crate) type DestroyCallback = extern "C" fn(EngineHandle, Word);
/// `void (*)(wkeWebView, void* param, wkeWebFrameHandle, void* context, int extensionGroup, int worldId)`
pub(crate) type ScriptContextCallback = extern "C" fn(EngineHandle, Word, Word, Word, i32, i32);
/// `bool (*)(wkeWebView, void* param, const utf8* url, wkeNetJob job)`
pub(crate) type LoadUrlBeginCallback = extern "C" fn(EngineHandle, Word, *const c_char, Word) -> bool;
/// `void (*)(wkeWebView, void* param, wkeWebFrameHandle frameId)`
pub(crate) type DocumentReadyCallback = extern "C" fn(EngineHandle, Word, Word);
/// `void (*)(wkeWebView, void* param, const wkeString title)`
pub(crate) type TitleChangedCallback = extern "C" fn(EngineHandle, Word, Word);
/// `bool (*)(wkeWebView, void* param)`
pub(crate) type ClosingCallback = extern "C" fn(EngineHandle, Word) -> bool;

/// # Safety
///
/// `param` must be zero or the address registered by the host, which stays
/// valid until the host shuts the engine down.
unsafe fn host<'a>(param: Word) -> Option<&'a HostInner> {
    (param as *const HostInner).as_ref()
}

/// Unwinding into the engine is undefined behaviour; stop it here.
fn shielded<T>(callback: &str, fallback: T, body: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            error!(
                target: "host",
                callback,
                message = %panic_message(payload.as_ref()),
                "engine callback panicked"
            );
            fallback
        }
    }
}

pub(crate) extern "C" fn js_to_host(es: Word, param: Word) -> Word {
    shielded("js_to_host", 0, || {
        // SAFETY: bound with the host's own address.
        if let Some(host) = unsafe { host(param) } {
            host.relay_script_message(es);
        }
        0
    })
}

pub(crate) extern "C" fn register_handler(es: Word, param: Word) -> Word {
    shielded("register_handler", 0, || {
        // SAFETY: bound with the host's own address.
        if let Some(host) = unsafe { host(param) } {
            host.relay_handler_registration(es);
        }
        0
    })
}

pub(crate) extern "C" fn on_window_destroy(view: EngineHandle, param: Word) {
    shielded("on_window_destroy", (), || {
        // SAFETY: registered with the host's own address.
        if let Some(host) = unsafe { host(param) } {
            host.view_destroyed(view);
        }
    })
}

pub(crate) extern "C" fn on_script_context(
    view: EngineHandle,
    param: Word,
    _frame: Word,
    _context: Word,
    _extension_group: i32,
    _world_id: i32,
) {
    shielded("on_script_context", (), || {
        // SAFETY: registered with the host's own address.
        if let Some(host) = unsafe { host(param) } {
            host.inject_boot_scripts(view);
        }
    })
}

pub(crate) extern "C" fn on_load_url_begin(
    view: EngineHandle,
    param: Word,
    url: *const c_char,
    job: Word,
) -> bool {
    shielded("on_load_url_begin", false, || {
        // SAFETY: registered with the host's own address; `url` is a
        // NUL-terminated string owned by the engine for this call.
        match unsafe { host(param) } {
            Some(host) => host.load_url_begin(view, url as Word, job),
            None => false,
        }
    })
}

pub(crate) extern "C" fn on_document_ready(view: EngineHandle, param: Word, frame: Word) {
    shielded("on_document_ready", (), || {
        // SAFETY: registered with the host's own address.
        if let Some(host) = unsafe { host(param) } {
            host.document_ready(view, frame);
        }
    })
}

pub(crate) extern "C" fn on_title_changed(view: EngineHandle, param: Word, title: Word) {
    shielded("on_title_changed", (), || {
        // SAFETY: registered with the host's own address.
        if let Some(host) = unsafe { host(param) } {
            host.title_changed(view, title);
        }
    })
}

pub(crate) extern "C" fn on_window_closing(view: EngineHandle, param: Word) -> bool {
    shielded("on_window_closing", true, || {
        // SAFETY: registered with the host's own address.
        match unsafe { host(param) } {
            Some(host) => host.window_closing(view),
            None => true,
        }
    })
}

pub(crate) fn native_function_word(function: NativeFunction) -> Word {
    function as Word
}

pub(crate) fn destroy_callback_word(callback: DestroyCallback) -> Word {
    callback as Word
}

pub(crate) fn script_context_callback_word(callback: ScriptContextCallback) -> Word {
    callback as Word
}

pub(crate) fn load_url_begin_callback_word(callback: LoadUrlBeginCallback) -> Word {
    callback as Word
}

pub(crate) fn document_ready_callback_word(callback: DocumentReadyCallback) -> Word {
    callback as Word
}

pub(crate) fn title_changed_callback_word(callback: TitleChangedCallback) -> Word {
    callback as Word
}

pub(crate) fn closing_callback_word(callback: ClosingCallback) -> Word {
    callback as Word
}
