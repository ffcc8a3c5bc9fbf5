use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use libloading::{Library, Symbol};
use thiserror::Error;
use tracing::{debug, error};

use super::word::{Word, Words};

/// Largest argument list any engine entry point takes.
pub const MAX_ARGS: usize = 12;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to load engine library {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("engine entry point {name} not found: {source}")]
    MissingSymbol {
        name: String,
        #[source]
        source: libloading::Error,
    },
    #[error("engine entry point {name} called with {count} arguments (max {MAX_ARGS})")]
    TooManyArguments { name: String, count: usize },
    #[error("native call {name} faulted: {message}")]
    Fault { name: String, message: String },
}

/// Status code raised through the unwinding path by the FFI layer.
///
/// A [`NativeStatus::SUCCESS`] payload is not a failure: it only means the
/// success code travelled the abnormal path instead of the return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeStatus(pub u32);

impl NativeStatus {
    pub const SUCCESS: NativeStatus = NativeStatus(0);
}

/// Invokes named engine entry points with a flat list of word arguments.
///
/// Implementations do not enforce thread affinity; the scheduler only ever
/// calls them from its bound thread.
pub trait NativeGateway: Send + Sync + 'static {
    fn invoke(&self, name: &str, args: &[Word]) -> Result<Words, GatewayError>;
}

/// Run `call` and turn an unwinding fault into a returned error.
pub fn guard_native_call<F>(name: &str, call: F) -> Result<Words, GatewayError>
where
    F: FnOnce() -> Result<Words, GatewayError>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            if payload.downcast_ref::<NativeStatus>() == Some(&NativeStatus::SUCCESS) {
                debug!(target: "gateway", %name, "success status delivered through unwind");
                return Ok((0, 0));
            }
            let message = panic_message(payload.as_ref());
            error!(target: "gateway", %name, %message, "native call faulted");
            Err(GatewayError::Fault {
                name: name.to_string(),
                message,
            })
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(status) = payload.downcast_ref::<NativeStatus>() {
        return format!("status code {}", status.0);
    }
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic payload".to_string()
}

/// Address of a resolved entry point.
#[derive(Debug, Clone, Copy)]
pub struct ProcAddress(*const c_void);

// SAFETY: the address points into the loaded library's code, which is
// immutable and lives as long as the owning `LibraryGateway`.
unsafe impl Send for ProcAddress {}
unsafe impl Sync for ProcAddress {}

impl ProcAddress {
    pub fn addr(&self) -> usize {
        self.0 as usize
    }
}

/// Gateway backed by the engine's dynamic library.
pub struct LibraryGateway {
    library: Library,
    path: PathBuf,
    procs: Mutex<HashMap<String, ProcAddress>>,
}

impl LibraryGateway {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref().to_path_buf();
        // SAFETY: loading runs the library's initialisers; the engine
        // library is trusted host code.
        let library = unsafe { Library::new(&path) }.map_err(|source| GatewayError::Load {
            path: path.clone(),
            source,
        })?;
        debug!(target: "gateway", path = %path.display(), "engine library loaded");
        Ok(Self {
            library,
            path,
            procs: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up `name`, caching the result.
    pub fn resolve(&self, name: &str) -> Result<ProcAddress, GatewayError> {
        let mut procs = self.procs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(address) = procs.get(name) {
            return Ok(*address);
        }

        let mut symbol_name = Vec::with_capacity(name.len() + 1);
        symbol_name.extend_from_slice(name.as_bytes());
        symbol_name.push(0);

        // SAFETY: the symbol is only reinterpreted as an `extern "C"`
        // function taking and returning words, the engine's only call shape.
        let symbol: Symbol<*const c_void> = unsafe { self.library.get(&symbol_name) }
            .map_err(|source| GatewayError::MissingSymbol {
                name: name.to_string(),
                source,
            })?;
        let address = ProcAddress(*symbol);
        procs.insert(name.to_string(), address);
        Ok(address)
    }
}

impl NativeGateway for LibraryGateway {
    fn invoke(&self, name: &str, args: &[Word]) -> Result<Words, GatewayError> {
        let address = match self.resolve(name) {
            Ok(address) => address,
            Err(err) => {
                // No call into a mismatched engine can ever succeed.
                error!(target: "gateway", error = %err, "engine library does not match this host");
                std::process::abort();
            }
        };

        if args.len() > MAX_ARGS {
            return Err(GatewayError::TooManyArguments {
                name: name.to_string(),
                count: args.len(),
            });
        }

        // A foreign `extern "C"` frame cannot unwind with a `NativeStatus`
        // payload, so here the guard only converts Rust panics into faults.
        // The success-status path serves Rust-side gateways and callbacks.
        guard_native_call(name, || {
            // SAFETY: arity is bounded above and every engine entry point
            // uses the C calling convention with word-sized parameters.
            let primary = unsafe { call_words(address.0, args) };
            Ok((primary, 0))
        })
    }
}

unsafe fn call_words(proc: *const c_void, args: &[Word]) -> Word {
    type W = Word;
    use std::mem::transmute as cast;

    match *args {
        [] => cast::<_, extern "C" fn() -> W>(proc)(),
        [a] => cast::<_, extern "C" fn(W) -> W>(proc)(a),
        [a, b] => cast::<_, extern "C" fn(W, W) -> W>(proc)(a, b),
        [a, b, c] => cast::<_, extern "C" fn(W, W, W) -> W>(proc)(a, b, c),
        [a, b, c, d] => cast::<_, extern "C" fn(W, W, W, W) -> W>(proc)(a, b, c, d),
        [a, b, c, d, e] => cast::<_, extern "C" fn(W, W, W, W, W) -> W>(proc)(a, b, c, d, e),
        [a, b, c, d, e, f] => {
            cast::<_, extern "C" fn(W, W, W, W, W, W) -> W>(proc)(a, b, c, d, e, f)
        }
        [a, b, c, d, e, f, g] => {
            cast::<_, extern "C" fn(W, W, W, W, W, W, W) -> W>(proc)(a, b, c, d, e, f, g)
        }
        [a, b, c, d, e, f, g, h] => {
            cast::<_, extern "C" fn(W, W, W, W, W, W, W, W) -> W>(proc)(a, b, c, d, e, f, g, h)
        }
        [a, b, c, d, e, f, g, h, i] => cast::<_, extern "C" fn(W, W, W, W, W, W, W, W, W) -> W>(
            proc,
        )(a, b, c, d, e, f, g, h, i),
        [a, b, c, d, e, f, g, h, i, j] => cast::<
            _,
            extern "C" fn(W, W, W, W, W, W, W, W, W, W) -> W,
        >(proc)(a, b, c, d, e, f, g, h, i, j),
        [a, b, c, d, e, f, g, h, i, j, k] => cast::<
            _,
            extern "C" fn(W, W, W, W, W, W, W, W, W, W, W) -> W,
        >(proc)(a, b, c, d, e, f, g, h, i, j, k),
        [a, b, c, d, e, f, g, h, i, j, k, l] => cast::<
            _,
            extern "C" fn(W, W, W, W, W, W, W, W, W, W, W, W) -> W,
        >(proc)(a, b, c, d, e, f, g, h, i, j, k, l),
        _ => 0,
    }
}
