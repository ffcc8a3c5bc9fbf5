//! Boundary to the native engine library.

mod gateway;
mod word;

pub use gateway::{
    guard_native_call, GatewayError, LibraryGateway, NativeGateway, NativeStatus, ProcAddress,
    MAX_ARGS,
};
pub(crate) use gateway::panic_message;
pub use word::{read_c_str, IntoWord, NativeStr, WideStr, Word, Words};

/// Opaque identifier the engine issues for a view or window.
pub type EngineHandle = usize;
