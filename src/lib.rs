// Library exports for the host binary and tests

pub mod completion;
pub mod config;
pub mod engine;
pub mod host;
pub mod ipc;
pub mod js;
pub mod registry;
pub mod scheduler;

// Re-export commonly used types for tests
pub use config::Config;
pub use engine::{EngineHandle, GatewayError, LibraryGateway, NativeGateway, Word, Words};
pub use host::{
    FrameHandle, Host, HostError, LoadRequest, Rect, Resource, Subscription, View, Window,
    WindowType,
};
pub use ipc::{IpcBridge, IpcError, ScriptHost};
pub use js::QuickJsRealm;
pub use registry::ViewRegistry;
pub use scheduler::{Scheduler, SchedulerError, SchedulerOptions};
