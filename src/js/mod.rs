//! QuickJS-backed page realm.

mod realm;
mod runtime;

use thiserror::Error;

pub use realm::QuickJsRealm;
pub use runtime::QuickJsEngine;

use crate::engine::EngineHandle;
use crate::scheduler::SchedulerError;

#[derive(Debug, Error)]
pub enum RealmError {
    #[error("QuickJS: {0}")]
    Engine(String),
    #[error("{0}")]
    Script(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("view {0} already has a page")]
    ViewExists(EngineHandle),
    #[error("no page open for view {0}")]
    UnknownView(EngineHandle),
    #[error("realm has been dropped")]
    Closed,
}
