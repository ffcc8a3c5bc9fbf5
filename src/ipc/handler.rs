use std::sync::Arc;

use serde_json::Value;

use super::args::{ArgList, Extract, IntoReply};
use super::IpcError;
use crate::engine::EngineHandle;

/// A typed host function usable as a channel handler.
///
/// Implemented for closures of up to six parameters, each either a
/// [`FromArg`](super::FromArg) type or a trailing [`Rest`](super::Rest).
pub trait Handler<Params>: Send + Sync + 'static {
    fn call(&self, args: Vec<Value>) -> Result<Value, IpcError>;
}

macro_rules! impl_handler {
    ($($param:ident),*) => {
        impl<F, R, $($param,)*> Handler<($($param,)*)> for F
        where
            F: Fn($($param),*) -> R + Send + Sync + 'static,
            R: IntoReply,
            $($param: Extract,)*
        {
            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn call(&self, args: Vec<Value>) -> Result<Value, IpcError> {
                let mut args = ArgList::new(args);
                $(let $param = $param::extract(&mut args)?;)*
                (self)($($param),*).into_reply()
            }
        }
    };
}

impl_handler!();
impl_handler!(A1);
impl_handler!(A1, A2);
impl_handler!(A1, A2, A3);
impl_handler!(A1, A2, A3, A4);
impl_handler!(A1, A2, A3, A4, A5);
impl_handler!(A1, A2, A3, A4, A5, A6);

pub(crate) type HostFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, IpcError> + Send + Sync>;

/// Where a channel's logic lives.
#[derive(Clone)]
pub(crate) enum Route {
    Host(HostFn),
    /// Registered by page script in the given view.
    Script(EngineHandle),
}

impl Route {
    pub(crate) fn host<H, Params>(handler: H) -> Self
    where
        H: Handler<Params>,
    {
        Route::Host(Arc::new(move |args: Vec<Value>| handler.call(args)))
    }
}
