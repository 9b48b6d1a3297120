//! Dynamic handler invocation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use keel_core::Container;
use tracing::debug;

use crate::error::InvokeError;
use crate::extract::ArgValue;
use crate::handler::HandlerMeta;
use crate::response::ReturnValue;

/// Resolves handler receivers from the container and calls them.
#[derive(Debug, Clone)]
pub struct Invoker {
    container: Arc<Container>,
}

impl Invoker {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// Calls `meta`'s method with its receiver prepended to `args`, returning
    /// the raw result list.
    ///
    /// A panic inside the handler is caught and reported as
    /// [`InvokeError::Panicked`] so cleanup hooks still run.
    pub async fn invoke(
        &self,
        meta: &HandlerMeta,
        args: Vec<ArgValue>,
    ) -> Result<Vec<ReturnValue>, InvokeError> {
        let receiver = self
            .container
            .resolve_key(meta.owner())
            .map_err(|source| InvokeError::Receiver {
                ty: meta.owner().name(),
                source,
            })?;

        debug!(handler = %meta.method(), "Invoking handler");
        let call = meta.call(receiver, args)?;
        AssertUnwindSafe(call)
            .catch_unwind()
            .await
            .map_err(|panic| InvokeError::Panicked(panic_message(panic.as_ref())))
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
