use std::sync::Arc;

use shared::domain::ProcessHandle;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, warn};

use crate::{error::CancelError, CommandSurface};

/// Turns a process handle into a best-effort cancellation request.
///
/// Issuing a request never touches session state. The owning session resolves only when the
/// producer reports the matching `cancelled` (or a competing `finished`/`error`) status.
#[derive(Clone)]
pub struct CancellationController {
    surface: Arc<dyn CommandSurface>,
}

impl CancellationController {
    pub fn new(surface: Arc<dyn CommandSurface>) -> Self {
        Self { surface }
    }

    /// Fire-and-forget. Returns the spawned request task, or `None` when there was nothing to
    /// send (no handle, or no runtime to send it from). Failures of the request are logged
    /// and swallowed so this is safe to call from teardown paths.
    pub fn cancel(&self, handle: Option<&ProcessHandle>) -> Option<JoinHandle<()>> {
        let Some(handle) = handle else {
            debug!("cancel requested without a process handle; nothing to do");
            return None;
        };

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(handle = %handle, "no async runtime available; cancellation request dropped");
                return None;
            }
        };

        let surface = Arc::clone(&self.surface);
        let handle = handle.clone();
        Some(runtime.spawn(async move {
            match surface.cancel(&handle).await {
                Ok(()) => debug!(handle = %handle, "cancellation requested"),
                Err(CancelError::NotFound(_)) => {
                    debug!(handle = %handle, "process already completed; cancellation ignored")
                }
                Err(err) => warn!(handle = %handle, error = %err, "cancellation request failed"),
            }
        }))
    }
}

#[cfg(test)]
#[path = "tests/cancellation_tests.rs"]
mod tests;
