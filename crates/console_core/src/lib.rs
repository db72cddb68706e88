//! Operation orchestration core for the project management console.
//!
//! Background commands are dispatched through a [`CommandSurface`]; their progress comes back
//! as status and output events on a shared [`EventBus`], where each [`OperationSession`]
//! picks out the events that belong to its own operation identity.

use async_trait::async_trait;
use shared::{
    domain::{OperationKind, ProcessHandle, Target},
    protocol::OperationRequest,
};

pub mod bus;
pub mod cancellation;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ingress;
pub mod log_follow;
pub mod runner;
pub mod session;

#[cfg(test)]
mod test_support;

pub use bus::{BusListener, EventBus, Subscription};
pub use cancellation::CancellationController;
pub use config::{load_settings, ConsoleSettings};
pub use dispatcher::OperationDispatcher;
pub use error::{CancelError, DispatchError, SessionError};
pub use ingress::EventIngress;
pub use log_follow::{LogFollowSession, LogLine, LogMode};
pub use runner::ProcessCommandSurface;
pub use session::{
    NoticeKind, OperationOutcome, OperationSession, SessionNotice, SessionNotices,
    SessionSnapshot, SessionState,
};

/// Whatever actually runs the external commands.
///
/// `execute` only requests the start of a long-running process. Completion is observable
/// later through the event bus. Some surfaces resolve with the process handle, others leave
/// it to the first `Started` event.
#[async_trait]
pub trait CommandSurface: Send + Sync {
    async fn execute(
        &self,
        request: &OperationRequest,
    ) -> Result<Option<ProcessHandle>, DispatchError>;

    async fn cancel(&self, handle: &ProcessHandle) -> Result<(), CancelError>;
}

pub struct MissingCommandSurface;

#[async_trait]
impl CommandSurface for MissingCommandSurface {
    async fn execute(
        &self,
        request: &OperationRequest,
    ) -> Result<Option<ProcessHandle>, DispatchError> {
        Err(DispatchError::Unavailable(format!(
            "no command surface configured for {}",
            request.identity
        )))
    }

    async fn cancel(&self, handle: &ProcessHandle) -> Result<(), CancelError> {
        Err(CancelError::NotFound(handle.clone()))
    }
}

/// Invalidation hook for the read model behind a target (project list, project details).
pub trait ReadModelRefresher: Send + Sync {
    fn refresh(&self, kind: OperationKind, target: &Target);
}

pub struct NoopRefresher;

impl ReadModelRefresher for NoopRefresher {
    fn refresh(&self, _kind: OperationKind, _target: &Target) {}
}
