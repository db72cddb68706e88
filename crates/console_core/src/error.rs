use shared::domain::{OperationIdentity, OperationKind, ProcessHandle};
use thiserror::Error;

/// Failure of the dispatch call itself, before any `Started` event was observed.
///
/// Distinct from a runtime failure, which arrives later as an `Error` status event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("operation {0} is already in flight")]
    AlreadyInFlight(OperationIdentity),
    #[error("session is already tracking operation {0}")]
    SessionBusy(OperationIdentity),
    #[error("parameters do not fit a {0} operation")]
    InvalidParams(OperationKind),
    #[error("{0} is not supported by this command surface")]
    Unsupported(OperationKind),
    #[error("command surface rejected {identity}: {reason}")]
    Rejected {
        identity: OperationIdentity,
        reason: String,
    },
    #[error("command surface unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("process {0} not found or already completed")]
    NotFound(ProcessHandle),
    #[error("cancellation transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("cannot retarget while {0} is in flight")]
    NotIdle(OperationIdentity),
    #[error("session is bound to {bound} operations, not {requested}")]
    KindMismatch {
        bound: OperationKind,
        requested: OperationKind,
    },
}
