use thiserror::Error;

use crate::domain::OperationKind;

/// Failure decoding an event from the external event-stream surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command name '{0}'")]
    UnknownCommand(String),
    #[error("unknown status '{status}' on {channel}")]
    UnknownStatus {
        channel: &'static str,
        status: String,
    },
    #[error("unknown output stream '{0}'")]
    UnknownStream(String),
    #[error("{0} identity requires a sub-stream")]
    MissingSubStream(OperationKind),
    #[error("{0} identity does not take a sub-stream")]
    UnexpectedSubStream(OperationKind),
    #[error("unknown event channel '{0}'")]
    UnknownChannel(String),
    #[error("malformed {channel} payload: {reason}")]
    Malformed {
        channel: &'static str,
        reason: String,
    },
}
