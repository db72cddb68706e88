use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{OperationIdentity, ProcessHandle},
    protocol::{OperationParams, OperationRequest, OutputEvent, StatusEvent, StatusPhase},
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::{
    bus::{BusListener, Subscription},
    cancellation::CancellationController,
    dispatcher::{DispatchResult, OperationDispatcher},
    error::{DispatchError, SessionError},
    log_follow::LogLine,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Dispatch issued; the producer has not announced the process yet.
    Pending,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    Failure,
    UserCancelled,
}

impl OperationOutcome {
    fn from_phase(phase: StatusPhase) -> Option<Self> {
        match phase {
            StatusPhase::Finished => Some(Self::Success),
            StatusPhase::Error => Some(Self::Failure),
            StatusPhase::Cancelled => Some(Self::UserCancelled),
            StatusPhase::Started | StatusPhase::Progress => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Started,
    Resolved(OperationOutcome),
}

/// One-shot notification for the owner of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotice {
    pub identity: OperationIdentity,
    pub kind: NoticeKind,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

pub type SessionNotices = mpsc::UnboundedReceiver<SessionNotice>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub identity: OperationIdentity,
    pub state: SessionState,
    pub process_handle: Option<ProcessHandle>,
    pub last_progress_line: Option<String>,
    pub last_outcome: Option<OperationOutcome>,
}

#[derive(Debug)]
struct Operation {
    identity: OperationIdentity,
    state: SessionState,
    process_handle: Option<ProcessHandle>,
    last_progress_line: Option<String>,
}

struct SessionInner {
    identity: OperationIdentity,
    operation: Option<Operation>,
    subscription: Option<Subscription>,
    /// Bumped whenever an operation ends, so listeners of earlier runs go inert.
    generation: u64,
    last_outcome: Option<OperationOutcome>,
    buffer: Option<Vec<LogLine>>,
    /// Processes of torn-down runs; their late events never apply to a newer run.
    abandoned: HashSet<ProcessHandle>,
}

struct SessionShared {
    inner: Mutex<SessionInner>,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, identity: &OperationIdentity, kind: NoticeKind, message: Option<String>) {
        // The owner may have stopped listening; the session keeps working regardless.
        let _ = self.notices.send(SessionNotice {
            identity: identity.clone(),
            kind,
            message,
            at: Utc::now(),
        });
    }

    fn apply_status(&self, generation: u64, event: &StatusEvent) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.generation != generation {
            trace!(identity = %event.identity, "status for a finished run ignored");
            return;
        }
        let Some(operation) = inner.operation.as_mut() else {
            return;
        };
        if !event.identity.matches(&operation.identity) {
            return;
        }
        if let Some(handle) = &event.process_handle {
            let other_run = inner.abandoned.contains(handle)
                || operation.process_handle.as_ref().is_some_and(|known| known != handle);
            if other_run {
                debug!(
                    identity = %event.identity,
                    handle = %handle,
                    "event for another run ignored"
                );
                return;
            }
        }

        match event.phase {
            StatusPhase::Started => {
                if operation.state == SessionState::Started {
                    debug!(identity = %event.identity, "duplicate started ignored");
                    return;
                }
                operation.state = SessionState::Started;
                if event.process_handle.is_some() {
                    operation.process_handle = event.process_handle.clone();
                }
                if event.message.is_some() {
                    operation.last_progress_line = event.message.clone();
                }
                debug!(
                    identity = %event.identity,
                    handle = ?operation.process_handle,
                    "operation started"
                );
                self.notify(&event.identity, NoticeKind::Started, event.message.clone());
            }
            StatusPhase::Progress => {
                if event.message.is_some() {
                    operation.last_progress_line = event.message.clone();
                }
            }
            phase => {
                let Some(outcome) = OperationOutcome::from_phase(phase) else {
                    return;
                };
                inner.operation = None;
                inner.generation += 1;
                inner.last_outcome = Some(outcome);
                if let Some(subscription) = inner.subscription.take() {
                    subscription.dispose();
                }
                info!(identity = %event.identity, ?outcome, "operation resolved");
                self.notify(
                    &event.identity,
                    NoticeKind::Resolved(outcome),
                    event.message.clone(),
                );
            }
        }
    }

    fn apply_output(&self, generation: u64, event: &OutputEvent) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.generation != generation {
            return;
        }
        let Some(operation) = inner.operation.as_mut() else {
            return;
        };
        if !event.belongs_to(&operation.identity) {
            return;
        }
        operation.last_progress_line = Some(event.line.clone());
        if let Some(buffer) = inner.buffer.as_mut() {
            buffer.push(LogLine::from_event(event));
        }
    }
}

struct SessionListener {
    shared: Weak<SessionShared>,
    generation: u64,
}

impl BusListener for SessionListener {
    fn on_status(&self, event: &StatusEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.apply_status(self.generation, event);
        }
    }

    fn on_output(&self, event: &OutputEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.apply_output(self.generation, event);
        }
    }
}

/// Tracks at most one operation for a single identity and reports how it ended.
///
/// `Idle -> Pending` on dispatch, `Pending -> Started` on the matching bus `Started`, and back
/// to `Idle` on the matching terminal status, which also emits exactly one
/// [`NoticeKind::Resolved`]. There is no timeout: an operation whose producer never reports a
/// terminal phase stays `Started` until the session is torn down.
///
/// Dropping the session tears it down.
pub struct OperationSession {
    shared: Arc<SessionShared>,
    dispatcher: OperationDispatcher,
    cancellation: CancellationController,
}

impl OperationSession {
    pub fn open(
        dispatcher: &OperationDispatcher,
        cancellation: CancellationController,
        identity: OperationIdentity,
    ) -> (Self, SessionNotices) {
        Self::build(dispatcher, cancellation, identity, None)
    }

    /// Session that also keeps every output line it accepts.
    pub(crate) fn open_buffered(
        dispatcher: &OperationDispatcher,
        cancellation: CancellationController,
        identity: OperationIdentity,
    ) -> (Self, SessionNotices) {
        Self::build(dispatcher, cancellation, identity, Some(Vec::new()))
    }

    fn build(
        dispatcher: &OperationDispatcher,
        cancellation: CancellationController,
        identity: OperationIdentity,
        buffer: Option<Vec<LogLine>>,
    ) -> (Self, SessionNotices) {
        let (notices, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            inner: Mutex::new(SessionInner {
                identity,
                operation: None,
                subscription: None,
                generation: 0,
                last_outcome: None,
                buffer,
                abandoned: HashSet::new(),
            }),
            notices,
        });

        (
            Self {
                shared,
                dispatcher: dispatcher.clone(),
                cancellation,
            },
            rx,
        )
    }

    pub fn identity(&self) -> OperationIdentity {
        self.shared.lock().identity.clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .lock()
            .operation
            .as_ref()
            .map_or(SessionState::Idle, |operation| operation.state)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.shared.lock();
        let operation = inner.operation.as_ref();
        SessionSnapshot {
            identity: inner.identity.clone(),
            state: operation.map_or(SessionState::Idle, |operation| operation.state),
            process_handle: operation.and_then(|operation| operation.process_handle.clone()),
            last_progress_line: operation
                .and_then(|operation| operation.last_progress_line.clone()),
            last_outcome: inner.last_outcome,
        }
    }

    /// Starts a new operation for the session's identity.
    ///
    /// Subscribes before the dispatch call so an eager producer cannot slip its `Started`
    /// past the session. On rejection the session reverts to `Idle` and nothing is notified,
    /// unless the producer had already announced the process.
    pub async fn dispatch(&self, params: OperationParams) -> DispatchResult {
        let (identity, generation) = {
            let mut inner = self.shared.lock();
            if let Some(operation) = &inner.operation {
                return Err(DispatchError::SessionBusy(operation.identity.clone()));
            }
            let identity = inner.identity.clone();
            let generation = inner.generation;
            inner.subscription = Some(self.dispatcher.bus().subscribe(Arc::new(SessionListener {
                shared: Arc::downgrade(&self.shared),
                generation,
            })));
            inner.operation = Some(Operation {
                identity: identity.clone(),
                state: SessionState::Pending,
                process_handle: None,
                last_progress_line: None,
            });
            (identity, generation)
        };

        let result = self
            .dispatcher
            .dispatch(OperationRequest::new(identity, params))
            .await;

        let mut inner = self.shared.lock();
        if inner.generation != generation {
            return result;
        }
        match &result {
            Ok(handle) => {
                if let (Some(operation), Some(handle)) = (inner.operation.as_mut(), handle) {
                    operation.process_handle.get_or_insert_with(|| handle.clone());
                }
            }
            Err(_) => {
                let pending = matches!(
                    inner.operation.as_ref(),
                    Some(operation) if operation.state == SessionState::Pending
                );
                if pending {
                    inner.operation = None;
                    inner.generation += 1;
                    if let Some(subscription) = inner.subscription.take() {
                        subscription.dispose();
                    }
                }
            }
        }
        result
    }

    /// Requests cooperative cancellation of the current operation. The state only changes
    /// when the producer reports the terminal phase. Returns whether a request was sent.
    pub fn cancel(&self) -> bool {
        let (identity, handle) = {
            let inner = self.shared.lock();
            match inner.operation.as_ref() {
                Some(operation) => (operation.identity.clone(), operation.process_handle.clone()),
                None => return false,
            }
        };
        let handle = handle.or_else(|| self.dispatcher.handle_for(&identity));
        self.cancellation.cancel(handle.as_ref()).is_some()
    }

    /// Stops tracking immediately: best-effort cancel if a handle is known, then unsubscribe.
    /// The identity is released in the dispatcher so it can be dispatched again without
    /// waiting for the cancellation to be acknowledged. No notice is emitted for the abandoned
    /// operation. Safe to call repeatedly.
    pub fn teardown(&self) {
        let (abandoned, subscription) = {
            let mut inner = self.shared.lock();
            let abandoned = inner.operation.take().map(|operation| {
                let handle = operation
                    .process_handle
                    .or_else(|| self.dispatcher.handle_for(&operation.identity));
                (operation.identity, handle)
            });
            if let Some((_, handle)) = &abandoned {
                inner.generation += 1;
                inner.abandoned.extend(handle.clone());
            }
            (abandoned, inner.subscription.take())
        };

        if let Some((identity, handle)) = abandoned {
            debug!(identity = %identity, handle = ?handle, "tearing down session");
            self.cancellation.cancel(handle.as_ref());
            self.dispatcher.release(&identity, handle.as_ref());
        }
        if let Some(subscription) = subscription {
            subscription.dispose();
        }
    }

    /// Points an idle session at another identity of the same kind.
    pub fn retarget(&self, identity: OperationIdentity) -> Result<(), SessionError> {
        let mut inner = self.shared.lock();
        if let Some(operation) = &inner.operation {
            return Err(SessionError::NotIdle(operation.identity.clone()));
        }
        if inner.identity.kind() != identity.kind() {
            return Err(SessionError::KindMismatch {
                bound: inner.identity.kind(),
                requested: identity.kind(),
            });
        }
        inner.identity = identity;
        Ok(())
    }

    pub(crate) fn buffered_lines(&self) -> Vec<LogLine> {
        self.shared.lock().buffer.clone().unwrap_or_default()
    }

    pub(crate) fn clear_buffer(&self) {
        if let Some(buffer) = self.shared.lock().buffer.as_mut() {
            buffer.clear();
        }
    }
}

impl Drop for OperationSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
