use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{OperationIdentity, OperationKind, ProcessHandle, Target},
    protocol::{OperationRequest, OutputEvent, StatusEvent},
};

use crate::{
    bus::{BusListener, EventBus},
    error::{CancelError, DispatchError},
    CommandSurface, ReadModelRefresher,
};

pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Stand-in for the external tool. Records every call and, when given a bus, plays the
/// producer side of the protocol synchronously.
#[derive(Default)]
pub(crate) struct FakeCommandSurface {
    bus: Option<EventBus>,
    announce_started: bool,
    return_handle: bool,
    acknowledge_cancel: bool,
    reject_with: Mutex<Option<String>>,
    fail_cancel: bool,
    next_handle: AtomicU64,
    live: Mutex<HashMap<ProcessHandle, OperationIdentity>>,
    executed: Mutex<Vec<OperationRequest>>,
    cancelled: Mutex<Vec<ProcessHandle>>,
}

impl FakeCommandSurface {
    /// Resolves `execute` with a handle and never publishes anything.
    pub(crate) fn silent() -> Self {
        Self {
            return_handle: true,
            ..Self::default()
        }
    }

    /// Publishes `Started` (with handle) from inside `execute`, and `Cancelled` when a known
    /// handle is cancelled.
    pub(crate) fn announcing(bus: &EventBus) -> Self {
        Self {
            bus: Some(bus.clone()),
            announce_started: true,
            return_handle: true,
            acknowledge_cancel: true,
            ..Self::default()
        }
    }

    /// Like `announcing`, but `execute` resolves with no handle.
    pub(crate) fn announcing_without_handle(bus: &EventBus) -> Self {
        Self {
            return_handle: false,
            ..Self::announcing(bus)
        }
    }

    pub(crate) fn rejecting(reason: impl Into<String>) -> Self {
        let surface = Self::default();
        surface.reject_next(reason);
        surface
    }

    pub(crate) fn with_failing_cancel(mut self) -> Self {
        self.fail_cancel = true;
        self
    }

    pub(crate) fn reject_next(&self, reason: impl Into<String>) {
        *self.reject_with.lock().expect("reject lock") = Some(reason.into());
    }

    pub(crate) fn executed(&self) -> Vec<OperationRequest> {
        self.executed.lock().expect("executed lock").clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<ProcessHandle> {
        self.cancelled.lock().expect("cancelled lock").clone()
    }

    /// Handle the fake issued for `identity`, if it is still live.
    pub(crate) fn handle_of(&self, identity: &OperationIdentity) -> Option<ProcessHandle> {
        self.live
            .lock()
            .expect("live lock")
            .iter()
            .find(|(_, live)| *live == identity)
            .map(|(handle, _)| handle.clone())
    }
}

#[async_trait]
impl CommandSurface for FakeCommandSurface {
    async fn execute(
        &self,
        request: &OperationRequest,
    ) -> Result<Option<ProcessHandle>, DispatchError> {
        self.executed
            .lock()
            .expect("executed lock")
            .push(request.clone());

        if let Some(reason) = self.reject_with.lock().expect("reject lock").take() {
            return Err(DispatchError::Rejected {
                identity: request.identity.clone(),
                reason,
            });
        }

        let handle = ProcessHandle::new(format!(
            "proc_{}",
            self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
        ));
        self.live
            .lock()
            .expect("live lock")
            .insert(handle.clone(), request.identity.clone());

        if let (true, Some(bus)) = (self.announce_started, &self.bus) {
            bus.publish_status(
                &StatusEvent::started(request.identity.clone(), Some(handle.clone()))
                    .with_message(format!("Running: {}", request.identity)),
            );
        }

        Ok(self.return_handle.then_some(handle))
    }

    async fn cancel(&self, handle: &ProcessHandle) -> Result<(), CancelError> {
        self.cancelled
            .lock()
            .expect("cancelled lock")
            .push(handle.clone());

        if self.fail_cancel {
            return Err(CancelError::Transport("pipe closed".into()));
        }
        let identity = self
            .live
            .lock()
            .expect("live lock")
            .remove(handle)
            .ok_or_else(|| CancelError::NotFound(handle.clone()))?;

        if let (true, Some(bus)) = (self.acknowledge_cancel, &self.bus) {
            let mut event =
                StatusEvent::cancelled(identity).with_message("Command was cancelled by user");
            event.process_handle = Some(handle.clone());
            bus.publish_status(&event);
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    statuses: Mutex<Vec<StatusEvent>>,
    outputs: Mutex<Vec<OutputEvent>>,
}

impl RecordingListener {
    pub(crate) fn statuses(&self) -> Vec<StatusEvent> {
        self.statuses.lock().expect("statuses lock").clone()
    }

    pub(crate) fn outputs(&self) -> Vec<OutputEvent> {
        self.outputs.lock().expect("outputs lock").clone()
    }
}

impl BusListener for RecordingListener {
    fn on_status(&self, event: &StatusEvent) {
        self.statuses
            .lock()
            .expect("statuses lock")
            .push(event.clone());
    }

    fn on_output(&self, event: &OutputEvent) {
        self.outputs
            .lock()
            .expect("outputs lock")
            .push(event.clone());
    }
}

#[derive(Default)]
pub(crate) struct RecordingRefresher {
    refreshed: Mutex<Vec<(OperationKind, Target)>>,
}

impl RecordingRefresher {
    pub(crate) fn refreshed(&self) -> Vec<(OperationKind, Target)> {
        self.refreshed.lock().expect("refreshed lock").clone()
    }
}

impl ReadModelRefresher for RecordingRefresher {
    fn refresh(&self, kind: OperationKind, target: &Target) {
        self.refreshed
            .lock()
            .expect("refreshed lock")
            .push((kind, target.clone()));
    }
}

pub(crate) fn identity(kind: OperationKind, target: &str) -> OperationIdentity {
    OperationIdentity::target_of(kind, target).expect("target-shaped identity")
}
