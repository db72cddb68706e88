use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::{
    domain::{OperationIdentity, OperationKind, ProcessHandle, SubStream, Target},
    protocol::{
        CreateProjectParams, ExportDbParams, ImportDbParams, LogsParams, OperationParams,
        OperationRequest, RuntimeVersionParams, StatusEvent, StatusPhase,
    },
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::{
    bus::{BusListener, EventBus, Subscription},
    cancellation::CancellationController,
    error::DispatchError,
    CommandSurface, NoopRefresher, ReadModelRefresher,
};

/// Delay between a successful dispatch and the read-model refresh it schedules.
///
/// The external tool reports state that lags the command's side effect by roughly this much.
/// It is an empirical heuristic, not an ordering guarantee; tune it through settings.
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_millis(1000);

pub type DispatchResult = Result<Option<ProcessHandle>, DispatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightStatus {
    /// Dispatch issued, no `Started` seen yet.
    Pending,
    Started,
}

#[derive(Debug, Clone)]
struct InFlight {
    status: InFlightStatus,
    handle: Option<ProcessHandle>,
}

#[derive(Debug, Default)]
struct InFlightTable {
    entries: HashMap<OperationIdentity, InFlight>,
    /// Handles of runs abandoned by their session; their late events must not touch a
    /// newer run of the same identity.
    released: HashSet<ProcessHandle>,
}

impl InFlightTable {
    fn apply(&mut self, event: &StatusEvent) {
        if let Some(handle) = &event.process_handle {
            if self.released.contains(handle) {
                if event.phase.is_terminal() {
                    self.released.remove(handle);
                }
                debug!(
                    identity = %event.identity,
                    handle = %handle,
                    "event for released run ignored"
                );
                return;
            }
        }
        let Some(entry) = self.entries.get_mut(&event.identity) else {
            return;
        };
        // A handle on both sides that differs belongs to another run.
        if let (Some(known), Some(reported)) = (&entry.handle, &event.process_handle) {
            if known != reported {
                return;
            }
        }

        match event.phase {
            StatusPhase::Started => {
                entry.status = InFlightStatus::Started;
                if event.process_handle.is_some() {
                    entry.handle = event.process_handle.clone();
                }
            }
            StatusPhase::Progress => {}
            StatusPhase::Finished | StatusPhase::Error | StatusPhase::Cancelled => {
                self.entries.remove(&event.identity);
                debug!(identity = %event.identity, phase = ?event.phase, "operation left flight");
            }
        }
    }
}

type InFlightMap = Arc<Mutex<InFlightTable>>;

fn lock(map: &InFlightMap) -> MutexGuard<'_, InFlightTable> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

struct InFlightTracker {
    in_flight: InFlightMap,
}

impl BusListener for InFlightTracker {
    fn on_status(&self, event: &StatusEvent) {
        lock(&self.in_flight).apply(event);
    }
}

/// Per-kind entry point for issuing operations against the command surface.
///
/// The dispatcher forwards calls without re-validating business preconditions. It does refuse
/// a second dispatch for an identity that is still in flight, where "in flight" spans from the
/// dispatch call until the matching terminal status event, a transport rejection, or the
/// owning session abandoning the run through [`OperationDispatcher::release`].
#[derive(Clone)]
pub struct OperationDispatcher {
    bus: EventBus,
    surface: Arc<dyn CommandSurface>,
    in_flight: InFlightMap,
    refresher: Arc<dyn ReadModelRefresher>,
    refresh_delay: Duration,
    _tracker: Arc<Subscription>,
}

impl OperationDispatcher {
    pub fn new(bus: &EventBus, surface: Arc<dyn CommandSurface>) -> Self {
        let in_flight: InFlightMap = Arc::default();
        let tracker = bus.subscribe(Arc::new(InFlightTracker {
            in_flight: Arc::clone(&in_flight),
        }));

        Self {
            bus: bus.clone(),
            surface,
            in_flight,
            refresher: Arc::new(NoopRefresher),
            refresh_delay: DEFAULT_REFRESH_DELAY,
            _tracker: Arc::new(tracker),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn ReadModelRefresher>) -> Self {
        self.refresher = refresher;
        self
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Controller that cancels through the same surface this dispatcher executes on.
    pub fn cancellation(&self) -> CancellationController {
        CancellationController::new(Arc::clone(&self.surface))
    }

    pub fn handle_for(&self, identity: &OperationIdentity) -> Option<ProcessHandle> {
        lock(&self.in_flight)
            .entries
            .get(identity)
            .and_then(|entry| entry.handle.clone())
    }

    /// Reverse of [`Self::handle_for`], for producers that report by handle only.
    pub fn identity_for(&self, handle: &ProcessHandle) -> Option<OperationIdentity> {
        lock(&self.in_flight)
            .entries
            .iter()
            .find(|(_, entry)| entry.handle.as_ref() == Some(handle))
            .map(|(identity, _)| identity.clone())
    }

    pub fn status_of(&self, identity: &OperationIdentity) -> Option<InFlightStatus> {
        lock(&self.in_flight)
            .entries
            .get(identity)
            .map(|entry| entry.status)
    }

    pub fn is_in_flight(&self, identity: &OperationIdentity) -> bool {
        lock(&self.in_flight).entries.contains_key(identity)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).entries.len()
    }

    /// Forgets the in-flight run of `identity` so it can be dispatched again right away.
    ///
    /// Called by a session that abandons its run after requesting cancellation. Late events
    /// carrying the abandoned handle (`handle`, or the one tracked here) are ignored.
    pub fn release(&self, identity: &OperationIdentity, handle: Option<&ProcessHandle>) {
        let mut in_flight = lock(&self.in_flight);
        let tracked = in_flight
            .entries
            .remove(identity)
            .and_then(|entry| entry.handle);
        for handle in tracked.into_iter().chain(handle.cloned()) {
            in_flight.released.insert(handle);
        }
        debug!(identity = %identity, "in-flight entry released");
    }

    /// Issues `request`. `Ok` means the surface accepted the request; completion arrives
    /// later on the bus. `Err` means the operation never started.
    pub async fn dispatch(&self, request: OperationRequest) -> DispatchResult {
        let identity = request.identity.clone();
        let kind = identity.kind();
        if !request.params.fits(kind) {
            return Err(DispatchError::InvalidParams(kind));
        }

        {
            let mut in_flight = lock(&self.in_flight);
            if in_flight.entries.contains_key(&identity) {
                debug!(identity = %identity, "dispatch refused; identity already in flight");
                return Err(DispatchError::AlreadyInFlight(identity));
            }
            in_flight.entries.insert(
                identity.clone(),
                InFlight {
                    status: InFlightStatus::Pending,
                    handle: None,
                },
            );
        }

        debug!(identity = %identity, "dispatching operation");
        match self.surface.execute(&request).await {
            Ok(handle) => {
                if let Some(handle) = &handle {
                    if let Some(entry) = lock(&self.in_flight).entries.get_mut(&identity) {
                        entry.handle.get_or_insert_with(|| handle.clone());
                    }
                }
                if kind.refreshes_read_model() {
                    self.schedule_refresh(kind, identity.target().clone());
                }
                Ok(handle)
            }
            Err(err) => {
                let mut in_flight = lock(&self.in_flight);
                // A producer that already announced Started keeps the entry until its
                // terminal event.
                if matches!(
                    in_flight.entries.get(&identity),
                    Some(entry) if entry.status == InFlightStatus::Pending
                ) {
                    in_flight.entries.remove(&identity);
                }
                warn!(identity = %identity, error = %err, "dispatch rejected");
                Err(err)
            }
        }
    }

    fn schedule_refresh(&self, kind: OperationKind, target: Target) {
        let Ok(runtime) = Handle::try_current() else {
            debug!(%kind, %target, "no async runtime available; refresh skipped");
            return;
        };
        let refresher = Arc::clone(&self.refresher);
        let delay = self.refresh_delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(%kind, %target, "refreshing read model");
            refresher.refresh(kind, &target);
        });
    }

    async fn dispatch_target(
        &self,
        kind: OperationKind,
        target: Target,
        params: OperationParams,
    ) -> DispatchResult {
        self.dispatch(OperationRequest::new(
            OperationIdentity::Target { kind, target },
            params,
        ))
        .await
    }

    pub async fn start(&self, target: impl Into<Target>) -> DispatchResult {
        self.dispatch_target(OperationKind::Start, target.into(), OperationParams::None)
            .await
    }

    pub async fn stop(&self, target: impl Into<Target>) -> DispatchResult {
        self.dispatch_target(OperationKind::Stop, target.into(), OperationParams::None)
            .await
    }

    pub async fn restart(&self, target: impl Into<Target>) -> DispatchResult {
        self.dispatch_target(OperationKind::Restart, target.into(), OperationParams::None)
            .await
    }

    pub async fn delete(&self, target: impl Into<Target>) -> DispatchResult {
        self.dispatch_target(OperationKind::Delete, target.into(), OperationParams::None)
            .await
    }

    pub async fn poweroff_all(&self) -> DispatchResult {
        self.dispatch(OperationRequest::new(
            OperationIdentity::poweroff_all(),
            OperationParams::None,
        ))
        .await
    }

    pub async fn import_db(
        &self,
        target: impl Into<Target>,
        params: ImportDbParams,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::ImportDb,
            target.into(),
            OperationParams::ImportDb(params),
        )
        .await
    }

    pub async fn export_db(
        &self,
        target: impl Into<Target>,
        params: ExportDbParams,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::ExportDb,
            target.into(),
            OperationParams::ExportDb(params),
        )
        .await
    }

    pub async fn create_snapshot(
        &self,
        target: impl Into<Target>,
        name: Option<String>,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::CreateSnapshot,
            target.into(),
            OperationParams::CreateSnapshot { name },
        )
        .await
    }

    pub async fn restore_snapshot(
        &self,
        target: impl Into<Target>,
        name: impl Into<String>,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::RestoreSnapshot,
            target.into(),
            OperationParams::Snapshot { name: name.into() },
        )
        .await
    }

    pub async fn delete_snapshot(
        &self,
        target: impl Into<Target>,
        name: impl Into<String>,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::DeleteSnapshot,
            target.into(),
            OperationParams::Snapshot { name: name.into() },
        )
        .await
    }

    pub async fn cleanup_snapshots(&self, target: impl Into<Target>) -> DispatchResult {
        self.dispatch_target(
            OperationKind::CleanupSnapshots,
            target.into(),
            OperationParams::None,
        )
        .await
    }

    pub async fn addon_install(
        &self,
        target: impl Into<Target>,
        addon: impl Into<String>,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::AddonInstall,
            target.into(),
            OperationParams::Addon {
                addon: addon.into(),
            },
        )
        .await
    }

    pub async fn addon_remove(
        &self,
        target: impl Into<Target>,
        addon: impl Into<String>,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::AddonRemove,
            target.into(),
            OperationParams::Addon {
                addon: addon.into(),
            },
        )
        .await
    }

    pub async fn change_runtime_version(
        &self,
        target: impl Into<Target>,
        params: RuntimeVersionParams,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::ChangeRuntimeVersion,
            target.into(),
            OperationParams::RuntimeVersion(params),
        )
        .await
    }

    pub async fn get_logs(
        &self,
        target: impl Into<Target>,
        service: impl Into<SubStream>,
        params: LogsParams,
    ) -> DispatchResult {
        self.dispatch(OperationRequest::new(
            OperationIdentity::logs(target, service),
            OperationParams::Logs(params),
        ))
        .await
    }

    pub async fn create_project(
        &self,
        name: impl Into<Target>,
        params: CreateProjectParams,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::CreateProject,
            name.into(),
            OperationParams::CreateProject(params),
        )
        .await
    }

    pub async fn capture_screenshot(
        &self,
        target: impl Into<Target>,
        url: impl Into<String>,
    ) -> DispatchResult {
        self.dispatch_target(
            OperationKind::CaptureScreenshot,
            target.into(),
            OperationParams::Screenshot { url: url.into() },
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
