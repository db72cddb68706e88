use shared::{
    domain::{OperationKind, Target},
    protocol::OutputStream,
};
use tokio::{sync::mpsc::error::TryRecvError, time::timeout};

use super::*;
use crate::{
    bus::EventBus,
    test_support::{identity, FakeCommandSurface, TEST_TIMEOUT},
};

struct Harness {
    bus: EventBus,
    surface: Arc<FakeCommandSurface>,
    dispatcher: OperationDispatcher,
}

impl Harness {
    fn announcing() -> Self {
        let bus = EventBus::new();
        let surface = Arc::new(FakeCommandSurface::announcing(&bus));
        Self::with_surface(bus, surface)
    }

    fn with_surface(bus: EventBus, surface: Arc<FakeCommandSurface>) -> Self {
        let dispatcher = OperationDispatcher::new(&bus, surface.clone());
        Self {
            bus,
            surface,
            dispatcher,
        }
    }

    fn open(&self, kind: OperationKind, target: &str) -> (OperationSession, SessionNotices) {
        OperationSession::open(
            &self.dispatcher,
            self.dispatcher.cancellation(),
            identity(kind, target),
        )
    }
}

fn drain(notices: &mut SessionNotices) -> Vec<NoticeKind> {
    let mut kinds = Vec::new();
    loop {
        match notices.try_recv() {
            Ok(notice) => kinds.push(notice.kind),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => return kinds,
        }
    }
}

async fn wait_for_cancel(surface: &FakeCommandSurface, count: usize) {
    timeout(TEST_TIMEOUT, async {
        while surface.cancelled().len() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("cancellation request arrives");
}

#[tokio::test]
async fn dispatch_moves_through_pending_started_idle() {
    let bus = EventBus::new();
    let surface = Arc::new(FakeCommandSurface::silent());
    let harness = Harness::with_surface(bus, surface);
    let (session, mut notices) = harness.open(OperationKind::Start, "siteA");
    let start_a = identity(OperationKind::Start, "siteA");

    assert_eq!(session.state(), SessionState::Idle);
    session.dispatch(OperationParams::None).await.expect("dispatch");
    assert_eq!(session.state(), SessionState::Pending);

    harness.bus.publish_status(
        &StatusEvent::started(start_a.clone(), None).with_message("Starting siteA"),
    );
    assert_eq!(session.state(), SessionState::Started);
    assert_eq!(
        session.snapshot().last_progress_line.as_deref(),
        Some("Starting siteA")
    );

    harness.bus.publish_status(
        &StatusEvent::finished(start_a).with_message("Command completed successfully"),
    );
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.snapshot().last_outcome, Some(OperationOutcome::Success));
    assert_eq!(
        drain(&mut notices),
        vec![
            NoticeKind::Started,
            NoticeKind::Resolved(OperationOutcome::Success)
        ]
    );
}

#[tokio::test]
async fn events_for_other_identities_are_ignored() {
    let harness = Harness::announcing();
    let (session, mut notices) = harness.open(OperationKind::Start, "siteA");
    session.dispatch(OperationParams::None).await.expect("dispatch");
    let before = session.snapshot();
    drain(&mut notices);

    harness
        .bus
        .publish_status(&StatusEvent::finished(identity(OperationKind::Start, "siteB")));
    harness
        .bus
        .publish_status(&StatusEvent::error(identity(OperationKind::Restart, "siteA"), "boom"));
    harness.bus.publish_output(&OutputEvent {
        target: Some(Target::new("siteB")),
        sub_stream: None,
        line: "Starting siteB".into(),
        stream: OutputStream::Primary,
    });

    assert_eq!(session.snapshot(), before);
    assert!(drain(&mut notices).is_empty());
}

#[tokio::test]
async fn duplicate_started_keeps_progress_and_notifies_once() {
    let harness = Harness::announcing();
    let (session, mut notices) = harness.open(OperationKind::Restart, "siteA");
    let restart_a = identity(OperationKind::Restart, "siteA");

    session.dispatch(OperationParams::None).await.expect("dispatch");
    harness.bus.publish_output(&OutputEvent::for_identity(
        &restart_a,
        "Restarting containers",
        OutputStream::Primary,
    ));
    harness.bus.publish_status(
        &StatusEvent::started(restart_a.clone(), Some(ProcessHandle::new("proc_99")))
            .with_message("Running again"),
    );

    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Started);
    assert_eq!(
        snapshot.last_progress_line.as_deref(),
        Some("Restarting containers")
    );
    assert_eq!(snapshot.process_handle, Some(ProcessHandle::new("proc_1")));
    assert_eq!(drain(&mut notices), vec![NoticeKind::Started]);
}

#[tokio::test]
async fn exactly_one_terminal_notice_per_operation() {
    let harness = Harness::announcing();
    let (session, mut notices) = harness.open(OperationKind::Stop, "siteA");
    let stop_a = identity(OperationKind::Stop, "siteA");

    session.dispatch(OperationParams::None).await.expect("dispatch");
    harness.bus.publish_status(&StatusEvent::error(stop_a.clone(), "Command failed"));
    harness.bus.publish_status(&StatusEvent::finished(stop_a.clone()));
    harness.bus.publish_status(&StatusEvent::cancelled(stop_a));

    assert_eq!(
        drain(&mut notices),
        vec![
            NoticeKind::Started,
            NoticeKind::Resolved(OperationOutcome::Failure)
        ]
    );
    assert_eq!(session.snapshot().last_outcome, Some(OperationOutcome::Failure));
}

#[tokio::test]
async fn replayed_started_from_previous_run_is_ignored() {
    let harness = Harness::announcing();
    let (session, mut notices) = harness.open(OperationKind::Start, "siteA");
    let start_a = identity(OperationKind::Start, "siteA");

    session.dispatch(OperationParams::None).await.expect("first run");
    harness.bus.publish_status(&StatusEvent::finished(start_a.clone()));
    session.dispatch(OperationParams::None).await.expect("second run");
    drain(&mut notices);

    harness
        .bus
        .publish_status(&StatusEvent::started(start_a, Some(ProcessHandle::new("proc_1"))));
    assert_eq!(session.state(), SessionState::Started);
    assert_eq!(session.snapshot().process_handle, Some(ProcessHandle::new("proc_2")));
    assert!(drain(&mut notices).is_empty());
}

#[tokio::test]
async fn rejected_dispatch_reverts_to_idle_without_notice() {
    let bus = EventBus::new();
    let surface = Arc::new(FakeCommandSurface::rejecting("no such project"));
    let harness = Harness::with_surface(bus, surface);
    let (session, mut notices) = harness.open(OperationKind::Delete, "siteA");

    let err = session.dispatch(OperationParams::None).await.unwrap_err();

    assert!(matches!(err, DispatchError::Rejected { .. }));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.bus.subscriber_count(), 1, "only the dispatcher tracker remains");
    assert!(drain(&mut notices).is_empty());
}

#[tokio::test]
async fn busy_session_refuses_a_second_dispatch() {
    let harness = Harness::announcing();
    let (session, _notices) = harness.open(OperationKind::Start, "siteA");

    session.dispatch(OperationParams::None).await.expect("dispatch");
    let err = session.dispatch(OperationParams::None).await.unwrap_err();

    assert_eq!(
        err,
        DispatchError::SessionBusy(identity(OperationKind::Start, "siteA"))
    );
    assert_eq!(harness.surface.executed().len(), 1);
}

#[tokio::test]
async fn teardown_while_started_cancels_and_unsubscribes() {
    let bus = EventBus::new();
    let surface = Arc::new(FakeCommandSurface::silent());
    let harness = Harness::with_surface(bus, surface);
    let (session, mut notices) = harness.open(OperationKind::Stop, "siteA");
    let stop_a = identity(OperationKind::Stop, "siteA");

    session.dispatch(OperationParams::None).await.expect("dispatch");
    harness
        .bus
        .publish_status(&StatusEvent::started(stop_a.clone(), Some(ProcessHandle::new("proc_1"))));
    drain(&mut notices);

    session.teardown();
    session.teardown();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(harness.bus.subscriber_count(), 1);

    harness
        .bus
        .publish_output(&OutputEvent::for_identity(&stop_a, "late line", OutputStream::Primary));
    harness.bus.publish_status(&StatusEvent::cancelled(stop_a));
    assert_eq!(session.snapshot().last_progress_line, None);
    assert_eq!(session.snapshot().last_outcome, None);
    assert!(drain(&mut notices).is_empty());

    wait_for_cancel(&harness.surface, 1).await;
    assert_eq!(harness.surface.cancelled(), vec![ProcessHandle::new("proc_1")]);
}

#[tokio::test]
async fn dropping_the_session_tears_it_down() {
    let harness = Harness::announcing();
    let (session, _notices) = harness.open(OperationKind::Restart, "siteA");
    session.dispatch(OperationParams::None).await.expect("dispatch");
    assert_eq!(harness.bus.subscriber_count(), 2);

    drop(session);

    assert_eq!(harness.bus.subscriber_count(), 1);
    wait_for_cancel(&harness.surface, 1).await;
}

#[tokio::test]
async fn cancel_without_known_handle_is_a_safe_no_op() {
    let bus = EventBus::new();
    let surface = Arc::new(FakeCommandSurface::default());
    let harness = Harness::with_surface(bus, surface);
    let (session, mut notices) = harness.open(OperationKind::Start, "siteA");

    assert!(!session.cancel(), "idle session has nothing to cancel");

    session.dispatch(OperationParams::None).await.expect("dispatch");
    let before = session.snapshot();
    assert!(!session.cancel());
    assert_eq!(session.snapshot(), before);
    assert!(drain(&mut notices).is_empty());
    assert!(harness.surface.cancelled().is_empty());
}

#[tokio::test]
async fn cooperative_cancel_resolves_only_on_cancelled_event() {
    let harness = Harness::announcing();
    let (session, mut notices) = harness.open(OperationKind::ImportDb, "siteA");

    session
        .dispatch(OperationParams::ImportDb(shared::protocol::ImportDbParams {
            file_path: "/tmp/dump.sql.gz".into(),
            database: None,
            no_drop: false,
        }))
        .await
        .expect("dispatch");
    drain(&mut notices);

    assert!(session.cancel());
    let resolved = timeout(TEST_TIMEOUT, notices.recv())
        .await
        .expect("notice in time")
        .expect("channel open");

    assert_eq!(
        resolved.kind,
        NoticeKind::Resolved(OperationOutcome::UserCancelled)
    );
    assert_eq!(resolved.message.as_deref(), Some("Command was cancelled by user"));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn retarget_requires_idle_and_same_kind() {
    let harness = Harness::announcing();
    let (session, _notices) = harness.open(OperationKind::Start, "siteA");

    session
        .retarget(identity(OperationKind::Start, "siteB"))
        .expect("idle retarget");
    assert_eq!(session.identity(), identity(OperationKind::Start, "siteB"));

    assert_eq!(
        session.retarget(identity(OperationKind::Stop, "siteB")),
        Err(SessionError::KindMismatch {
            bound: OperationKind::Start,
            requested: OperationKind::Stop,
        })
    );

    session.dispatch(OperationParams::None).await.expect("dispatch");
    assert!(matches!(
        session.retarget(identity(OperationKind::Start, "siteC")),
        Err(SessionError::NotIdle(_))
    ));
}

#[tokio::test]
async fn untargeted_output_updates_target_scoped_sessions() {
    let harness = Harness::announcing();
    let (session, _notices) = harness.open(OperationKind::Start, "siteA");

    session.dispatch(OperationParams::None).await.expect("dispatch");
    harness
        .bus
        .publish_output(&OutputEvent::untargeted("Pulling images", OutputStream::Secondary));

    assert_eq!(
        session.snapshot().last_progress_line.as_deref(),
        Some("Pulling images")
    );
}

#[tokio::test]
async fn teardown_releases_identity_for_an_immediate_rerun() {
    let harness = Harness::announcing();
    let (session, mut notices) = harness.open(OperationKind::Restart, "siteA");
    let restart_a = identity(OperationKind::Restart, "siteA");

    session.dispatch(OperationParams::None).await.expect("first run");
    session.teardown();
    assert!(!harness.dispatcher.is_in_flight(&restart_a));

    session.dispatch(OperationParams::None).await.expect("rerun right away");
    drain(&mut notices);

    // Acknowledgement for the torn-down run (proc_1) arrives after the rerun (proc_2) started.
    wait_for_cancel(&harness.surface, 1).await;
    tokio::task::yield_now().await;
    assert_eq!(harness.surface.cancelled(), vec![ProcessHandle::new("proc_1")]);
    assert_eq!(session.state(), SessionState::Started);
    assert_eq!(session.snapshot().process_handle, Some(ProcessHandle::new("proc_2")));
    assert!(drain(&mut notices).is_empty());
    assert!(harness.dispatcher.is_in_flight(&restart_a));
}
