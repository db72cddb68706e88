use std::sync::Arc;

use shared::protocol::StatusEvent;
use tokio::time::timeout;

use super::*;
use crate::{
    bus::EventBus,
    ingress::{EventIngress, COMMAND_STATUS, LOG_STATUS},
    session::{NoticeKind, OperationOutcome},
    test_support::{FakeCommandSurface, TEST_TIMEOUT},
};

fn setup() -> (EventBus, Arc<FakeCommandSurface>, OperationDispatcher) {
    let bus = EventBus::new();
    let surface = Arc::new(FakeCommandSurface::announcing(&bus));
    let dispatcher = OperationDispatcher::new(&bus, surface.clone());
    (bus, surface, dispatcher)
}

fn follow(
    dispatcher: &OperationDispatcher,
    service: &str,
) -> (LogFollowSession, SessionNotices) {
    let (session, notices) =
        LogFollowSession::open(dispatcher, dispatcher.cancellation(), "siteA", service);
    (session.with_mode(LogMode::Follow), notices)
}

fn emit(bus: &EventBus, service: &str, line: &str) {
    bus.publish_output(&OutputEvent::for_identity(
        &OperationIdentity::logs("siteA", service),
        line,
        OutputStream::Primary,
    ));
}

fn texts(lines: &[LogLine]) -> Vec<&str> {
    lines.iter().map(|line| line.line.as_str()).collect()
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
async fn lines_accumulate_in_arrival_order_without_dedup() {
    let (bus, _surface, dispatcher) = setup();
    let (logs, _notices) = follow(&dispatcher, "web");

    logs.start().await.expect("start");
    emit(&bus, "web", "GET /");
    emit(&bus, "web", "GET /");
    emit(&bus, "web", "POST /login");

    assert_eq!(texts(&logs.lines()), vec!["GET /", "GET /", "POST /login"]);
    assert_eq!(logs.state(), SessionState::Started);
}

#[tokio::test]
async fn only_lines_for_the_followed_service_are_kept() {
    let (bus, _surface, dispatcher) = setup();
    let (logs, _notices) = follow(&dispatcher, "web");

    logs.start().await.expect("start");
    emit(&bus, "db", "ready for connections");
    bus.publish_output(&OutputEvent::untargeted("untagged", OutputStream::Primary));
    emit(&bus, "web", "GET /");

    assert_eq!(texts(&logs.all_lines()), vec!["GET /"]);
}

#[tokio::test]
async fn follow_mode_requests_a_tailing_stream() {
    let (_bus, surface, dispatcher) = setup();
    let (logs, _notices) = follow(&dispatcher, "web");
    let logs = logs.with_tail(Some(100)).with_timestamps(true);

    logs.start().await.expect("start");

    assert_eq!(
        surface.executed()[0].params,
        OperationParams::Logs(LogsParams {
            follow: true,
            tail: Some(100),
            timestamps: true,
        })
    );
}

#[tokio::test]
async fn switch_clears_buffer_and_cancels_previous_stream_once() {
    let (bus, surface, dispatcher) = setup();
    let (logs, _notices) = follow(&dispatcher, "web");

    logs.start().await.expect("start web");
    let web_handle = logs.process_handle().expect("web handle");
    emit(&bus, "web", "one");
    emit(&bus, "web", "two");
    emit(&bus, "web", "three");
    assert_eq!(logs.all_lines().len(), 3);

    logs.switch_sub_stream("db").await.expect("switch to db");
    assert!(logs.all_lines().is_empty());
    assert_eq!(logs.identity(), OperationIdentity::logs("siteA", "db"));
    assert_eq!(logs.state(), SessionState::Started);

    wait_for_cancel(&surface, 1).await;
    tokio::task::yield_now().await;
    assert_eq!(surface.cancelled(), vec![web_handle]);

    let executed = surface.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[1].identity, OperationIdentity::logs("siteA", "db"));

    // The old stream's trailing output no longer lands in the buffer.
    emit(&bus, "web", "four");
    emit(&bus, "db", "db line");
    assert_eq!(texts(&logs.all_lines()), vec!["db line"]);
}

#[tokio::test]
async fn switching_an_idle_session_sends_no_cancellation() {
    let (bus, surface, dispatcher) = setup();
    let (logs, _notices) =
        LogFollowSession::open(&dispatcher, dispatcher.cancellation(), "siteA", "web");

    logs.start().await.expect("fetch once");
    bus.publish_status(&StatusEvent::finished(OperationIdentity::logs("siteA", "web")));
    assert_eq!(logs.state(), SessionState::Idle);

    logs.switch_sub_stream("db").await.expect("switch");
    tokio::task::yield_now().await;
    assert!(surface.cancelled().is_empty());
}

#[tokio::test]
async fn filter_is_applied_at_read_time_only() {
    let (bus, _surface, dispatcher) = setup();
    let (mut logs, _notices) = follow(&dispatcher, "web");

    logs.start().await.expect("start");
    for line in ["A", "B", "C"] {
        emit(&bus, "web", line);
    }

    logs.set_filter(Some("b"));
    assert_eq!(texts(&logs.lines()), vec!["B"]);
    logs.set_filter(None);
    assert_eq!(texts(&logs.lines()), vec!["A", "B", "C"]);

    logs.set_filter(Some(""));
    assert_eq!(logs.filter(), None);
}

#[tokio::test]
async fn clear_is_local_and_keeps_the_stream_running() {
    let (bus, surface, dispatcher) = setup();
    let (logs, _notices) = follow(&dispatcher, "web");

    logs.start().await.expect("start");
    emit(&bus, "web", "before");
    logs.clear();
    emit(&bus, "web", "after");

    assert_eq!(texts(&logs.all_lines()), vec!["after"]);
    assert_eq!(logs.state(), SessionState::Started);
    assert!(surface.cancelled().is_empty());
}

#[tokio::test]
async fn stop_is_cooperative() {
    let (_bus, _surface, dispatcher) = setup();
    let (logs, mut notices) = follow(&dispatcher, "web");

    logs.start().await.expect("start");
    assert!(logs.stop());

    let mut kinds = Vec::new();
    while let Ok(Some(notice)) = timeout(TEST_TIMEOUT, notices.recv()).await {
        kinds.push(notice.kind);
        if matches!(notice.kind, NoticeKind::Resolved(_)) {
            break;
        }
    }

    assert_eq!(
        kinds,
        vec![
            NoticeKind::Started,
            NoticeKind::Resolved(OperationOutcome::UserCancelled)
        ]
    );
    assert_eq!(logs.state(), SessionState::Idle);
}

#[tokio::test]
async fn switching_back_to_a_previous_stream_restarts_it() {
    let (bus, surface, dispatcher) = setup();
    let (logs, _notices) = follow(&dispatcher, "web");

    logs.start().await.expect("start web");
    logs.switch_sub_stream("db").await.expect("switch to db");
    logs.switch_sub_stream("web").await.expect("switch back to web");

    assert_eq!(logs.identity(), OperationIdentity::logs("siteA", "web"));
    assert_eq!(logs.state(), SessionState::Started);
    assert_eq!(surface.executed().len(), 3);

    wait_for_cancel(&surface, 2).await;
    tokio::task::yield_now().await;
    // The first web stream's cancellation does not end the new one.
    assert_eq!(logs.state(), SessionState::Started);
    assert_eq!(logs.process_handle(), Some(ProcessHandle::new("proc_3")));
    emit(&bus, "web", "GET /health");
    assert_eq!(texts(&logs.all_lines()), vec!["GET /health"]);
}

#[tokio::test]
async fn stopped_stream_reported_under_bare_logs_command_resolves() {
    let bus = EventBus::new();
    let surface = Arc::new(FakeCommandSurface::silent());
    let dispatcher = OperationDispatcher::new(&bus, surface.clone());
    let ingress = EventIngress::new(bus.clone()).with_dispatcher(&dispatcher);
    let (logs, mut notices) = follow(&dispatcher, "web");
    let logs_web = OperationIdentity::logs("siteA", "web");

    logs.start().await.expect("start");
    ingress
        .ingest(
            LOG_STATUS,
            r#"{"project":"siteA","service":"web","status":"started"}"#,
        )
        .expect("started");
    assert_eq!(logs.state(), SessionState::Started);

    ingress
        .ingest(
            COMMAND_STATUS,
            r#"{"command":"logs","project":"siteA","status":"cancelled",
                "message":"Command was cancelled by user","process_id":"proc_1"}"#,
        )
        .expect("cancellation resolves through the dispatched handle");

    assert_eq!(logs.state(), SessionState::Idle);
    assert!(!dispatcher.is_in_flight(&logs_web));
    let mut kinds = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        kinds.push(notice.kind);
    }
    assert_eq!(
        kinds,
        vec![
            NoticeKind::Started,
            NoticeKind::Resolved(OperationOutcome::UserCancelled)
        ]
    );
}
