use chrono::{DateTime, Utc};
use shared::{
    domain::{OperationIdentity, ProcessHandle, SubStream, Target},
    protocol::{LogsParams, OperationParams, OutputEvent, OutputStream},
};
use tracing::debug;

use crate::{
    cancellation::CancellationController,
    dispatcher::{DispatchResult, OperationDispatcher},
    error::DispatchError,
    session::{OperationSession, SessionNotices, SessionSnapshot, SessionState},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogMode {
    /// One batch; the producer ends the operation on its own.
    #[default]
    FetchOnce,
    /// Long-lived tail; ends only on an explicit stop.
    Follow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub line: String,
    pub stream: OutputStream,
    pub received_at: DateTime<Utc>,
}

impl LogLine {
    pub(crate) fn from_event(event: &OutputEvent) -> Self {
        Self {
            line: event.line.clone(),
            stream: event.stream,
            received_at: Utc::now(),
        }
    }
}

/// Log viewer for one `(target, service)` pair with an append-only line buffer.
pub struct LogFollowSession {
    session: OperationSession,
    mode: LogMode,
    tail: Option<u32>,
    timestamps: bool,
    /// Lowercased needle; applied when reading, never when storing.
    filter: Option<String>,
}

impl LogFollowSession {
    pub fn open(
        dispatcher: &OperationDispatcher,
        cancellation: CancellationController,
        target: impl Into<Target>,
        service: impl Into<SubStream>,
    ) -> (Self, SessionNotices) {
        let (session, notices) = OperationSession::open_buffered(
            dispatcher,
            cancellation,
            OperationIdentity::logs(target, service),
        );
        (
            Self {
                session,
                mode: LogMode::default(),
                tail: None,
                timestamps: false,
                filter: None,
            },
            notices,
        )
    }

    pub fn with_mode(mut self, mode: LogMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tail(mut self, tail: Option<u32>) -> Self {
        self.tail = tail;
        self
    }

    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Takes effect on the next `start` or `switch_sub_stream`.
    pub fn set_mode(&mut self, mode: LogMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> LogMode {
        self.mode
    }

    pub fn identity(&self) -> OperationIdentity {
        self.session.identity()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn process_handle(&self) -> Option<ProcessHandle> {
        self.session.snapshot().process_handle
    }

    fn params(&self) -> OperationParams {
        OperationParams::Logs(LogsParams {
            follow: self.mode == LogMode::Follow,
            tail: self.tail,
            timestamps: self.timestamps,
        })
    }

    pub async fn start(&self) -> DispatchResult {
        self.session.dispatch(self.params()).await
    }

    /// Abandons the current stream (one cancellation if it has a known process), clears the
    /// buffer, and immediately dispatches for `service`.
    pub async fn switch_sub_stream(&self, service: impl Into<SubStream>) -> DispatchResult {
        let current = self.session.identity();
        let next = OperationIdentity::logs(current.target().clone(), service);

        self.session.teardown();
        self.session.clear_buffer();
        self.session
            .retarget(next.clone())
            .map_err(|_| DispatchError::SessionBusy(next.clone()))?;
        debug!(from = %current, to = %next, "switched log stream");

        self.start().await
    }

    /// Cooperative stop of a followed stream. The session stays `Started` until the producer
    /// reports `cancelled`.
    pub fn stop(&self) -> bool {
        self.session.cancel()
    }

    /// Local only; the underlying process keeps running.
    pub fn clear(&self) {
        self.session.clear_buffer();
    }

    pub fn set_filter(&mut self, filter: Option<&str>) {
        self.filter = filter
            .filter(|needle| !needle.is_empty())
            .map(str::to_lowercase);
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Buffered lines that pass the current filter, in arrival order.
    pub fn lines(&self) -> Vec<LogLine> {
        let lines = self.session.buffered_lines();
        match &self.filter {
            Some(needle) => lines
                .into_iter()
                .filter(|line| line.line.to_lowercase().contains(needle.as_str()))
                .collect(),
            None => lines,
        }
    }

    pub fn all_lines(&self) -> Vec<LogLine> {
        self.session.buffered_lines()
    }

    pub fn teardown(&self) {
        self.session.teardown();
    }
}

#[cfg(test)]
#[path = "tests/log_follow_tests.rs"]
mod tests;
