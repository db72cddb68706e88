use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::de::DeserializeOwned;
use shared::{
    domain::{OperationIdentity, OperationKind, ProcessHandle},
    error::ProtocolError,
    protocol::{
        CommandStatusPayload, LogStatusPayload, OutputEvent, OutputPayload,
        ScreenshotStatusPayload, StatusEvent,
    },
};
use tracing::{debug, warn};

use crate::{bus::EventBus, dispatcher::OperationDispatcher};

pub const COMMAND_STATUS: &str = "command-status";
pub const COMMAND_OUTPUT: &str = "command-output";
pub const LOG_STATUS: &str = "log-status";
pub const LOG_OUTPUT: &str = "log-output";
pub const SCREENSHOT_STATUS: &str = "screenshot-status";

/// Bridges the JSON event-stream surface onto the bus.
///
/// Payloads that fail to decode are logged and dropped here; subscribers only ever see
/// well-typed events.
///
/// The producer reports a cancelled log stream on `command-status` under the bare `logs`
/// command, without the service. Such events are matched back to their stream through the
/// `process_id`, using the handles announced on the other status channels and, when
/// attached, the dispatcher's tracked handles.
#[derive(Clone)]
pub struct EventIngress {
    bus: EventBus,
    handles: Arc<Mutex<HashMap<ProcessHandle, OperationIdentity>>>,
    dispatcher: Option<OperationDispatcher>,
}

impl EventIngress {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            handles: Arc::default(),
            dispatcher: None,
        }
    }

    /// Also resolves handles the dispatcher learned from the command surface directly.
    pub fn with_dispatcher(mut self, dispatcher: &OperationDispatcher) -> Self {
        self.dispatcher = Some(dispatcher.clone());
        self
    }

    /// Routes a raw payload by channel name.
    pub fn ingest(&self, channel: &str, payload: &str) -> Result<(), ProtocolError> {
        let result = match channel {
            COMMAND_STATUS => self.command_status(payload),
            COMMAND_OUTPUT => self.output(COMMAND_OUTPUT, payload),
            LOG_STATUS => self.log_status(payload),
            LOG_OUTPUT => self.output(LOG_OUTPUT, payload),
            SCREENSHOT_STATUS => self.screenshot_status(payload),
            other => Err(ProtocolError::UnknownChannel(other.to_owned())),
        };
        if let Err(err) = &result {
            warn!(channel, error = %err, "dropping undecodable event");
        }
        result
    }

    pub fn command_status(&self, payload: &str) -> Result<(), ProtocolError> {
        let raw: CommandStatusPayload = decode(COMMAND_STATUS, payload)?;
        let kind = raw.kind()?;
        let event = if kind.has_sub_stream() {
            let identity = self.resolve_by_handle(kind, &raw)?;
            raw.into_status_event(identity)?
        } else {
            StatusEvent::try_from(raw)?
        };
        self.publish_status(event);
        Ok(())
    }

    pub fn log_status(&self, payload: &str) -> Result<(), ProtocolError> {
        let raw: LogStatusPayload = decode(LOG_STATUS, payload)?;
        self.publish_status(StatusEvent::try_from(raw)?);
        Ok(())
    }

    pub fn screenshot_status(&self, payload: &str) -> Result<(), ProtocolError> {
        let raw: ScreenshotStatusPayload = decode(SCREENSHOT_STATUS, payload)?;
        self.publish_status(StatusEvent::try_from(raw)?);
        Ok(())
    }

    fn output(&self, channel: &'static str, payload: &str) -> Result<(), ProtocolError> {
        let raw: OutputPayload = decode(channel, payload)?;
        self.bus.publish_output(&OutputEvent::try_from(raw)?);
        Ok(())
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<ProcessHandle, OperationIdentity>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve_by_handle(
        &self,
        kind: OperationKind,
        raw: &CommandStatusPayload,
    ) -> Result<OperationIdentity, ProtocolError> {
        let handle = raw
            .process_handle()
            .ok_or(ProtocolError::MissingSubStream(kind))?;
        let known = self.handles().get(&handle).cloned();
        let identity = known
            .or_else(|| {
                self.dispatcher
                    .as_ref()
                    .and_then(|dispatcher| dispatcher.identity_for(&handle))
            })
            .filter(|identity| {
                identity.kind() == kind && identity.target().as_str() == raw.project
            })
            .ok_or(ProtocolError::MissingSubStream(kind))?;
        debug!(
            handle = %handle,
            identity = %identity,
            "status resolved through its process handle"
        );
        Ok(identity)
    }

    fn publish_status(&self, event: StatusEvent) {
        if let Some(handle) = &event.process_handle {
            let mut handles = self.handles();
            if event.phase.is_terminal() {
                handles.remove(handle);
            } else {
                handles.insert(handle.clone(), event.identity.clone());
            }
        }
        self.bus.publish_status(&event);
    }
}

fn decode<T: DeserializeOwned>(channel: &'static str, payload: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(payload).map_err(|err| ProtocolError::Malformed {
        channel,
        reason: err.to_string(),
    })
}

#[cfg(test)]
#[path = "tests/ingress_tests.rs"]
mod tests;
