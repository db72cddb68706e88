use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    domain::{OperationIdentity, OperationKind, ProcessHandle, StatusChannel, SubStream, Target},
    error::ProtocolError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    Started,
    /// Intermediate step of a started operation; only refreshes the progress line.
    Progress,
    Finished,
    Error,
    Cancelled,
}

impl StatusPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    pub fn parse(channel: StatusChannel, status: &str) -> Result<Self, ProtocolError> {
        match (channel, status) {
            (_, "started") => Ok(Self::Started),
            (_, "finished") => Ok(Self::Finished),
            (_, "error") => Ok(Self::Error),
            (StatusChannel::Command | StatusChannel::Log, "cancelled") => Ok(Self::Cancelled),
            (StatusChannel::Screenshot, "capturing") => Ok(Self::Progress),
            (channel, other) => Err(ProtocolError::UnknownStatus {
                channel: channel.status_event_name(),
                status: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputStream {
    #[serde(rename = "stdout")]
    Primary,
    #[serde(rename = "stderr")]
    Secondary,
}

impl OutputStream {
    pub fn parse(stream: &str) -> Result<Self, ProtocolError> {
        match stream {
            "stdout" => Ok(Self::Primary),
            "stderr" => Ok(Self::Secondary),
            other => Err(ProtocolError::UnknownStream(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub identity: OperationIdentity,
    pub phase: StatusPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_handle: Option<ProcessHandle>,
    /// Artifact location reported by screenshot capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl StatusEvent {
    pub fn new(identity: OperationIdentity, phase: StatusPhase) -> Self {
        Self {
            identity,
            phase,
            message: None,
            process_handle: None,
            path: None,
        }
    }

    pub fn started(identity: OperationIdentity, process_handle: Option<ProcessHandle>) -> Self {
        Self {
            process_handle,
            ..Self::new(identity, StatusPhase::Started)
        }
    }

    pub fn finished(identity: OperationIdentity) -> Self {
        Self::new(identity, StatusPhase::Finished)
    }

    pub fn error(identity: OperationIdentity, message: impl Into<String>) -> Self {
        Self::new(identity, StatusPhase::Error).with_message(message)
    }

    pub fn cancelled(identity: OperationIdentity) -> Self {
        Self::new(identity, StatusPhase::Cancelled)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    /// `None` when the producer did not attribute the line to a project.
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default)]
    pub sub_stream: Option<SubStream>,
    pub line: String,
    pub stream: OutputStream,
}

impl OutputEvent {
    pub fn for_identity(
        identity: &OperationIdentity,
        line: impl Into<String>,
        stream: OutputStream,
    ) -> Self {
        Self {
            target: Some(identity.target().clone()),
            sub_stream: identity.sub_stream().cloned(),
            line: line.into(),
            stream,
        }
    }

    pub fn untargeted(line: impl Into<String>, stream: OutputStream) -> Self {
        Self {
            target: None,
            sub_stream: None,
            line: line.into(),
            stream,
        }
    }

    /// Attributed lines belong only to the identity with the same target and sub-stream.
    /// Unattributed lines belong to any identity without a sub-stream.
    pub fn belongs_to(&self, identity: &OperationIdentity) -> bool {
        match &self.target {
            Some(target) => {
                target == identity.target() && self.sub_stream.as_ref() == identity.sub_stream()
            }
            None => self.sub_stream.is_none() && identity.sub_stream().is_none(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Bzip2,
    Xz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Php,
    Nodejs,
}

impl Runtime {
    pub fn config_flag(self) -> &'static str {
        match self {
            Self::Php => "php-version",
            Self::Nodejs => "nodejs-version",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Php => "PHP",
            Self::Nodejs => "Node.js",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDbParams {
    pub file_path: PathBuf,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub no_drop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDbParams {
    pub file_path: PathBuf,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeVersionParams {
    pub runtime: Runtime,
    pub version: String,
    pub approot: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsParams {
    pub follow: bool,
    #[serde(default)]
    pub tail: Option<u32>,
    #[serde(default)]
    pub timestamps: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProjectParams {
    pub directory: PathBuf,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub webserver: Option<String>,
    #[serde(default)]
    pub docroot: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
    /// Application code installed into the directory before the project is configured.
    #[serde(default)]
    pub cms: Option<CmsInstall>,
}

/// Decoded from `{"type":"composer","package":"..."}` or `{"type":"wordpress"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CmsInstall {
    /// `composer create-project <package> .`
    Composer { package: String },
    /// WP-CLI when available, otherwise the release archive from wordpress.org.
    Wordpress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OperationParams {
    None,
    ImportDb(ImportDbParams),
    ExportDb(ExportDbParams),
    CreateSnapshot { name: Option<String> },
    Snapshot { name: String },
    Addon { addon: String },
    RuntimeVersion(RuntimeVersionParams),
    Logs(LogsParams),
    CreateProject(CreateProjectParams),
    Screenshot { url: String },
}

impl OperationParams {
    pub fn fits(&self, kind: OperationKind) -> bool {
        use OperationKind as K;

        matches!(
            (kind, self),
            (
                K::Start | K::Stop | K::Restart | K::Delete | K::CleanupSnapshots | K::PoweroffAll,
                Self::None
            ) | (K::ImportDb, Self::ImportDb(_))
                | (K::ExportDb, Self::ExportDb(_))
                | (K::CreateSnapshot, Self::CreateSnapshot { .. })
                | (K::RestoreSnapshot | K::DeleteSnapshot, Self::Snapshot { .. })
                | (K::AddonInstall | K::AddonRemove, Self::Addon { .. })
                | (K::ChangeRuntimeVersion, Self::RuntimeVersion(_))
                | (K::GetLogs, Self::Logs(_))
                | (K::CreateProject, Self::CreateProject(_))
                | (K::CaptureScreenshot, Self::Screenshot { .. })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub identity: OperationIdentity,
    pub params: OperationParams,
}

impl OperationRequest {
    pub fn new(identity: OperationIdentity, params: OperationParams) -> Self {
        Self { identity, params }
    }

    pub fn kind(&self) -> OperationKind {
        self.identity.kind()
    }

    pub fn target(&self) -> &Target {
        self.identity.target()
    }
}

/// `command-status` channel payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatusPayload {
    pub command: String,
    pub project: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub process_id: Option<String>,
}

/// `log-status` channel payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStatusPayload {
    pub project: String,
    pub service: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub process_id: Option<String>,
}

/// `screenshot-status` channel payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotStatusPayload {
    pub project: String,
    pub status: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `command-output` and `log-output` channel payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPayload {
    pub line: String,
    pub stream: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

impl TryFrom<CommandStatusPayload> for StatusEvent {
    type Error = ProtocolError;

    fn try_from(value: CommandStatusPayload) -> Result<Self, Self::Error> {
        let identity =
            OperationIdentity::for_kind(value.kind()?, Target(value.project.clone()), None)?;
        value.into_status_event(identity)
    }
}

impl CommandStatusPayload {
    pub fn kind(&self) -> Result<OperationKind, ProtocolError> {
        OperationKind::from_command(&self.command)
            .ok_or_else(|| ProtocolError::UnknownCommand(self.command.clone()))
    }

    pub fn process_handle(&self) -> Option<ProcessHandle> {
        self.process_id.clone().map(ProcessHandle)
    }

    /// Converts with an identity resolved by the caller. The channel carries no sub-stream,
    /// so log streams reported here (on cancellation) need their identity recovered from the
    /// process handle.
    pub fn into_status_event(
        self,
        identity: OperationIdentity,
    ) -> Result<StatusEvent, ProtocolError> {
        let kind = self.kind()?;
        if identity.kind() != kind || identity.target().as_str() != self.project {
            return Err(ProtocolError::Malformed {
                channel: "command-status",
                reason: format!("{identity} does not match {} on {}", self.command, self.project),
            });
        }
        let phase = StatusPhase::parse(StatusChannel::Command, &self.status)?;

        Ok(StatusEvent {
            identity,
            phase,
            message: self.message,
            process_handle: self.process_id.map(ProcessHandle),
            path: None,
        })
    }
}

impl TryFrom<LogStatusPayload> for StatusEvent {
    type Error = ProtocolError;

    fn try_from(value: LogStatusPayload) -> Result<Self, Self::Error> {
        let phase = StatusPhase::parse(StatusChannel::Log, &value.status)?;

        Ok(Self {
            identity: OperationIdentity::logs(value.project, value.service),
            phase,
            message: value.message,
            process_handle: value.process_id.map(ProcessHandle),
            path: None,
        })
    }
}

impl TryFrom<ScreenshotStatusPayload> for StatusEvent {
    type Error = ProtocolError;

    fn try_from(value: ScreenshotStatusPayload) -> Result<Self, Self::Error> {
        let phase = StatusPhase::parse(StatusChannel::Screenshot, &value.status)?;

        Ok(Self {
            identity: OperationIdentity::Target {
                kind: OperationKind::CaptureScreenshot,
                target: Target(value.project),
            },
            phase,
            message: value.message,
            process_handle: None,
            path: value.path,
        })
    }
}

impl TryFrom<OutputPayload> for OutputEvent {
    type Error = ProtocolError;

    fn try_from(value: OutputPayload) -> Result<Self, Self::Error> {
        let stream = OutputStream::parse(&value.stream)?;
        if value.service.is_some() && value.project.is_none() {
            return Err(ProtocolError::Malformed {
                channel: "log-output",
                reason: "service given without project".to_owned(),
            });
        }

        Ok(Self {
            target: value.project.map(Target),
            sub_stream: value.service.map(SubStream),
            line: value.line,
            stream,
        })
    }
}
