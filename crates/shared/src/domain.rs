use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

macro_rules! name_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

name_newtype!(Target);
name_newtype!(SubStream);
name_newtype!(ProcessHandle);

/// Target name used by fleet-wide operations.
pub const FLEET_TARGET: &str = "all";

impl Target {
    pub fn fleet() -> Self {
        Self(FLEET_TARGET.to_owned())
    }

    pub fn is_fleet(&self) -> bool {
        self.0 == FLEET_TARGET
    }
}

/// Named event channel a kind reports its status on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusChannel {
    Command,
    Log,
    Screenshot,
}

impl StatusChannel {
    pub fn status_event_name(self) -> &'static str {
        match self {
            Self::Command => "command-status",
            Self::Log => "log-status",
            Self::Screenshot => "screenshot-status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Start,
    Stop,
    Restart,
    Delete,
    ImportDb,
    ExportDb,
    CreateSnapshot,
    RestoreSnapshot,
    DeleteSnapshot,
    CleanupSnapshots,
    AddonInstall,
    AddonRemove,
    ChangeRuntimeVersion,
    GetLogs,
    CreateProject,
    CaptureScreenshot,
    PoweroffAll,
}

impl OperationKind {
    pub const ALL: [OperationKind; 17] = [
        Self::Start,
        Self::Stop,
        Self::Restart,
        Self::Delete,
        Self::ImportDb,
        Self::ExportDb,
        Self::CreateSnapshot,
        Self::RestoreSnapshot,
        Self::DeleteSnapshot,
        Self::CleanupSnapshots,
        Self::AddonInstall,
        Self::AddonRemove,
        Self::ChangeRuntimeVersion,
        Self::GetLogs,
        Self::CreateProject,
        Self::CaptureScreenshot,
        Self::PoweroffAll,
    ];

    /// Command name carried in `command-status` payloads.
    pub fn command_name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Delete => "delete",
            Self::ImportDb => "import-db",
            Self::ExportDb => "export-db",
            Self::CreateSnapshot => "snapshot-create",
            Self::RestoreSnapshot => "snapshot-restore",
            Self::DeleteSnapshot => "snapshot-delete",
            Self::CleanupSnapshots => "snapshot-cleanup",
            Self::AddonInstall => "addon-install",
            Self::AddonRemove => "addon-remove",
            Self::ChangeRuntimeVersion => "change-runtime",
            Self::GetLogs => "logs",
            Self::CreateProject => "config",
            Self::CaptureScreenshot => "screenshot",
            Self::PoweroffAll => "poweroff",
        }
    }

    pub fn from_command(command: &str) -> Option<Self> {
        let kind = match command {
            "change-php" | "change-nodejs" => Self::ChangeRuntimeVersion,
            "create" => Self::CreateProject,
            other => return Self::ALL.into_iter().find(|kind| kind.command_name() == other),
        };
        Some(kind)
    }

    pub fn progress_label(self) -> &'static str {
        match self {
            Self::Start => "Starting",
            Self::Stop => "Stopping",
            Self::Restart => "Restarting",
            Self::Delete => "Deleting",
            Self::ImportDb => "Importing database",
            Self::ExportDb => "Exporting database",
            Self::CreateSnapshot => "Creating snapshot",
            Self::RestoreSnapshot => "Restoring snapshot",
            Self::DeleteSnapshot => "Deleting snapshot",
            Self::CleanupSnapshots => "Cleaning up snapshots",
            Self::AddonInstall => "Installing add-on",
            Self::AddonRemove => "Removing add-on",
            Self::ChangeRuntimeVersion => "Changing runtime version",
            Self::GetLogs => "Fetching logs",
            Self::CreateProject => "Creating project",
            Self::CaptureScreenshot => "Capturing screenshot",
            Self::PoweroffAll => "Powering off all projects",
        }
    }

    pub fn status_channel(self) -> StatusChannel {
        match self {
            Self::GetLogs => StatusChannel::Log,
            Self::CaptureScreenshot => StatusChannel::Screenshot,
            _ => StatusChannel::Command,
        }
    }

    /// Kinds whose identity carries a sub-stream.
    pub fn has_sub_stream(self) -> bool {
        matches!(self, Self::GetLogs)
    }

    /// Whether a successful dispatch should be followed by a read-model refresh.
    pub fn refreshes_read_model(self) -> bool {
        !matches!(self, Self::GetLogs | Self::CaptureScreenshot)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

/// Compound key routing bus events to the session that owns them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum OperationIdentity {
    Target {
        kind: OperationKind,
        target: Target,
    },
    SubStream {
        kind: OperationKind,
        target: Target,
        sub_stream: SubStream,
    },
}

impl OperationIdentity {
    /// Builds the identity for `kind`, checking that the sub-stream matches the kind's shape.
    pub fn for_kind(
        kind: OperationKind,
        target: Target,
        sub_stream: Option<SubStream>,
    ) -> Result<Self, ProtocolError> {
        match (kind.has_sub_stream(), sub_stream) {
            (true, Some(sub_stream)) => Ok(Self::SubStream {
                kind,
                target,
                sub_stream,
            }),
            (true, None) => Err(ProtocolError::MissingSubStream(kind)),
            (false, None) => Ok(Self::Target { kind, target }),
            (false, Some(_)) => Err(ProtocolError::UnexpectedSubStream(kind)),
        }
    }

    pub fn target_of(
        kind: OperationKind,
        target: impl Into<Target>,
    ) -> Result<Self, ProtocolError> {
        Self::for_kind(kind, target.into(), None)
    }

    pub fn logs(target: impl Into<Target>, sub_stream: impl Into<SubStream>) -> Self {
        Self::SubStream {
            kind: OperationKind::GetLogs,
            target: target.into(),
            sub_stream: sub_stream.into(),
        }
    }

    pub fn poweroff_all() -> Self {
        Self::Target {
            kind: OperationKind::PoweroffAll,
            target: Target::fleet(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Target { kind, .. } | Self::SubStream { kind, .. } => *kind,
        }
    }

    pub fn target(&self) -> &Target {
        match self {
            Self::Target { target, .. } | Self::SubStream { target, .. } => target,
        }
    }

    pub fn sub_stream(&self) -> Option<&SubStream> {
        match self {
            Self::Target { .. } => None,
            Self::SubStream { sub_stream, .. } => Some(sub_stream),
        }
    }

    /// The single identity comparison used by every session and tracker.
    pub fn matches(&self, other: &OperationIdentity) -> bool {
        self == other
    }

    pub fn with_sub_stream(&self, sub_stream: SubStream) -> Result<Self, ProtocolError> {
        Self::for_kind(self.kind(), self.target().clone(), Some(sub_stream))
    }
}

impl fmt::Display for OperationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target { kind, target } => write!(f, "{kind}:{target}"),
            Self::SubStream {
                kind,
                target,
                sub_stream,
            } => write!(f, "{kind}:{target}/{sub_stream}"),
        }
    }
}
