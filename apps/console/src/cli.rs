use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use shared::{
    domain::{OperationIdentity, OperationKind, Target},
    protocol::{
        CmsInstall, Compression, CreateProjectParams, ExportDbParams, ImportDbParams,
        OperationParams, OperationRequest, Runtime, RuntimeVersionParams,
    },
};

#[derive(Parser, Debug)]
#[command(name = "console", about = "Run a project operation and follow it to its outcome")]
pub struct Args {
    /// Settings file; defaults to ./console.toml when present.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Op,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum CompressionArg {
    #[default]
    Gzip,
    Bzip2,
    Xz,
}

impl From<CompressionArg> for Compression {
    fn from(value: CompressionArg) -> Self {
        match value {
            CompressionArg::Gzip => Self::Gzip,
            CompressionArg::Bzip2 => Self::Bzip2,
            CompressionArg::Xz => Self::Xz,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RuntimeArg {
    Php,
    Nodejs,
}

impl From<RuntimeArg> for Runtime {
    fn from(value: RuntimeArg) -> Self {
        match value {
            RuntimeArg::Php => Self::Php,
            RuntimeArg::Nodejs => Self::Nodejs,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Op {
    Start {
        project: String,
    },
    Stop {
        project: String,
    },
    Restart {
        project: String,
    },
    /// Removes the project's containers; files are kept.
    Delete {
        project: String,
    },
    /// Stops every project.
    Poweroff,
    ImportDb {
        project: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        database: Option<String>,
        #[arg(long)]
        no_drop: bool,
    },
    ExportDb {
        project: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        database: Option<String>,
        #[arg(long, value_enum, default_value_t)]
        compression: CompressionArg,
    },
    Snapshot {
        project: String,
        #[arg(long)]
        name: Option<String>,
    },
    RestoreSnapshot {
        project: String,
        name: String,
    },
    DeleteSnapshot {
        project: String,
        name: String,
    },
    CleanupSnapshots {
        project: String,
    },
    AddonInstall {
        project: String,
        addon: String,
    },
    AddonRemove {
        project: String,
        addon: String,
    },
    ChangeRuntime {
        project: String,
        #[arg(long, value_enum)]
        runtime: RuntimeArg,
        version: String,
        /// Project root the config change is applied in.
        #[arg(long)]
        approot: PathBuf,
    },
    Logs {
        project: String,
        #[arg(long, default_value = "web")]
        service: String,
        #[arg(short, long)]
        follow: bool,
        #[arg(long)]
        tail: Option<u32>,
        #[arg(short, long)]
        timestamps: bool,
        /// Case-insensitive substring; only matching lines are printed.
        #[arg(long)]
        filter: Option<String>,
    },
    Create {
        name: String,
        #[arg(long)]
        directory: PathBuf,
        #[arg(long)]
        project_type: Option<String>,
        #[arg(long)]
        php_version: Option<String>,
        #[arg(long)]
        database: Option<String>,
        #[arg(long)]
        webserver: Option<String>,
        #[arg(long)]
        docroot: Option<String>,
        /// Composer package installed into the directory before configuring.
        #[arg(long, conflicts_with = "wordpress")]
        composer: Option<String>,
        /// Installs WordPress core before configuring.
        #[arg(long)]
        wordpress: bool,
        #[arg(long)]
        start: bool,
    },
}

fn on(kind: OperationKind, project: String, params: OperationParams) -> OperationRequest {
    OperationRequest::new(
        OperationIdentity::Target {
            kind,
            target: Target(project),
        },
        params,
    )
}

impl Op {
    /// Request for every subcommand except `logs`, which runs through a log-follow session.
    pub fn into_request(self) -> Option<OperationRequest> {
        use OperationKind as K;

        let request = match self {
            Op::Start { project } => on(K::Start, project, OperationParams::None),
            Op::Stop { project } => on(K::Stop, project, OperationParams::None),
            Op::Restart { project } => on(K::Restart, project, OperationParams::None),
            Op::Delete { project } => on(K::Delete, project, OperationParams::None),
            Op::Poweroff => {
                OperationRequest::new(OperationIdentity::poweroff_all(), OperationParams::None)
            }
            Op::ImportDb {
                project,
                file,
                database,
                no_drop,
            } => on(
                K::ImportDb,
                project,
                OperationParams::ImportDb(ImportDbParams {
                    file_path: file,
                    database,
                    no_drop,
                }),
            ),
            Op::ExportDb {
                project,
                file,
                database,
                compression,
            } => on(
                K::ExportDb,
                project,
                OperationParams::ExportDb(ExportDbParams {
                    file_path: file,
                    database,
                    compression: compression.into(),
                }),
            ),
            Op::Snapshot { project, name } => on(
                K::CreateSnapshot,
                project,
                OperationParams::CreateSnapshot { name },
            ),
            Op::RestoreSnapshot { project, name } => on(
                K::RestoreSnapshot,
                project,
                OperationParams::Snapshot { name },
            ),
            Op::DeleteSnapshot { project, name } => on(
                K::DeleteSnapshot,
                project,
                OperationParams::Snapshot { name },
            ),
            Op::CleanupSnapshots { project } => {
                on(K::CleanupSnapshots, project, OperationParams::None)
            }
            Op::AddonInstall { project, addon } => {
                on(K::AddonInstall, project, OperationParams::Addon { addon })
            }
            Op::AddonRemove { project, addon } => {
                on(K::AddonRemove, project, OperationParams::Addon { addon })
            }
            Op::ChangeRuntime {
                project,
                runtime,
                version,
                approot,
            } => on(
                K::ChangeRuntimeVersion,
                project,
                OperationParams::RuntimeVersion(RuntimeVersionParams {
                    runtime: runtime.into(),
                    version,
                    approot,
                }),
            ),
            Op::Create {
                name,
                directory,
                project_type,
                php_version,
                database,
                webserver,
                docroot,
                composer,
                wordpress,
                start,
            } => on(
                K::CreateProject,
                name,
                OperationParams::CreateProject(CreateProjectParams {
                    directory,
                    project_type,
                    php_version,
                    database,
                    webserver,
                    docroot,
                    cms: match (composer, wordpress) {
                        (Some(package), _) => Some(CmsInstall::Composer { package }),
                        (None, true) => Some(CmsInstall::Wordpress),
                        (None, false) => None,
                    },
                    auto_start: start,
                }),
            ),
            Op::Logs { .. } => return None,
        };
        Some(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_defaults_to_gzip() {
        let args = Args::try_parse_from([
            "console",
            "export-db",
            "siteA",
            "--file",
            "/tmp/siteA.sql.gz",
        ])
        .expect("parse");

        let request = args.command.into_request().expect("request");
        assert_eq!(request.kind(), OperationKind::ExportDb);
        assert!(matches!(
            request.params,
            OperationParams::ExportDb(ExportDbParams {
                compression: Compression::Gzip,
                ..
            })
        ));
    }

    #[test]
    fn poweroff_targets_every_project() {
        let args = Args::try_parse_from(["console", "poweroff"]).expect("parse");
        let request = args.command.into_request().expect("request");
        assert!(request.target().is_fleet());
    }

    #[test]
    fn logs_are_not_plain_requests() {
        let args = Args::try_parse_from(["console", "logs", "siteA", "--service", "db", "-f"])
            .expect("parse");
        assert!(args.command.into_request().is_none());
    }

    #[test]
    fn runtime_change_needs_a_project_root() {
        let parsed = Args::try_parse_from([
            "console",
            "change-runtime",
            "siteA",
            "--runtime",
            "php",
            "8.3",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn create_takes_one_cms_at_most() {
        let args = Args::try_parse_from([
            "console",
            "create",
            "blog",
            "--directory",
            "/srv/blog",
            "--wordpress",
        ])
        .expect("parse");
        let request = args.command.into_request().expect("request");
        assert!(matches!(
            request.params,
            OperationParams::CreateProject(CreateProjectParams {
                cms: Some(CmsInstall::Wordpress),
                ..
            })
        ));

        let both = Args::try_parse_from([
            "console",
            "create",
            "blog",
            "--directory",
            "/srv/blog",
            "--wordpress",
            "--composer",
            "drupal/recommended-project",
        ]);
        assert!(both.is_err());
    }
}
