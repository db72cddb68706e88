use std::{
    collections::{HashMap, VecDeque},
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use shared::{
    domain::{OperationIdentity, OperationKind, ProcessHandle},
    protocol::{
        CmsInstall, Compression, CreateProjectParams, OperationParams, OperationRequest,
        OutputEvent, OutputStream, StatusEvent,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::watch,
};
use tokio_stream::{wrappers::LinesStream, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    bus::EventBus,
    config::ConsoleSettings,
    error::{CancelError, DispatchError},
    CommandSurface,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    CreateDir(PathBuf),
    /// Informational line published as primary output.
    Announce(String),
    Run {
        args: Vec<String>,
        working_dir: Option<PathBuf>,
        announce: bool,
    },
    /// A helper program other than the CLI tool, run in `working_dir`.
    Tool {
        program: String,
        args: Vec<String>,
        working_dir: PathBuf,
        on_failure: ToolFailure,
    },
    /// Expanded into [`wordpress_steps`] once WP-CLI availability is known.
    InstallWordpress(PathBuf),
    /// Best-effort removal; a missing file is not an error.
    RemoveFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    /// Ends the plan with `<prefix>: <reason>`.
    Fail(String),
    /// Publishes the line on the secondary stream and carries on.
    Warn(String),
}

const CMS_FAILED: &str = "CMS installation failed";
const WORDPRESS_ARCHIVE_URL: &str = "https://wordpress.org/latest.zip";
const WORDPRESS_ARCHIVE: &str = "wordpress-latest.zip";
const WORDPRESS_MOVE_SCRIPT: &str = "if [ -d wordpress ]; then \
echo 'Moving WordPress files to project root...'; \
mv wordpress/* . && mv wordpress/.[!.]* . 2>/dev/null; rmdir wordpress; fi";

impl PlanStep {
    fn run(args: Vec<String>) -> Self {
        Self::Run {
            args,
            working_dir: None,
            announce: false,
        }
    }

    fn run_in(args: Vec<String>, dir: &Path) -> Self {
        Self::Run {
            args,
            working_dir: Some(dir.to_path_buf()),
            announce: true,
        }
    }

    fn tool(program: &str, args: Vec<String>, dir: &Path, on_failure: ToolFailure) -> Self {
        Self::Tool {
            program: program.to_owned(),
            args,
            working_dir: dir.to_path_buf(),
            on_failure,
        }
    }
}

/// Steps that realize one operation, all under a single process handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub steps: Vec<PlanStep>,
    started_message: Option<String>,
}

impl CommandPlan {
    fn single(args: Vec<String>) -> Self {
        Self {
            steps: vec![PlanStep::run(args)],
            started_message: None,
        }
    }

    pub fn started_message(&self, program: &str) -> String {
        if let Some(message) = &self.started_message {
            return message.clone();
        }
        let args = self.steps.iter().find_map(|step| match step {
            PlanStep::Run { args, .. } => Some(args.join(" ")),
            _ => None,
        });
        format!("Running: {program} {}", args.unwrap_or_default())
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.into_iter().map(str::to_owned).collect()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Maps a request onto CLI invocations. Pure; nothing is spawned.
pub fn plan_for(request: &OperationRequest) -> Result<CommandPlan, DispatchError> {
    let kind = request.kind();
    if !request.params.fits(kind) {
        return Err(DispatchError::InvalidParams(kind));
    }
    let project = request.target().as_str();

    let plan = match (kind, &request.params) {
        (OperationKind::Start, _) => CommandPlan::single(args(["start", project])),
        (OperationKind::Stop, _) => CommandPlan::single(args(["stop", project])),
        (OperationKind::Restart, _) => CommandPlan::single(args(["restart", project])),
        (OperationKind::Delete, _) => {
            CommandPlan::single(args(["delete", "--omit-snapshot", "--yes", project]))
        }
        (OperationKind::PoweroffAll, _) => CommandPlan::single(args(["poweroff"])),
        (OperationKind::ImportDb, OperationParams::ImportDb(params)) => {
            let mut argv = vec![
                "import-db".to_owned(),
                format!("--file={}", params.file_path.display()),
            ];
            if let Some(db) = non_empty(&params.database) {
                argv.push(format!("--database={db}"));
            }
            if params.no_drop {
                argv.push("--no-drop".into());
            }
            argv.push(project.into());
            CommandPlan::single(argv)
        }
        (OperationKind::ExportDb, OperationParams::ExportDb(params)) => {
            let mut argv = vec![
                "export-db".to_owned(),
                format!("--file={}", params.file_path.display()),
            ];
            if let Some(db) = non_empty(&params.database) {
                argv.push(format!("--database={db}"));
            }
            match params.compression {
                Compression::Gzip => {}
                Compression::Bzip2 => argv.push("--bzip2".into()),
                Compression::Xz => argv.push("--xz".into()),
            }
            argv.push(project.into());
            CommandPlan::single(argv)
        }
        (OperationKind::CreateSnapshot, OperationParams::CreateSnapshot { name }) => {
            match non_empty(name) {
                Some(name) => CommandPlan::single(args(["snapshot", "--name", name, project])),
                None => CommandPlan::single(args(["snapshot", project])),
            }
        }
        (OperationKind::RestoreSnapshot, OperationParams::Snapshot { name }) => {
            CommandPlan::single(args(["snapshot", "restore", name.as_str(), project]))
        }
        (OperationKind::DeleteSnapshot, OperationParams::Snapshot { name }) => {
            CommandPlan::single(args([
                "snapshot",
                "--cleanup",
                "--name",
                name.as_str(),
                "-y",
                project,
            ]))
        }
        (OperationKind::CleanupSnapshots, _) => {
            CommandPlan::single(args(["snapshot", "--cleanup", "-y", project]))
        }
        (OperationKind::AddonInstall, OperationParams::Addon { addon }) => {
            CommandPlan::single(args(["add-on", "get", addon.as_str(), "--project", project]))
        }
        (OperationKind::AddonRemove, OperationParams::Addon { addon }) => {
            CommandPlan::single(args(["add-on", "remove", addon.as_str(), "--project", project]))
        }
        (OperationKind::ChangeRuntimeVersion, OperationParams::RuntimeVersion(params)) => {
            let flag = format!("--{}={}", params.runtime.config_flag(), params.version);
            CommandPlan {
                steps: vec![
                    PlanStep::run_in(vec!["config".into(), flag], &params.approot),
                    PlanStep::Announce("Restarting project...".into()),
                    PlanStep::Run {
                        args: args(["restart"]),
                        working_dir: Some(params.approot.clone()),
                        announce: false,
                    },
                ],
                started_message: Some(format!(
                    "Changing {} to {}",
                    params.runtime.display_name(),
                    params.version
                )),
            }
        }
        (OperationKind::GetLogs, OperationParams::Logs(params)) => {
            let service = request
                .identity
                .sub_stream()
                .map(|service| service.as_str().to_owned())
                .unwrap_or_default();
            let mut argv = args(["logs", "-s", service.as_str()]);
            if params.follow {
                argv.push("-f".into());
            }
            if let Some(tail) = params.tail {
                argv.push(format!("--tail={tail}"));
            }
            if params.timestamps {
                argv.push("-t".into());
            }
            argv.push(project.into());
            CommandPlan {
                steps: vec![PlanStep::run(argv)],
                started_message: Some(format!("Getting logs for {project} ({service})")),
            }
        }
        (OperationKind::CreateProject, OperationParams::CreateProject(params)) => {
            create_project_plan(project, params)
        }
        (kind, _) => return Err(DispatchError::Unsupported(kind)),
    };
    Ok(plan)
}

fn create_project_plan(name: &str, params: &CreateProjectParams) -> CommandPlan {
    let mut config = vec![
        "config".to_owned(),
        format!("--project-name={name}"),
        "--create-docroot".to_owned(),
    ];
    let optional = [
        ("--project-type", &params.project_type),
        ("--php-version", &params.php_version),
        ("--database", &params.database),
        ("--webserver-type", &params.webserver),
        ("--docroot", &params.docroot),
    ];
    for (flag, value) in optional {
        if let Some(value) = non_empty(value) {
            config.push(format!("{flag}={value}"));
        }
    }

    let dir = params.directory.as_path();
    let mut steps = vec![PlanStep::CreateDir(dir.to_path_buf())];
    match &params.cms {
        Some(CmsInstall::Composer { package }) => {
            steps.push(PlanStep::Announce(format!(
                "Installing {package} via Composer..."
            )));
            steps.push(PlanStep::tool(
                "composer",
                args(["create-project", package.as_str(), "."]),
                dir,
                ToolFailure::Fail(CMS_FAILED.into()),
            ));
        }
        Some(CmsInstall::Wordpress) => steps.push(PlanStep::InstallWordpress(dir.to_path_buf())),
        None => {}
    }
    steps.push(PlanStep::run_in(config, dir));
    if params.auto_start {
        steps.push(PlanStep::run_in(args(["start"]), &params.directory));
    }
    CommandPlan {
        steps,
        started_message: None,
    }
}

/// WordPress core into `dir`: `wp core download` when WP-CLI is installed, otherwise the
/// release archive is fetched, unpacked and moved up out of its `wordpress/` folder.
pub fn wordpress_steps(dir: &Path, wp_cli: bool) -> Vec<PlanStep> {
    let fail = || ToolFailure::Fail(CMS_FAILED.into());
    if wp_cli {
        return vec![
            PlanStep::Announce("Installing WordPress via WP-CLI...".into()),
            PlanStep::tool("wp", args(["core", "download"]), dir, fail()),
        ];
    }

    let archive = dir.join(WORDPRESS_ARCHIVE);
    let archive_arg = archive.display().to_string();
    vec![
        PlanStep::Announce("Downloading WordPress from wordpress.org...".into()),
        PlanStep::tool(
            "curl",
            args(["-L", "-o", archive_arg.as_str(), WORDPRESS_ARCHIVE_URL]),
            dir,
            fail(),
        ),
        PlanStep::Announce("Extracting WordPress...".into()),
        PlanStep::tool("unzip", args(["-q", archive_arg.as_str()]), dir, fail()),
        PlanStep::tool(
            "sh",
            args(["-c", WORDPRESS_MOVE_SCRIPT]),
            dir,
            ToolFailure::Warn("Warning: Could not move some WordPress files".into()),
        ),
        PlanStep::RemoveFile(archive),
    ]
}

struct RunningProcess {
    identity: OperationIdentity,
    cancel: watch::Sender<bool>,
}

type Registry = Mutex<HashMap<ProcessHandle, RunningProcess>>;

#[derive(Debug)]
enum StepOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

struct Runner {
    bus: EventBus,
    program: String,
    path_env: Option<OsString>,
    registry: Registry,
}

impl Runner {
    fn registry(&self) -> MutexGuard<'_, HashMap<ProcessHandle, RunningProcess>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_line(
        &self,
        identity: &OperationIdentity,
        line: impl Into<String>,
        stream: OutputStream,
    ) {
        self.bus
            .publish_output(&OutputEvent::for_identity(identity, line, stream));
    }

    /// `<program> --version` exits successfully on the runner's search path.
    async fn tool_available(&self, program: &str) -> bool {
        let mut command = Command::new(program);
        command
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = &self.path_env {
            command.env("PATH", path);
        }
        matches!(command.status().await, Ok(status) if status.success())
    }

    async fn run_plan(
        self: Arc<Self>,
        identity: OperationIdentity,
        handle: ProcessHandle,
        plan: CommandPlan,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut outcome = StepOutcome::Succeeded;
        let mut steps = VecDeque::from(plan.steps);
        while let Some(step) = steps.pop_front() {
            if *cancel.borrow() {
                outcome = StepOutcome::Cancelled;
                break;
            }
            outcome = match step {
                PlanStep::CreateDir(dir) => match tokio::fs::create_dir_all(&dir).await {
                    Ok(()) => StepOutcome::Succeeded,
                    Err(err) => StepOutcome::Failed(format!("Failed to create directory: {err}")),
                },
                PlanStep::Announce(line) => {
                    self.emit_line(&identity, line, OutputStream::Primary);
                    StepOutcome::Succeeded
                }
                PlanStep::Run {
                    args,
                    working_dir,
                    announce,
                } => {
                    if announce {
                        self.emit_line(
                            &identity,
                            format!("Running: {} {}", self.program, args.join(" ")),
                            OutputStream::Primary,
                        );
                    }
                    self.run_step(
                        &identity,
                        &self.program,
                        &args,
                        working_dir.as_deref(),
                        &mut cancel,
                    )
                    .await
                }
                PlanStep::Tool {
                    program,
                    args,
                    working_dir,
                    on_failure,
                } => {
                    let dir = Some(working_dir.as_path());
                    let result = self
                        .run_step(&identity, &program, &args, dir, &mut cancel)
                        .await;
                    match (result, on_failure) {
                        (StepOutcome::Failed(reason), ToolFailure::Fail(prefix)) => {
                            StepOutcome::Failed(format!("{prefix}: {reason}"))
                        }
                        (StepOutcome::Failed(reason), ToolFailure::Warn(line)) => {
                            debug!(identity = %identity, %program, %reason, "tolerated failure");
                            self.emit_line(&identity, line, OutputStream::Secondary);
                            StepOutcome::Succeeded
                        }
                        (result, _) => result,
                    }
                }
                PlanStep::InstallWordpress(dir) => {
                    let wp_cli = self.tool_available("wp").await;
                    debug!(identity = %identity, wp_cli, "installing WordPress");
                    for step in wordpress_steps(&dir, wp_cli).into_iter().rev() {
                        steps.push_front(step);
                    }
                    StepOutcome::Succeeded
                }
                PlanStep::RemoveFile(path) => {
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        debug!(path = %path.display(), error = %err, "file not removed");
                    }
                    StepOutcome::Succeeded
                }
            };
            if !matches!(outcome, StepOutcome::Succeeded) {
                break;
            }
        }

        // Whoever takes the registry entry reports the terminal phase.
        if self.registry().remove(&handle).is_none() {
            debug!(handle = %handle, ?outcome, "process already reported as cancelled");
            return;
        }
        let event = match outcome {
            StepOutcome::Succeeded => {
                StatusEvent::finished(identity).with_message("Command completed successfully")
            }
            StepOutcome::Failed(message) => StatusEvent::error(identity, message),
            StepOutcome::Cancelled => StatusEvent::cancelled(identity),
        };
        event_with_handle(&self.bus, event, handle);
    }

    async fn run_step(
        &self,
        identity: &OperationIdentity,
        program: &str,
        argv: &[String],
        working_dir: Option<&Path>,
        cancel: &mut watch::Receiver<bool>,
    ) -> StepOutcome {
        let mut command = Command::new(program);
        command
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = &self.path_env {
            command.env("PATH", path);
        }
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return StepOutcome::Failed(format!("Failed to start command: {err}")),
        };
        debug!(identity = %identity, %program, args = ?argv, "spawned");

        let mut lines = line_stream(child.stdout.take(), OutputStream::Primary)
            .merge(line_stream(child.stderr.take(), OutputStream::Secondary));

        loop {
            tokio::select! {
                _ = cancel_requested(cancel) => {
                    if let Err(err) = child.kill().await {
                        warn!(identity = %identity, error = %err, "cancelled process not killed");
                    }
                    return StepOutcome::Cancelled;
                }
                next = lines.next() => match next {
                    Some(Ok((stream, line))) => self.emit_line(identity, line, stream),
                    Some(Err(err)) => {
                        debug!(identity = %identity, error = %err, "unreadable output line skipped")
                    }
                    None => break,
                },
            }
        }

        tokio::select! {
            _ = cancel_requested(cancel) => {
                if let Err(err) = child.kill().await {
                    warn!(identity = %identity, error = %err, "cancelled process not killed");
                }
                StepOutcome::Cancelled
            }
            status = child.wait() => match status {
                Ok(status) if status.success() => StepOutcome::Succeeded,
                Ok(status) => StepOutcome::Failed(format!("Command failed ({status})")),
                Err(err) => StepOutcome::Failed(format!("Command failed: {err}")),
            },
        }
    }
}

fn event_with_handle(bus: &EventBus, mut event: StatusEvent, handle: ProcessHandle) {
    event.process_handle = Some(handle);
    bus.publish_status(&event);
}

type LineStream = Pin<Box<dyn Stream<Item = io::Result<(OutputStream, String)>> + Send>>;

fn line_stream<R>(reader: Option<R>, stream: OutputStream) -> LineStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    match reader {
        Some(reader) => Box::pin(
            LinesStream::new(BufReader::new(reader).lines())
                .map(move |line| line.map(|line| (stream, line))),
        ),
        None => Box::pin(tokio_stream::empty()),
    }
}

/// Resolves once cancellation is requested or the requesting side is gone.
async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

fn search_path(extra: &[PathBuf]) -> Option<OsString> {
    if extra.is_empty() {
        return None;
    }
    let current = std::env::var_os("PATH");
    let paths = extra
        .iter()
        .cloned()
        .chain(current.iter().flat_map(std::env::split_paths));
    match std::env::join_paths(paths) {
        Ok(joined) => Some(joined),
        Err(err) => {
            warn!(error = %err, "search paths not usable; keeping inherited PATH");
            None
        }
    }
}

/// [`CommandSurface`] that runs the CLI tool as child processes and reports their progress
/// on the bus.
///
/// `Started` (with the generated `proc_<n>` handle) is published before anything is spawned,
/// then output lines, then exactly one terminal status per handle.
pub struct ProcessCommandSurface {
    runner: Arc<Runner>,
    next_handle: AtomicU64,
}

impl ProcessCommandSurface {
    pub fn new(bus: EventBus, settings: &ConsoleSettings) -> Self {
        Self {
            runner: Arc::new(Runner {
                bus,
                program: settings.cli_program.clone(),
                path_env: search_path(&settings.search_paths),
                registry: Mutex::default(),
            }),
            next_handle: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self, handle: &ProcessHandle) -> bool {
        self.runner.registry().contains_key(handle)
    }

    pub fn running_count(&self) -> usize {
        self.runner.registry().len()
    }
}

#[async_trait]
impl CommandSurface for ProcessCommandSurface {
    async fn execute(
        &self,
        request: &OperationRequest,
    ) -> Result<Option<ProcessHandle>, DispatchError> {
        let plan = plan_for(request)?;
        let handle = ProcessHandle::new(format!(
            "proc_{}",
            self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
        ));
        let identity = request.identity.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.runner.registry().insert(
            handle.clone(),
            RunningProcess {
                identity: identity.clone(),
                cancel: cancel_tx,
            },
        );
        self.runner.bus.publish_status(
            &StatusEvent::started(identity.clone(), Some(handle.clone()))
                .with_message(plan.started_message(&self.runner.program)),
        );
        info!(identity = %identity, handle = %handle, "operation launched");

        tokio::spawn(Arc::clone(&self.runner).run_plan(identity, handle.clone(), plan, cancel_rx));
        Ok(Some(handle))
    }

    async fn cancel(&self, handle: &ProcessHandle) -> Result<(), CancelError> {
        let entry = self
            .runner
            .registry()
            .remove(handle)
            .ok_or_else(|| CancelError::NotFound(handle.clone()))?;

        // The receiver may already be gone if the last step just exited.
        let _ = entry.cancel.send(true);
        info!(identity = %entry.identity, handle = %handle, "operation cancelled");
        event_with_handle(
            &self.runner.bus,
            StatusEvent::cancelled(entry.identity).with_message("Command was cancelled by user"),
            handle.clone(),
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/runner_tests.rs"]
mod tests;
