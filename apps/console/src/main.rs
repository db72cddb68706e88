use std::{process::ExitCode, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use console_core::{
    config::load_settings_from, load_settings, BusListener, CommandSurface, EventBus,
    LogFollowSession, LogMode, NoticeKind, OperationDispatcher, OperationOutcome,
    OperationSession, ProcessCommandSurface, ReadModelRefresher, SessionNotices,
};
use shared::{
    domain::{OperationKind, Target},
    protocol::{OutputEvent, OperationRequest, OutputStream},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Args, Op};

/// Echoes streamed output, optionally keeping only lines that contain a needle.
struct OutputPrinter {
    needle: Option<String>,
}

impl BusListener for OutputPrinter {
    fn on_output(&self, event: &OutputEvent) {
        if let Some(needle) = &self.needle {
            if !event.line.to_lowercase().contains(needle) {
                return;
            }
        }
        match event.stream {
            OutputStream::Primary => println!("{}", event.line),
            OutputStream::Secondary => eprintln!("{}", event.line),
        }
    }
}

/// The CLI keeps no project list, so a refresh only tells the user the state moved on.
struct StaleStateLog;

impl ReadModelRefresher for StaleStateLog {
    fn refresh(&self, kind: OperationKind, target: &Target) {
        info!(%kind, %target, "project state changed; re-query `describe` for fresh details");
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => load_settings_from(path, |key| std::env::var(key).ok()),
        None => load_settings(),
    }
    .context("failed to load console settings")?;

    let bus = EventBus::new();
    let surface: Arc<dyn CommandSurface> =
        Arc::new(ProcessCommandSurface::new(bus.clone(), &settings));
    let dispatcher = OperationDispatcher::new(&bus, surface)
        .with_refresher(Arc::new(StaleStateLog))
        .with_refresh_delay(settings.refresh_delay());

    let outcome = match args.command {
        Op::Logs {
            project,
            service,
            follow,
            tail,
            timestamps,
            filter,
        } => {
            let _printer = bus.subscribe(Arc::new(OutputPrinter {
                needle: filter.as_deref().map(str::to_lowercase),
            }));
            let (logs, notices) =
                LogFollowSession::open(&dispatcher, dispatcher.cancellation(), project, service);
            let mode = if follow { LogMode::Follow } else { LogMode::FetchOnce };
            let mut logs = logs
                .with_mode(mode)
                .with_tail(tail.or(settings.log_tail))
                .with_timestamps(timestamps);
            logs.set_filter(filter.as_deref());

            logs.start()
                .await
                .with_context(|| format!("failed to fetch logs for {}", logs.identity()))?;
            let outcome = await_outcome(notices, || logs.stop()).await?;
            info!(
                shown = logs.lines().len(),
                received = logs.all_lines().len(),
                "log stream closed"
            );
            outcome
        }
        op => {
            let Some(request) = op.into_request() else {
                bail!("subcommand has no operation request");
            };
            let _printer = bus.subscribe(Arc::new(OutputPrinter { needle: None }));
            run_operation(&dispatcher, request).await?
        }
    };

    bus.dispose();
    Ok(match outcome {
        OperationOutcome::Success => ExitCode::SUCCESS,
        OperationOutcome::Failure => ExitCode::FAILURE,
        OperationOutcome::UserCancelled => ExitCode::from(130),
    })
}

async fn run_operation(
    dispatcher: &OperationDispatcher,
    request: OperationRequest,
) -> Result<OperationOutcome> {
    let (session, notices) = OperationSession::open(
        dispatcher,
        dispatcher.cancellation(),
        request.identity.clone(),
    );
    session
        .dispatch(request.params)
        .await
        .with_context(|| format!("failed to dispatch {}", request.identity))?;

    await_outcome(notices, || session.cancel()).await
}

/// Waits for the terminal notice. Ctrl-C asks for cooperative cancellation once; the
/// operation still ends only when the producer reports it.
async fn await_outcome(
    mut notices: SessionNotices,
    cancel: impl Fn() -> bool,
) -> Result<OperationOutcome> {
    let mut interrupted = false;
    loop {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else {
                    bail!("session closed before the operation resolved");
                };
                match notice.kind {
                    NoticeKind::Started => {
                        if let Some(message) = notice.message {
                            info!(identity = %notice.identity, "{message}");
                        }
                    }
                    NoticeKind::Resolved(outcome) => {
                        let message = notice.message.unwrap_or_default();
                        let identity = &notice.identity;
                        match outcome {
                            OperationOutcome::Success => info!(%identity, "finished {message}"),
                            OperationOutcome::Failure => warn!(%identity, "failed: {message}"),
                            OperationOutcome::UserCancelled => {
                                info!(%identity, "cancelled {message}")
                            }
                        }
                        return Ok(outcome);
                    }
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("failed to listen for Ctrl-C")?;
                interrupted = true;
                if cancel() {
                    info!("cancellation requested; waiting for the process to stop");
                } else {
                    warn!("process not announced yet; nothing to cancel");
                }
            }
        }
    }
}
