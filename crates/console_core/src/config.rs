use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "console.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSettings {
    pub cli_program: String,
    /// Prepended to `PATH` for spawned commands.
    pub search_paths: Vec<PathBuf>,
    pub refresh_delay_ms: u64,
    pub log_tail: Option<u32>,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            cli_program: "ddev".into(),
            search_paths: default_search_paths(),
            refresh_delay_ms: 1000,
            log_tail: None,
        }
    }
}

impl ConsoleSettings {
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }
}

/// Usual install locations of the CLI tool that a desktop-launched process may not have
/// on its `PATH`.
fn default_search_paths() -> Vec<PathBuf> {
    [
        "/opt/homebrew/bin",
        "/usr/local/bin",
        "/home/linuxbrew/.linuxbrew/bin",
        "/usr/bin",
        "/bin",
        "/usr/sbin",
        "/sbin",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    cli_program: Option<String>,
    search_paths: Option<Vec<PathBuf>>,
    refresh_delay_ms: Option<u64>,
    log_tail: Option<u32>,
}

pub fn load_settings() -> anyhow::Result<ConsoleSettings> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file at `path` if it exists, then environment overrides read
/// through `env`.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ConsoleSettings> {
    let mut settings = ConsoleSettings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            apply_file(&mut settings, file_cfg);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    }

    apply_env(&mut settings, env)?;
    Ok(settings)
}

fn apply_file(settings: &mut ConsoleSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.cli_program {
        settings.cli_program = v;
    }
    if let Some(v) = file_cfg.search_paths {
        settings.search_paths = v;
    }
    if let Some(v) = file_cfg.refresh_delay_ms {
        settings.refresh_delay_ms = v;
    }
    if let Some(v) = file_cfg.log_tail {
        settings.log_tail = Some(v);
    }
}

fn apply_env(
    settings: &mut ConsoleSettings,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = env("CONSOLE_CLI") {
        settings.cli_program = v;
    }
    if let Some(v) = env("APP__CLI_PROGRAM") {
        settings.cli_program = v;
    }

    if let Some(v) = env("APP__SEARCH_PATHS") {
        settings.search_paths = std::env::split_paths(&v).collect();
    }

    if let Some(v) = env("APP__REFRESH_DELAY_MS") {
        settings.refresh_delay_ms = v
            .trim()
            .parse()
            .with_context(|| format!("APP__REFRESH_DELAY_MS is not a number: {v}"))?;
    }

    if let Some(v) = env("APP__LOG_TAIL") {
        let tail: u32 = v
            .trim()
            .parse()
            .with_context(|| format!("APP__LOG_TAIL is not a number: {v}"))?;
        settings.log_tail = (tail > 0).then_some(tail);
    }

    Ok(())
}
