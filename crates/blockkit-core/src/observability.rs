use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "blockkit.logs.jsonl";

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Logging settings read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilitySettings {
    pub enabled: bool,
    /// `BLOCKKIT_LOG_LEVEL` directive; `RUST_LOG` applies when unset or unparsable.
    pub level: Option<String>,
    /// JSONL output file; console output on stderr when unset.
    pub json_log_path: Option<PathBuf>,
}

impl ObservabilitySettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("BLOCKKIT_OBSERVABILITY_ENABLED")
            .map(|value| parse_bool_env(&value).unwrap_or(true))
            .unwrap_or(true);
        let level = lookup("BLOCKKIT_LOG_LEVEL").filter(|v| !v.trim().is_empty());
        let json_log_path = lookup("BLOCKKIT_JSON_LOG_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Self {
            enabled,
            level,
            json_log_path,
        }
    }

    fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        if let Some(level) = &self.level
            && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
        {
            return filter;
        }
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    }
}

/// Split a log path into the directory and file name handed to the appender.
fn log_file_target(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file_name)
}

/// Install the global tracing subscriber once per process.
///
/// Environment variables:
/// - `BLOCKKIT_OBSERVABILITY_ENABLED`: enable/disable flag (default enabled).
/// - `BLOCKKIT_LOG_LEVEL`: level/filter override (`info`, `blockkit_core=debug`, ...).
/// - `BLOCKKIT_JSON_LOG_PATH`: if set, logs are JSONL in that file, otherwise compact
///   console output on stderr. Stdout stays free for emitted events.
/// - `RUST_LOG`: fallback filter.
///
/// Config values reach logs only through [`AppConfig::masked`](crate::AppConfig::masked).
pub fn init_observability() {
    INIT.get_or_init(|| install(&ObservabilitySettings::from_env()));
}

fn install(settings: &ObservabilitySettings) {
    if !settings.enabled {
        return;
    }

    let env_filter = settings.env_filter();
    if let Some(path) = &settings.json_log_path {
        let (dir, file_name) = log_file_target(path);
        let _ = std::fs::create_dir_all(&dir);
        let writer = tracing_appender::rolling::never(dir, file_name);
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(false)
            .with_writer(writer);
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr);
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
    }
}
