use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OBS_TARGET: &str = "crabgrass.obs";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Cli,
    Embedded,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Cli => "cli",
            ProcessKind::Embedded => "embedded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Structured lifecycle record for the sync layer. Empty fields are logged
/// as empty strings so every JSONL line has the same shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub entity: Option<&'a str>,
    pub document: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub edit_id: Option<&'a str>,
    pub attempt: Option<u32>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> SyncEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            ..Default::default()
        }
    }
}

/// Masks user-authored text (chat turns, document bodies) before logging.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted chars={} hash={}]",
        trimmed.chars().count(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn emit_event(level: Level, process: ProcessKind, event: SyncEvent<'_>) {
    let attempt = event.attempt.map(i64::from).unwrap_or(-1);
    macro_rules! emit {
        ($macro:ident) => {
            tracing::$macro!(
                target: OBS_TARGET,
                process = process.as_str(),
                component = event.component,
                event = event.event,
                entity = event.entity.unwrap_or(""),
                document = event.document.unwrap_or(""),
                session_id = event.session_id.unwrap_or(""),
                edit_id = event.edit_id.unwrap_or(""),
                attempt,
                status = event.status.unwrap_or(""),
                detail = event.detail.unwrap_or(""),
                "sync_event"
            )
        };
    }
    match level {
        Level::ERROR => emit!(error),
        Level::WARN => emit!(warn),
        Level::DEBUG | Level::TRACE => emit!(debug),
        _ => emit!(info),
    }
}

/// Installs a compact console layer plus a daily JSONL file layer. The
/// returned guard must be held for the life of the process or buffered
/// lines are lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days, Utc::now())?;

    let prefix = log_prefix(process);
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix,
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn log_prefix(process: ProcessKind) -> String {
    format!("crabgrass.{}", process.as_str())
}

fn cleanup_old_jsonl(
    logs_dir: &Path,
    process: &str,
    retention_days: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let cutoff = now - chrono::Duration::days(retention_days as i64);
    let prefix = format!("crabgrass.{}.", process);
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        // crabgrass.<proc>.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");

        let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff
            && fs::remove_file(&path).is_ok()
        {
            removed += 1;
        }
    }

    Ok(removed)
}

/// `<data dir>/crabgrass/logs`, falling back to `./.crabgrass/logs`.
pub fn default_logs_dir() -> PathBuf {
    std::env::var_os("CRABGRASS_LOG_DIR")
        .map(PathBuf::from)
        .or_else(|| dirs::data_local_dir().map(|root| root.join("crabgrass").join("logs")))
        .unwrap_or_else(|| PathBuf::from(".crabgrass").join("logs"))
}
