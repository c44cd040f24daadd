//! Logging for the relay engine.
//!
//! The engine prints action responses as JSON on stdout, so human-readable
//! logs go to stderr and the durable JSON log goes to a rolling file under
//! the runtime's state directory. Prompt and contract text never reaches a
//! log record; callers pass a [`TextDigest`] instead.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
        }
    }

    fn file_prefix(self) -> String {
        format!("relay.{}", self.as_str())
    }
}

/// Where log files live and how long they are kept. Files land in
/// `{state_dir}/logs`, next to the event log and snapshot file.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub state_dir: PathBuf,
    pub retention_days: u64,
}

impl LogConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            retention_days: 14,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub retention_days: u64,
    /// Expired log files removed during this init.
    pub removed_logs: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Size-and-fingerprint stand-in for prompt or contract text. Carries the
/// same `chars / 4` token estimate the runtime budgets with, so log
/// records line up with compaction telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextDigest {
    pub chars: usize,
    pub tokens: usize,
    pub fingerprint: String,
}

pub fn digest_text(text: &str) -> TextDigest {
    let chars = text.chars().count();
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    TextDigest {
        chars,
        tokens: chars.div_ceil(4),
        fingerprint: format!("{:012x}", hasher.finish() & 0xffff_ffff_ffff),
    }
}

impl std::fmt::Display for TextDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} chars ~{} tokens {}]",
            self.chars, self.tokens, self.fingerprint
        )
    }
}

/// Structured record for dispatch lifecycle events.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEventRecord<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub run_id: Option<&'a str>,
    pub partition: Option<&'a str>,
    pub sequence: Option<u64>,
    pub role: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub provider: Option<&'a str>,
    pub decision: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn emit_runtime_event(level: Level, process: ProcessKind, record: RuntimeEventRecord<'_>) {
    macro_rules! emit {
        ($macro:ident) => {
            tracing::$macro!(
                target: "relay.obs",
                process = process.as_str(),
                component = record.component,
                event = record.event,
                run_id = record.run_id.unwrap_or(""),
                partition = record.partition.unwrap_or(""),
                sequence = record.sequence.unwrap_or(0),
                role = record.role.unwrap_or(""),
                task_id = record.task_id.unwrap_or(""),
                provider = record.provider.unwrap_or(""),
                decision = record.decision.unwrap_or(""),
                error_code = record.error_code.unwrap_or(""),
                detail = record.detail.unwrap_or(""),
                "runtime_event"
            )
        };
    }
    match level {
        Level::ERROR => emit!(error),
        Level::WARN => emit!(warn),
        _ => emit!(info),
    }
}

/// Install the engine's subscriber: a daily-rolling JSON file layer plus a
/// compact stderr layer, filtered by `RUST_LOG` or `info`. Returns the
/// appender guard; dropping it flushes buffered records.
pub fn init_process_logging(
    process: ProcessKind,
    config: &LogConfig,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    let logs_dir = config.logs_dir();
    std::fs::create_dir_all(&logs_dir)?;
    let removed_logs = sweep_expired_logs(config, process)?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, process.file_prefix());
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    // stdout belongs to action responses; keep operator-facing logs on
    // stderr.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        retention_days: config.retention_days,
        removed_logs,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

/// Delete this process's log files whose last write predates the
/// retention window. Judged by mtime, so partially-written or oddly-named
/// rotations still age out.
fn sweep_expired_logs(config: &LogConfig, process: ProcessKind) -> anyhow::Result<usize> {
    let logs_dir = config.logs_dir();
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(config.retention_days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let prefix = format!("{}.", process.file_prefix());

    let mut removed = 0;
    for entry in std::fs::read_dir(&logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map(|modified| modified < cutoff)
            .unwrap_or(false);
        if expired && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
