//! Logging for the viewer.
//!
//! Every run writes its own session log, `aw-man<pid>.log`, following the
//! same per-process naming as the IPC socket; logs from earlier sessions
//! are pruned down to a small keep-count at startup. The console stays
//! terse unless `--debug` raises it, while the session file always records
//! debug detail so a bug report can include the whole run.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, util::SubscriberInitExt};

/// Re-export so callers do not need `tracing-subscriber` directly.
pub use tracing_subscriber::filter::LevelFilter as LogLevel;

static LOG_HANDLE: OnceLock<LogHandle> = OnceLock::new();

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding per-session log files.
    pub directory: PathBuf,
    /// Session files from earlier runs to keep around.
    pub keep_sessions: usize,
    /// Minimum level written to stderr; the session file is always debug.
    pub console_level: LevelFilter,
    /// Optional filter directive, e.g. `aw_man_core=trace`.
    pub env_filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            keep_sessions: 5,
            console_level: if cfg!(debug_assertions) {
                LevelFilter::INFO
            } else {
                LevelFilter::WARN
            },
            env_filter: ["AWMAN_LOG", "RUST_LOG"]
                .iter()
                .find_map(|var| std::env::var(var).ok())
                .filter(|directive| !directive.trim().is_empty()),
        }
    }
}

impl LogConfig {
    pub fn with_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.directory = path.into();
        self
    }

    pub fn with_console_level(mut self, level: LevelFilter) -> Self {
        self.console_level = level;
        self
    }
}

/// Handle returned from [`init`] owning the background logging worker.
#[derive(Debug)]
pub struct LogHandle {
    _guard: tracing_appender::non_blocking::WorkerGuard,
    session_file: PathBuf,
}

impl LogHandle {
    /// The log file written by this process.
    pub fn session_file(&self) -> &Path {
        &self.session_file
    }
}

/// Installs the global subscriber. The first call wins; later calls ignore
/// their configuration and hand back the handle from the first.
pub fn init(config: LogConfig) -> Result<&'static LogHandle> {
    if let Some(handle) = LOG_HANDLE.get() {
        return Ok(handle);
    }

    let handle = setup(config)?;
    let _ = LOG_HANDLE.set(handle);
    Ok(LOG_HANDLE.get().expect("log handle installed"))
}

fn setup(config: LogConfig) -> Result<LogHandle> {
    fs::create_dir_all(&config.directory)
        .with_context(|| format!("creating log directory {}", config.directory.display()))?;
    prune_stale_sessions(&config.directory, config.keep_sessions);

    let session_file = config.directory.join(format!("aw-man{}.log", std::process::id()));
    let sink = File::create(&session_file)
        .with_context(|| format!("creating session log {}", session_file.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(sink);

    let directive = config
        .env_filter
        .unwrap_or_else(|| if cfg!(debug_assertions) { "debug" } else { "info" }.to_string());
    let env_filter = EnvFilter::try_new(directive).context("parsing log filter directive")?;

    // The archive and IPC dependencies speak the `log` facade; route their
    // records into the same subscriber.
    let _ = tracing_log::LogTracer::init();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_file(true)
                .with_line_number(true)
                .with_filter(LevelFilter::DEBUG),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(config.console_level),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))?;

    Ok(LogHandle { _guard: guard, session_file })
}

/// Logs from dead sessions pile up in the directory; keep the freshest few
/// and delete the rest. Nothing here is fatal.
fn prune_stale_sessions(directory: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(directory) else { return };

    let mut sessions: Vec<(SystemTime, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_session_log(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| {
            let touched = entry.metadata().and_then(|meta| meta.modified()).ok()?;
            Some((touched, entry.path()))
        })
        .collect();

    sessions.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, stale) in sessions.into_iter().skip(keep) {
        let _ = fs::remove_file(stale);
    }
}

/// `aw-man<pid>.log`, the same shape the socket uses.
fn is_session_log(name: &str) -> bool {
    name.strip_prefix("aw-man")
        .and_then(|rest| rest.strip_suffix(".log"))
        .is_some_and(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()))
}

fn default_log_directory() -> PathBuf {
    match directories::ProjectDirs::from("", "", "aw-man") {
        Some(dirs) => dirs.data_dir().join("logs"),
        None => std::env::temp_dir().join("aw-man-logs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn session_logs_in(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| is_session_log(name))
            .collect()
    }

    #[test]
    fn prunes_only_stale_session_logs() {
        let temp = tempfile::tempdir().unwrap();
        for name in ["aw-man100.log", "aw-man200.log", "aw-man300.log"] {
            fs::write(temp.path().join(name), b"old session").unwrap();
            sleep(Duration::from_millis(20));
        }
        fs::write(temp.path().join("notes.log"), b"unrelated").unwrap();

        prune_stale_sessions(temp.path(), 1);

        assert_eq!(session_logs_in(temp.path()).len(), 1);
        assert!(temp.path().join("notes.log").exists(), "non-session files are untouched");
    }

    #[test]
    fn session_log_names_are_strict() {
        assert!(is_session_log("aw-man4242.log"));
        assert!(!is_session_log("aw-man.log"));
        assert!(!is_session_log("aw-man12.log.old"));
        assert!(!is_session_log("aw-manx.log"));
        assert!(!is_session_log("reader.log"));
    }

    #[test]
    fn repeated_init_returns_the_first_handle() {
        let temp = tempfile::tempdir().unwrap();

        let first =
            init(LogConfig::default().with_directory(temp.path())).expect("first init");
        let expected = format!("aw-man{}.log", std::process::id());
        assert_eq!(
            first.session_file().file_name().unwrap().to_string_lossy(),
            expected.as_str()
        );
        assert!(first.session_file().exists());

        let again = init(LogConfig::default().with_directory(temp.path().join("elsewhere")))
            .expect("second init");
        assert_eq!(first.session_file(), again.session_file());
    }
}
