//! Process-wide tracing setup and per-run NDJSON log files.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::{DateTime, Utc};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const LOG_ENV: &str = "PODSEED_LOG";
pub const LOG_DIR_ENV: &str = "PODSEED_LOG_DIR";
const FALLBACK_DIRECTIVE: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Discover,
    Upload,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Upload => "upload",
        }
    }
}

type RunFile = Option<BufWriter<File>>;

fn run_file() -> &'static Mutex<RunFile> {
    static RUN_FILE: OnceLock<Mutex<RunFile>> = OnceLock::new();
    RUN_FILE.get_or_init(|| Mutex::new(None))
}

fn lock_run_file() -> MutexGuard<'static, RunFile> {
    run_file().lock().unwrap_or_else(|e| e.into_inner())
}

/// `MakeWriter` that forwards each formatted event into the active run file,
/// or drops it when no run is active.
#[derive(Debug, Clone, Copy)]
struct ActiveRunFile;

struct RunFileLine(MutexGuard<'static, RunFile>);

impl Write for RunFileLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.as_mut().map_or(Ok(()), |file| file.flush())
    }
}

impl<'a> MakeWriter<'a> for ActiveRunFile {
    type Writer = RunFileLine;

    fn make_writer(&'a self) -> Self::Writer {
        RunFileLine(lock_run_file())
    }
}

/// First candidate that is set and parses wins; otherwise `info`.
fn filter_from(candidates: &[Option<&str>]) -> EnvFilter {
    candidates
        .iter()
        .flatten()
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(FALLBACK_DIRECTIVE))
}

fn filter_from_env() -> EnvFilter {
    let podseed = std::env::var(LOG_ENV).ok();
    let rust = std::env::var("RUST_LOG").ok();
    filter_from(&[podseed.as_deref(), rust.as_deref()])
}

/// Installs the global subscriber once: run-file NDJSON plus an optional
/// `extra` layer such as the CLI's stderr output.
pub fn init_run_logging_with<L>(extra: Option<L>)
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let ndjson = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(ActiveRunFile);
        let _ = tracing_subscriber::registry()
            .with(extra)
            .with(ndjson)
            .with(filter_from_env())
            .try_init();
    });
}

pub fn init_run_logging() {
    init_run_logging_with(None::<tracing_subscriber::layer::Identity>);
}

/// Closes the run file when dropped.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(mut file) = lock_run_file().take() {
            let _ = file.flush();
            let _ = file.get_ref().sync_all();
        }
    }
}

/// Starts routing every event into a fresh file under the log directory.
///
/// At most one run log is open per process; a second call while one is
/// active fails with `AlreadyExists`.
pub fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> io::Result<RunLogGuard> {
    init_run_logging();

    let dir = log_dir(data_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(run_log_file_name(kind, run_id, Utc::now()));

    let mut active = lock_run_file();
    if active.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "a run log is already open",
        ));
    }
    let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    *active = Some(BufWriter::new(file));
    Ok(RunLogGuard { path })
}

fn log_dir(data_dir: &Path) -> PathBuf {
    std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"))
}

/// `run-<kind>-<utc stamp>-<run id>.ndjson`, with anything outside
/// `[A-Za-z0-9._-]` in the run id replaced by `_`.
fn run_log_file_name(kind: RunKind, run_id: &str, started: DateTime<Utc>) -> String {
    let run_id: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "run-{}-{}-{run_id}.ndjson",
        kind.as_str(),
        started.format("%Y%m%dT%H%M%SZ")
    )
}
