use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{io, panic, thread, time::Duration};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{error, info};
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::FileOptions;

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024; // 10MB
const ARCHIVE_WAIT_MS: u64 = 300;
const LATEST_LOG: &str = "latest.log";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("subscriber init failed: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("time formatting failed: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Clone, Debug)]
pub struct LogOptions {
    pub debug: bool,
    pub use_color: bool,
    pub archive_on_exit: bool,
    pub console: bool,
    /// 日志目录，默认 `<data_dir>/logs`。
    pub logs_dir: PathBuf,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            use_color: true,
            archive_on_exit: true,
            console: true,
            logs_dir: PathBuf::from("logs"),
        }
    }
}

pub struct LogSystem {
    runtime: Arc<LogRuntime>,
}

impl LogSystem {
    /// `base_dir` 给出时日志写入 `<base_dir>/logs`。
    pub fn init_with_base(
        mut options: LogOptions,
        base_dir: Option<&Path>,
    ) -> Result<Self, LogError> {
        if let Some(base) = base_dir {
            options.logs_dir = base.join("logs");
        }
        Self::init(options)
    }

    pub fn init(options: LogOptions) -> Result<Self, LogError> {
        let logs_dir = options.logs_dir.clone();
        fs::create_dir_all(&logs_dir)?;
        let latest_log = logs_dir.join(LATEST_LOG);

        archive_if_large(&latest_log, &logs_dir)?;

        let file_appender = rolling::never(&logs_dir, LATEST_LOG);
        let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
            .lossy(false)
            .finish(file_appender);

        let console_level = if options.debug {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };

        // 浏览器驱动的内部日志很吵，控制台只保留 warn 以上
        let console_targets = Targets::new()
            .with_default(console_level)
            .with_target("chromiumoxide", LevelFilter::WARN)
            .with_target("tungstenite", LevelFilter::WARN)
            .with_target("hyper", LevelFilter::WARN)
            .with_target("reqwest", LevelFilter::WARN);

        let console_writer: BoxMakeWriter = if options.console {
            BoxMakeWriter::new(io::stderr)
        } else {
            BoxMakeWriter::new(io::sink)
        };

        let console_layer = fmt::layer()
            .with_target(options.debug)
            .with_level(true)
            .with_thread_names(options.debug)
            .with_ansi(options.use_color)
            .with_writer(console_writer)
            .with_filter(console_targets);

        let file_targets = Targets::new()
            .with_default(LevelFilter::DEBUG)
            .with_target("chromiumoxide", LevelFilter::INFO)
            .with_target("hyper", LevelFilter::INFO);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_writer(file_writer)
            .with_filter(file_targets);

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("global subscriber") || msg.contains("already") {
                    LogError::AlreadyInitialized
                } else {
                    LogError::SubscriberInit(e)
                }
            })?;

        let runtime = Arc::new(LogRuntime {
            logs_dir,
            latest_log,
            guard: Mutex::new(Some(guard)),
            exit_hooks: Mutex::new(Vec::new()),
            exit_called: AtomicBool::new(false),
            archive_on_exit: options.archive_on_exit,
        });

        runtime.install_panic_hook();

        Ok(Self { runtime })
    }

    pub fn add_exit_hook<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(mut hooks) = self.runtime.exit_hooks.lock() {
            hooks.push(Box::new(func));
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.runtime.logs_dir
    }

    pub fn safe_exit(&self) {
        self.runtime.safe_exit();
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        self.runtime.safe_exit();
    }
}

struct LogRuntime {
    logs_dir: PathBuf,
    latest_log: PathBuf,
    guard: Mutex<Option<WorkerGuard>>,
    exit_hooks: Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
    exit_called: AtomicBool,
    archive_on_exit: bool,
}

impl LogRuntime {
    fn install_panic_hook(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let thread_name = thread::current().name().unwrap_or("<unnamed>").to_string();
            if let Some(location) = info.location() {
                error!(
                    thread = %thread_name,
                    "panic at {}:{}: {}",
                    location.file(),
                    location.line(),
                    info
                );
            } else {
                error!(thread = %thread_name, "panic: {info}");
            }
            // worker 线程 panic 不应触发整体退出流程
            if thread_name == "main" {
                runtime.safe_exit();
            }
            previous(info);
        }));
    }

    fn safe_exit(&self) {
        if self.exit_called.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut hooks) = self.exit_hooks.lock() {
            while let Some(func) = hooks.pop() {
                func();
            }
        }

        if let Ok(mut guard) = self.guard.lock() {
            guard.take();
        }

        if self.archive_on_exit {
            thread::sleep(Duration::from_millis(ARCHIVE_WAIT_MS));
            if let Err(err) = archive_log_file(&self.latest_log, &self.logs_dir) {
                eprintln!("failed to archive log: {err}");
            }
        }
    }
}

fn archive_if_large(latest_log: &Path, logs_dir: &Path) -> Result<(), LogError> {
    let size = fs::metadata(latest_log).map(|m| m.len()).unwrap_or(0);
    if size >= MAX_LOG_BYTES {
        archive_log_file(latest_log, logs_dir)?;
    }
    Ok(())
}

/// 把 `latest.log` 打包成 `log_<时间戳>.zip`；空日志直接删除。
pub(crate) fn archive_log_file(
    latest_log: &Path,
    logs_dir: &Path,
) -> Result<Option<PathBuf>, LogError> {
    if !latest_log.exists() {
        return Ok(None);
    }
    let meta = fs::metadata(latest_log)?;
    if meta.len() == 0 {
        let _ = fs::remove_file(latest_log);
        return Ok(None);
    }

    let timestamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let mut archive_path = logs_dir.join(format!("log_{timestamp}.zip"));
    let mut dup = 1;
    while archive_path.exists() {
        archive_path = logs_dir.join(format!("log_{timestamp}_{dup}.zip"));
        dup += 1;
    }

    let file = File::create(&archive_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(format!("{timestamp}.log"), options)?;

    let mut source = File::open(latest_log)?;
    io::copy(&mut source, &mut zip)?;
    zip.finish()?;
    drop(source);

    let _ = fs::remove_file(latest_log);

    info!(target: "logging", "log archived to {}", archive_path.display());
    Ok(Some(archive_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_is_removed_without_archive() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LATEST_LOG);
        fs::write(&latest, b"").unwrap();

        let out = archive_log_file(&latest, dir.path()).unwrap();
        assert!(out.is_none());
        assert!(!latest.exists());
    }

    #[test]
    fn non_empty_log_is_zipped() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LATEST_LOG);
        fs::write(&latest, b"2026 INFO started\n").unwrap();

        let out = archive_log_file(&latest, dir.path()).unwrap().unwrap();
        assert!(out.exists());
        assert_eq!(out.extension().and_then(|e| e.to_str()), Some("zip"));
        assert!(!latest.exists());

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        let mut inner = archive.by_index(0).unwrap();
        let mut text = String::new();
        io::Read::read_to_string(&mut inner, &mut text).unwrap();
        assert!(text.contains("started"));
    }
}
