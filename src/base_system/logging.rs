//! 日志系统：控制台 + `logs/latest.log` 文件，退出时压缩归档。
//!
//! 控制台只显示面向用户的 target（session/download/sources/startup），
//! 调度层（dispatch/queue/gate）只在 `--debug` 时出现；文件始终记录 DEBUG。
//! 同时安装 Ctrl-C 处理与 panic 钩子，保证退出钩子（取消下载、保存配置）只执行一次。

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::{io, panic, thread, time::Duration};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::{self, NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::FileOptions;

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024; // 10MB
const MAX_ARCHIVES: usize = 20;
const ARCHIVE_WAIT_MS: u64 = 1000; // file handles settle on Windows
const LATEST_LOG: &str = "latest.log";
const ARCHIVE_PREFIX: &str = "manga-scraper_";

/// 内部调度类 target，仅调试模式下在控制台可见。
const PLUMBING_TARGETS: &[&str] = &["dispatch", "queue", "gate"];

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

#[derive(Clone, Copy, Debug)]
pub struct LogOptions {
    /// 控制台显示 DEBUG 级别及 dispatch/queue/gate 内部日志。
    pub debug: bool,
    pub use_color: bool,
    pub archive_on_exit: bool,
    pub console: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            use_color: true,
            archive_on_exit: true,
            console: true,
        }
    }
}

/// 控制台层的 target 过滤器。
fn console_targets(debug: bool) -> Targets {
    if debug {
        return Targets::new().with_default(LevelFilter::DEBUG);
    }
    PLUMBING_TARGETS
        .iter()
        .fold(Targets::new().with_default(LevelFilter::INFO), |targets, t| {
            targets.with_target(*t, LevelFilter::WARN)
        })
}

fn console_layer<S>(options: &LogOptions) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    // progress bars own stdout, log lines go to stderr
    let writer = if options.console {
        BoxMakeWriter::new(io::stderr)
    } else {
        BoxMakeWriter::new(io::sink)
    };
    fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_thread_names(true)
        .with_ansi(options.use_color)
        .with_writer(writer)
        .with_filter(console_targets(options.debug))
}

fn file_layer<S>(writer: NonBlocking) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(LevelFilter::DEBUG)
}

pub struct LogSystem {
    runtime: Arc<LogRuntime>,
}

impl LogSystem {
    pub fn init(options: LogOptions) -> Result<Self, LogError> {
        Self::init_with_base(options, None)
    }

    /// 日志写入 `<base_dir>/logs`；未指定 base dir 时写入 `./logs`。
    pub fn init_with_base(options: LogOptions, base_dir: Option<&Path>) -> Result<Self, LogError> {
        let logs_dir = base_dir.map_or_else(|| PathBuf::from("logs"), |dir| dir.join("logs"));
        fs::create_dir_all(&logs_dir)?;
        let latest_log = logs_dir.join(LATEST_LOG);

        let archived_on_start = archive_if_large(&latest_log, &logs_dir)?;

        let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
            .lossy(false)
            .finish(rolling::never(&logs_dir, LATEST_LOG));

        tracing_subscriber::registry()
            .with(console_layer(&options))
            .with(file_layer(file_writer))
            .try_init()
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("global subscriber") || msg.contains("already") {
                    LogError::AlreadyInitialized
                } else {
                    LogError::SubscriberInit(e)
                }
            })?;

        if let Some(archive) = archived_on_start {
            info!(target: "startup", "previous log was large, archived to {}", archive.display());
        }

        let runtime = Arc::new(LogRuntime {
            logs_dir,
            latest_log,
            guard: Mutex::new(Some(guard)),
            exit_hooks: Mutex::new(Vec::new()),
            exit_called: AtomicBool::new(false),
            archive_on_exit: options.archive_on_exit,
        });

        runtime.install_signal_handler();
        runtime.install_panic_hook();

        Ok(Self { runtime })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.runtime.logs_dir
    }

    /// 注册退出（正常退出、Ctrl-C、panic）时执行一次的钩子，后注册的先执行。
    pub fn add_exit_hook<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.runtime
            .exit_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(func));
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

type ExitHook = Box<dyn FnOnce() + Send + 'static>;

struct LogRuntime {
    logs_dir: PathBuf,
    latest_log: PathBuf,
    guard: Mutex<Option<WorkerGuard>>,
    exit_hooks: Mutex<Vec<ExitHook>>,
    exit_called: AtomicBool,
    archive_on_exit: bool,
}

impl LogRuntime {
    fn install_signal_handler(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        if let Err(err) = ctrlc::set_handler(move || {
            info!(target: "startup", "interrupted, cancelling downloads");
            runtime.safe_exit();
            std::process::exit(130);
        }) {
            warn!(target: "startup", "cannot install Ctrl-C handler: {err}");
        }
    }

    fn install_panic_hook(self: &Arc<Self>) {
        let runtime = Arc::clone(self);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let thread = thread::current();
            let name = thread.name().unwrap_or("<unnamed>");
            match info.location() {
                Some(location) => error!(
                    "panic on {name} at {}:{}: {}",
                    location.file(),
                    location.line(),
                    info
                ),
                None => error!("panic on {name}: {info}"),
            }
            // download workers are caught and reported; only the main thread shuts down
            if name == "main" {
                runtime.safe_exit();
            }
            previous(info);
        }));
    }

    fn safe_exit(&self) {
        if self.exit_called.swap(true, Ordering::SeqCst) {
            return;
        }

        let hooks = std::mem::take(
            &mut *self
                .exit_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks.into_iter().rev() {
            hook();
        }

        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if self.archive_on_exit {
            thread::sleep(Duration::from_millis(ARCHIVE_WAIT_MS));
            match archive_log_file(&self.latest_log, &self.logs_dir) {
                Ok(_) => prune_archives(&self.logs_dir, MAX_ARCHIVES),
                // the subscriber's writer is gone at this point
                Err(err) => eprintln!("failed to archive log: {err}"),
            }
        }
    }
}

fn archive_if_large(latest_log: &Path, logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    match fs::metadata(latest_log) {
        Ok(meta) if meta.len() >= MAX_LOG_BYTES => archive_log_file(latest_log, logs_dir),
        _ => Ok(None),
    }
}

/// 把 `latest.log` 压缩为 `manga-scraper_<时间戳>.zip` 并删除原文件。
fn archive_log_file(latest_log: &Path, logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    let Ok(meta) = fs::metadata(latest_log) else {
        return Ok(None);
    };
    if meta.len() == 0 {
        let _ = fs::remove_file(latest_log);
        return Ok(None);
    }

    let timestamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let archive_path = logs_dir.join(format!("{ARCHIVE_PREFIX}{timestamp}.zip"));
    // copy first; the appender may still hold latest.log open
    let snapshot = logs_dir.join(format!("temp_{timestamp}.log"));
    fs::copy(latest_log, &snapshot)?;

    let mut zip = zip::ZipWriter::new(File::create(&archive_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(format!("{timestamp}.log"), options)?;
    io::copy(&mut File::open(&snapshot)?, &mut zip)?;
    zip.finish()?;

    let _ = fs::remove_file(&snapshot);
    let _ = fs::remove_file(latest_log);
    Ok(Some(archive_path))
}

/// 只保留最新的 `keep` 个归档；带时间戳的文件名按字典序即时间序。
fn prune_archives(logs_dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return;
    };
    let mut archives: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "zip")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(ARCHIVE_PREFIX))
        })
        .collect();
    if archives.len() <= keep {
        return;
    }
    archives.sort();
    let excess = archives.len() - keep;
    for old in archives.into_iter().take(excess) {
        let _ = fs::remove_file(old);
    }
}
