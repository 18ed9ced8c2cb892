//! 单章下载状态机（DownloadCoordinator）。
//!
//! 每次下载尝试：向 [`FairGate`] 申请名额 → 调用外部下载器 → 进度与完成事件
//! 经 [`Marshaller`] 回到主上下文 → 释放名额。名额只在完成处理中释放一次；
//! 重复或过期的完成通知会被忽略。

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::models::{
    ChapterKey, ChapterRecord, Completion, DownloadEvent, DownloadSnapshot, DownloadState,
    DownloadedChapterInfo, format_timestamp,
};
use crate::dispatch::Marshaller;
use crate::gate::{Admission, FairGate, GateError, GateTicket};
use crate::library::Library;
use crate::queue::panic_message;
use crate::scraper::{DownloadFormatProvider, DownloadJob, Downloader, find_format};

const BUTTON_CANCEL_TEXT: &str = "Cancel";
const BUTTON_CANCELLING_TEXT: &str = "Canceling";

const WAITING_FOR_SLOT: &str = "Waiting for a free download slot ...";
const DOWNLOAD_CANCELLED: &str = "Download was cancelled.";
const DOWNLOAD_FAILED: &str = "Unable to download/save requested chapter";
const DOWNLOADED_CHAPTER_NOT_AVAILABLE: &str = "Chapter was not found in the download folder.";

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid chapter record: {0}")]
    InvalidChapter(&'static str),
    #[error("invalid output path")]
    InvalidOutputPath,
    #[error("there is no downloader configured for the chapter's scraper")]
    NoDownloader,
    #[error("no download format provider is available")]
    NoFormatProvider,
    #[error("download {0} is already in progress")]
    AlreadyActive(ChapterKey),
    #[error("download {0} cannot be retried in its current state")]
    RetryNotAllowed(ChapterKey),
    #[error("unable to start download thread: {0}")]
    Spawn(#[from] io::Error),
}

/// 在主上下文上接收下载事件。
pub type EventSink = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;

/// 同一下载管理器下所有协调器共享的依赖。
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub gate: Arc<FairGate>,
    pub home: Marshaller,
    pub downloader: Option<Arc<dyn Downloader>>,
    pub library: Arc<dyn Library>,
    pub formats: Arc<Vec<Arc<dyn DownloadFormatProvider>>>,
    pub events: Option<EventSink>,
}

enum Phase {
    Idle,
    Waiting {
        attempt: u64,
        ticket: GateTicket,
        cancel: Arc<AtomicBool>,
    },
    Running {
        attempt: u64,
        ticket: GateTicket,
        cancel: Arc<AtomicBool>,
    },
}

struct Inner {
    info: DownloadedChapterInfo,
    state: DownloadState,
    progress: u8,
    status_text: String,
    completed: bool,
    last_error: Option<String>,
    cancel_label: &'static str,
    // cached probe result, reset after every terminal transition
    exists: Option<bool>,
    attempt: u64,
    phase: Phase,
}

impl Inner {
    fn finish(&mut self, state: DownloadState, text: &str) {
        self.state = state;
        self.status_text = text.to_string();
        self.info.downloaded = Some(OffsetDateTime::now_utc());
        self.completed = true;
        self.cancel_label = BUTTON_CANCEL_TEXT;
        self.exists = None;
    }
}

struct Shared {
    key: ChapterKey,
    deps: CoordinatorDeps,
    inner: Mutex<Inner>,
}

/// 单章下载状态机；克隆体共享同一个下载。
#[derive(Clone)]
pub struct DownloadCoordinator {
    shared: Arc<Shared>,
}

impl DownloadCoordinator {
    pub fn new(info: DownloadedChapterInfo, deps: CoordinatorDeps) -> Result<Self, DownloadError> {
        if info.chapter.chapter_id.trim().is_empty() {
            return Err(DownloadError::InvalidChapter("chapter id is empty"));
        }
        if info.chapter.manga.manga_id.trim().is_empty() {
            return Err(DownloadError::InvalidChapter("manga id is empty"));
        }

        // a recorded path means the chapter was downloaded in an earlier session
        let finished_before = info.path.is_some();
        let inner = Inner {
            state: if finished_before {
                DownloadState::Unknown
            } else {
                DownloadState::Ok
            },
            completed: finished_before,
            progress: 0,
            status_text: String::new(),
            last_error: None,
            cancel_label: BUTTON_CANCEL_TEXT,
            exists: None,
            attempt: 0,
            phase: Phase::Idle,
            info,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                key: inner.info.chapter.key(),
                deps,
                inner: Mutex::new(inner),
            }),
        })
    }

    pub fn key(&self) -> &ChapterKey {
        &self.shared.key
    }

    pub fn chapter(&self) -> ChapterRecord {
        self.shared.lock().info.chapter.clone()
    }

    pub fn info(&self) -> DownloadedChapterInfo {
        self.shared.lock().info.clone()
    }

    /// 当前状态；`Unknown` 状态在首次访问时探测磁盘。
    pub fn state(&self) -> DownloadState {
        let mut inner = self.shared.lock();
        self.shared.resolve_state(&mut inner)
    }

    pub fn progress(&self) -> u8 {
        self.shared.lock().progress
    }

    pub fn is_completed(&self) -> bool {
        self.shared.lock().completed
    }

    /// 是否有尝试正在排队或传输中。
    pub fn is_active(&self) -> bool {
        !matches!(self.shared.lock().phase, Phase::Idle)
    }

    pub fn cancel_label(&self) -> &'static str {
        self.shared.lock().cancel_label
    }

    pub fn download_exists(&self) -> bool {
        let mut inner = self.shared.lock();
        self.shared.download_exists(&mut inner)
    }

    pub fn can_cancel(&self) -> bool {
        !self.shared.lock().completed
    }

    pub fn can_retry(&self) -> bool {
        let mut inner = self.shared.lock();
        self.shared.can_retry(&mut inner)
    }

    /// 已完成的章节能否按记录路径打开。
    pub fn can_open(&self) -> bool {
        let mut inner = self.shared.lock();
        self.shared.can_open(&mut inner)
    }

    /// 以指定格式开始下载到 `folder`。
    pub fn start(
        &self,
        folder: &Path,
        format: Arc<dyn DownloadFormatProvider>,
    ) -> Result<(), DownloadError> {
        if folder.as_os_str().is_empty() {
            return Err(DownloadError::InvalidOutputPath);
        }
        let downloader = self
            .shared
            .deps
            .downloader
            .clone()
            .ok_or(DownloadError::NoDownloader)?;

        let mut inner = self.shared.lock();
        if !matches!(inner.phase, Phase::Idle) {
            return Err(DownloadError::AlreadyActive(self.shared.key.clone()));
        }
        inner.info.download_folder = Some(folder.to_path_buf());
        inner.info.format_provider = Some(format.id().to_string());
        self.launch(inner, downloader, format)
    }

    /// 在上次的目录中重新下载已取消、失败或文件丢失的章节。
    pub fn retry(&self) -> Result<(), DownloadError> {
        let mut inner = self.shared.lock();
        if !self.shared.can_retry(&mut inner) {
            return Err(DownloadError::RetryNotAllowed(self.shared.key.clone()));
        }
        let downloader = self
            .shared
            .deps
            .downloader
            .clone()
            .ok_or(DownloadError::NoDownloader)?;
        let format = find_format(
            &self.shared.deps.formats,
            inner.info.format_provider.as_deref(),
        )
        .ok_or(DownloadError::NoFormatProvider)?;

        info!(target: "download", "retrying {}", self.shared.key);
        self.launch(inner, downloader, format)
    }

    /// 启动一次尝试；线程创建失败时在释放锁之后补发 `Completed`。
    fn launch(
        &self,
        mut inner: MutexGuard<'_, Inner>,
        downloader: Arc<dyn Downloader>,
        format: Arc<dyn DownloadFormatProvider>,
    ) -> Result<(), DownloadError> {
        let result = self.shared.begin_attempt(&mut inner, downloader, format);
        let path = inner.info.path.clone();
        drop(inner);
        if matches!(result, Err(DownloadError::Spawn(_))) {
            self.shared.post_event(DownloadEvent::Completed {
                key: self.shared.key.clone(),
                state: DownloadState::Error,
                path,
            });
        }
        result
    }

    /// 取消当前尝试。
    ///
    /// 仍在排队的下载立即变为 `Cancelled`，其 `Completed` 事件投递到主上下文；
    /// 正在传输的下载只会收到停止请求，状态等下载器确认后再变。可在任意线程调用。
    pub fn cancel(&self) {
        let event = {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;
            match &inner.phase {
                Phase::Idle if inner.completed => return,
                Phase::Idle => {}
                Phase::Waiting { ticket, cancel, .. } => {
                    if !self.shared.deps.gate.cancel(ticket.id()) {
                        // granted in the meantime; the attempt thread sees the flag
                        cancel.store(true, Ordering::SeqCst);
                        inner.cancel_label = BUTTON_CANCELLING_TEXT;
                        return;
                    }
                }
                Phase::Running { cancel, .. } => {
                    cancel.store(true, Ordering::SeqCst);
                    inner.cancel_label = BUTTON_CANCELLING_TEXT;
                    debug!(target: "download", "cancel forwarded to downloader for {}", self.shared.key);
                    return;
                }
            }

            inner.phase = Phase::Idle;
            inner.progress = 0;
            inner.finish(DownloadState::Cancelled, DOWNLOAD_CANCELLED);
            info!(target: "download", "{} cancelled before it started", self.shared.key);
            DownloadEvent::Completed {
                key: self.shared.key.clone(),
                state: DownloadState::Cancelled,
                path: None,
            }
        };
        self.shared.post_event(event);
    }

    /// 取消下载，并请求所有者把它从列表中移除。
    pub fn remove(&self) {
        self.cancel();
        self.shared
            .post_event(DownloadEvent::RemoveRequested(self.shared.key.clone()));
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        let mut inner = self.shared.lock();
        let state = self.shared.resolve_state(&mut inner);
        let can_retry = self.shared.can_retry(&mut inner);
        let can_open = self.shared.can_open(&mut inner);
        DownloadSnapshot {
            key: self.shared.key.clone(),
            manga_name: inner.info.chapter.manga.name.clone(),
            chapter_name: inner.info.chapter.name.clone(),
            scraper: inner.info.chapter.scraper.clone(),
            state,
            progress: inner.progress,
            status_text: inner.status_text.clone(),
            completed: inner.completed,
            path: inner.info.path.clone(),
            downloaded_at: inner.info.downloaded.and_then(format_timestamp),
            last_error: inner.last_error.clone(),
            cancel_label: inner.cancel_label,
            can_cancel: !inner.completed,
            can_retry,
            can_open,
        }
    }
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("key", &self.shared.key)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: &DownloadEvent) {
        if let Some(sink) = &self.deps.events {
            sink(event);
        }
    }

    /// 事件一律在主上下文上送达；调用方不得持有 `inner` 锁。
    fn post_event(self: &Arc<Self>, event: DownloadEvent) {
        let shared = Arc::clone(self);
        self.deps.home.post(move || shared.emit(&event));
    }

    fn download_exists(&self, inner: &mut Inner) -> bool {
        if let Some(exists) = inner.exists {
            return exists;
        }
        let exists = inner
            .info
            .path
            .as_deref()
            .is_some_and(|p| self.deps.library.probe_exists(p));
        inner.exists = Some(exists);

        if inner.status_text.is_empty() {
            if exists {
                inner.progress = 100;
                inner.status_text = inner
                    .info
                    .path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
            } else {
                inner.status_text = DOWNLOADED_CHAPTER_NOT_AVAILABLE.to_string();
            }
        }
        exists
    }

    fn resolve_state(&self, inner: &mut Inner) -> DownloadState {
        if inner.state != DownloadState::Unknown {
            return inner.state;
        }
        if self.download_exists(inner) {
            DownloadState::Ok
        } else {
            DownloadState::NotFound
        }
    }

    fn can_retry(&self, inner: &mut Inner) -> bool {
        self.deps.downloader.is_some()
            && inner.completed
            && matches!(inner.phase, Phase::Idle)
            && inner.info.download_folder.is_some()
            && matches!(
                self.resolve_state(inner),
                DownloadState::Cancelled | DownloadState::Error | DownloadState::NotFound
            )
    }

    fn can_open(&self, inner: &mut Inner) -> bool {
        inner.completed
            && self.resolve_state(inner) == DownloadState::Ok
            && self.download_exists(inner)
    }

    fn begin_attempt(
        self: &Arc<Self>,
        inner: &mut Inner,
        downloader: Arc<dyn Downloader>,
        format: Arc<dyn DownloadFormatProvider>,
    ) -> Result<(), DownloadError> {
        inner.attempt += 1;
        let attempt = inner.attempt;
        inner.state = DownloadState::Ok;
        inner.completed = false;
        inner.progress = 0;
        inner.status_text = WAITING_FOR_SLOT.to_string();
        inner.last_error = None;
        inner.cancel_label = BUTTON_CANCEL_TEXT;
        inner.exists = None;

        let cancel = Arc::new(AtomicBool::new(false));
        let ticket = self.deps.gate.request();
        debug!(target: "download", seq = ticket.seq(), attempt, "{} requested a download slot", self.key);
        inner.phase = Phase::Waiting {
            attempt,
            ticket: ticket.clone(),
            cancel: cancel.clone(),
        };

        let shared = Arc::clone(self);
        let spawned = spawn_attempt(format!("download-{}", self.key), {
            let ticket = ticket.clone();
            move || shared.run_attempt(attempt, &ticket, &cancel, &downloader, format)
        });

        if let Err(err) = spawned {
            error!(target: "download", "unable to start download thread for {}: {err}", self.key);
            inner.phase = Phase::Idle;
            self.return_slot(&ticket);
            inner.last_error = Some(err.to_string());
            inner.finish(DownloadState::Error, DOWNLOAD_FAILED);
            return Err(DownloadError::Spawn(err));
        }
        Ok(())
    }

    /// 每次尝试的线程主体：等待名额，然后交给下载器。
    fn run_attempt(
        self: Arc<Self>,
        attempt: u64,
        ticket: &GateTicket,
        cancel: &Arc<AtomicBool>,
        downloader: &Arc<dyn Downloader>,
        format: Arc<dyn DownloadFormatProvider>,
    ) {
        if ticket.wait() == Admission::Cancelled {
            debug!(target: "download", "{} left the queue before a slot was granted", self.key);
            return;
        }

        let job = {
            let mut inner = self.lock();
            let current = matches!(
                &inner.phase,
                Phase::Waiting { attempt: a, .. } if *a == attempt
            );
            if !current {
                drop(inner);
                warn!(target: "download", "slot granted to a stale attempt of {}", self.key);
                self.return_slot(ticket);
                return;
            }
            inner.phase = Phase::Running {
                attempt,
                ticket: ticket.clone(),
                cancel: cancel.clone(),
            };
            let Some(destination) = inner.info.download_folder.clone() else {
                drop(inner);
                DownloadReporter::new(self, attempt)
                    .completed(Completion::Failed("download folder is not set".to_string()));
                return;
            };
            DownloadJob {
                chapter: inner.info.chapter.clone(),
                destination,
                format,
                cancel: cancel.clone(),
            }
        };

        let reporter = DownloadReporter::new(self.clone(), attempt);
        if cancel.load(Ordering::SeqCst) {
            reporter.completed(Completion::Cancelled);
            return;
        }

        info!(target: "download", "downloading {} into {}", self.key, job.destination.display());
        let fallback = reporter.clone();
        if let Err(payload) =
            panic::catch_unwind(AssertUnwindSafe(|| downloader.start(job, reporter)))
        {
            let msg = panic_message(&*payload);
            error!(target: "download", "downloader for {} panicked: {msg}", self.key);
            fallback.completed(Completion::Failed(format!("downloader panicked: {msg}")));
        }
    }

    fn handle_progress(&self, attempt: u64, percent: u8, message: String) {
        let events = {
            let mut inner = self.lock();
            let running = matches!(
                &inner.phase,
                Phase::Running { attempt: a, .. } if *a == attempt
            );
            if !running {
                return;
            }
            let percent = percent.min(100);
            let mut events = Vec::with_capacity(2);
            if inner.progress == 0 && percent > 0 {
                events.push(DownloadEvent::Started(self.key.clone()));
            }
            inner.progress = percent;
            inner.status_text.clone_from(&message);
            events.push(DownloadEvent::Progress {
                key: self.key.clone(),
                percent,
                message,
            });
            events
        };
        for event in &events {
            self.emit(event);
        }
    }

    fn handle_completed(&self, attempt: u64, completion: Completion) {
        let (ticket, event, record) = {
            let mut inner = self.lock();
            let ticket = match std::mem::replace(&mut inner.phase, Phase::Idle) {
                Phase::Running {
                    attempt: a, ticket, ..
                }
                | Phase::Waiting {
                    attempt: a, ticket, ..
                } if a == attempt => ticket,
                other => {
                    inner.phase = other;
                    debug!(target: "download", attempt, "ignoring duplicate completion for {}", self.key);
                    return;
                }
            };

            let mut record = None;
            match completion {
                Completion::Cancelled => {
                    inner.finish(DownloadState::Cancelled, DOWNLOAD_CANCELLED);
                    info!(target: "download", "{} was cancelled", self.key);
                }
                Completion::Failed(msg) => {
                    error!(target: "download", "unable to download/save {}: {msg}", self.key);
                    inner.last_error = Some(msg);
                    inner.finish(DownloadState::Error, DOWNLOAD_FAILED);
                }
                Completion::Finished(path) => {
                    inner.progress = 100;
                    inner.info.path = Some(path.clone());
                    inner.finish(DownloadState::Ok, &path.display().to_string());
                    info!(target: "download", "{} saved to {}", self.key, path.display());
                    record = inner
                        .info
                        .downloaded
                        .map(|when| (inner.info.clone(), path, when));
                }
            }

            let event = DownloadEvent::Completed {
                key: self.key.clone(),
                state: inner.state,
                path: inner.info.path.clone(),
            };
            (ticket, event, record)
        };

        self.return_slot(&ticket);
        if let Some((info, path, when)) = record {
            self.deps.library.record_download(&info, &path, when);
        }
        self.emit(&event);
    }

    fn return_slot(&self, ticket: &GateTicket) {
        match self.deps.gate.release(ticket) {
            Ok(()) => {}
            Err(GateError::NotGranted(_)) => {
                self.deps.gate.cancel(ticket.id());
            }
            Err(err) => {
                error!(target: "download", "failed to release download slot for {}: {err}", self.key);
            }
        }
    }
}

#[cfg(test)]
thread_local! {
    static FAIL_SPAWN: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

fn spawn_attempt<F>(name: String, body: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    #[cfg(test)]
    if FAIL_SPAWN.with(std::cell::Cell::get) {
        return Err(io::Error::other("thread limit reached"));
    }
    thread::Builder::new().name(name).spawn(body).map(drop)
}

/// 交给下载器使用，把它的通知转发回主上下文。
#[derive(Clone)]
pub struct DownloadReporter {
    shared: Arc<Shared>,
    attempt: u64,
}

impl DownloadReporter {
    fn new(shared: Arc<Shared>, attempt: u64) -> Self {
        Self { shared, attempt }
    }

    pub fn key(&self) -> &ChapterKey {
        &self.shared.key
    }

    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        let shared = self.shared.clone();
        let attempt = self.attempt;
        let message = message.into();
        self.shared
            .deps
            .home
            .post(move || shared.handle_progress(attempt, percent, message));
    }

    /// 报告传输结束；每次尝试只有第一次调用生效。
    pub fn completed(&self, completion: Completion) {
        let shared = self.shared.clone();
        let attempt = self.attempt;
        self.shared
            .deps
            .home
            .post(move || shared.handle_completed(attempt, completion));
    }
}
