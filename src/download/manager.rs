//! 下载管理器：持有全局限流闸门与所有下载项。
//!
//! 每个下载项是一个 [`DownloadCoordinator`]；管理器负责创建、查找、移除，
//! 并把下载事件转发给订阅者（进度条、会话等）。

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::coordinator::{CoordinatorDeps, DownloadCoordinator, DownloadError, EventSink};
use super::models::{ChapterKey, ChapterRecord, DownloadEvent, DownloadSnapshot, DownloadedChapterInfo};
use crate::dispatch::Marshaller;
use crate::gate::{FairGate, GateError};
use crate::library::Library;
use crate::scraper::{DownloadFormatProvider, Scraper, find_format, find_scraper};

type DownloadList = Mutex<Vec<DownloadCoordinator>>;

const IDLE_POLL: Duration = Duration::from_millis(50);

pub struct DownloadManager {
    gate: Arc<FairGate>,
    home: Marshaller,
    scrapers: Arc<Vec<Arc<dyn Scraper>>>,
    formats: Arc<Vec<Arc<dyn DownloadFormatProvider>>>,
    library: Arc<dyn Library>,
    downloads: Arc<DownloadList>,
    listeners: Arc<Mutex<Vec<EventSink>>>,
}

impl DownloadManager {
    /// 创建管理器，事件投递到调用方所在的上下文。
    pub fn new(
        max_parallel: usize,
        scrapers: Arc<Vec<Arc<dyn Scraper>>>,
        formats: Arc<Vec<Arc<dyn DownloadFormatProvider>>>,
        library: Arc<dyn Library>,
    ) -> Result<Self, GateError> {
        Self::with_marshaller(max_parallel, scrapers, formats, library, Marshaller::capture())
    }

    pub fn with_marshaller(
        max_parallel: usize,
        scrapers: Arc<Vec<Arc<dyn Scraper>>>,
        formats: Arc<Vec<Arc<dyn DownloadFormatProvider>>>,
        library: Arc<dyn Library>,
        home: Marshaller,
    ) -> Result<Self, GateError> {
        let gate = Arc::new(FairGate::new(max_parallel)?);
        info!(target: "download", "download manager ready, {max_parallel} parallel download(s)");
        Ok(Self {
            gate,
            home,
            scrapers,
            formats,
            library,
            downloads: Arc::new(Mutex::new(Vec::new())),
            listeners: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn gate(&self) -> &Arc<FairGate> {
        &self.gate
    }

    pub fn formats(&self) -> &[Arc<dyn DownloadFormatProvider>] {
        &self.formats
    }

    /// 注册监听器，接收本管理器的所有下载事件。
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// 把 `chapter` 加入下载，保存到 `folder`。
    ///
    /// 同一章节已有已结束的条目时重新启动它，不会重复添加。
    pub fn download(
        &self,
        chapter: ChapterRecord,
        folder: &Path,
        format: Option<&str>,
    ) -> Result<DownloadCoordinator, DownloadError> {
        let format = find_format(&self.formats, format).ok_or(DownloadError::NoFormatProvider)?;

        if let Some(existing) = self.get(&chapter.key()) {
            existing.start(folder, format)?;
            return Ok(existing);
        }

        let mut info = self.library.download_info(&chapter);
        info.download_folder = Some(folder.to_path_buf());
        let coordinator = self.create(info)?;
        if let Err(err) = coordinator.start(folder, format) {
            self.lock().retain(|d| d.key() != coordinator.key());
            return Err(err);
        }
        Ok(coordinator)
    }

    /// 加入以前会话中已完成的下载，不启动。
    pub fn add_existing(
        &self,
        info: DownloadedChapterInfo,
    ) -> Result<DownloadCoordinator, DownloadError> {
        if let Some(existing) = self.get(&info.chapter.key()) {
            return Ok(existing);
        }
        self.create(info)
    }

    pub fn get(&self, key: &ChapterKey) -> Option<DownloadCoordinator> {
        self.lock().iter().find(|d| d.key() == key).cloned()
    }

    pub fn downloads(&self) -> Vec<DownloadCoordinator> {
        self.lock().clone()
    }

    pub fn snapshots(&self) -> Vec<DownloadSnapshot> {
        self.downloads().iter().map(DownloadCoordinator::snapshot).collect()
    }

    /// 正在排队或传输的下载数。
    pub fn active_count(&self) -> usize {
        self.lock().iter().filter(|d| d.is_active()).count()
    }

    pub fn is_busy(&self) -> bool {
        self.active_count() > 0
    }

    /// 取消所有未完成的下载。
    pub fn cancel_running(&self) {
        let running: Vec<_> = self
            .downloads()
            .into_iter()
            .filter(DownloadCoordinator::is_active)
            .collect();
        if !running.is_empty() {
            info!(target: "download", "cancelling {} running download(s)", running.len());
        }
        for download in running {
            download.cancel();
        }
    }

    /// 在非主线程上等待全部下载结束，超时返回 `false`。
    ///
    /// 完成通知要靠主上下文处理，主线程必须同时在泵取 `HomeLoop`。
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_busy() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL);
        }
        true
    }

    /// 取消并移除一个下载；返回该下载是否存在。
    pub fn remove(&self, key: &ChapterKey) -> bool {
        match self.get(key) {
            Some(download) => {
                download.remove();
                true
            }
            None => false,
        }
    }

    fn create(&self, info: DownloadedChapterInfo) -> Result<DownloadCoordinator, DownloadError> {
        let downloader = find_scraper(&self.scrapers, &info.chapter.scraper).map(|s| s.downloader());
        let deps = CoordinatorDeps {
            gate: self.gate.clone(),
            home: self.home.clone(),
            downloader,
            library: self.library.clone(),
            formats: self.formats.clone(),
            events: Some(self.event_sink()),
        };
        let coordinator = DownloadCoordinator::new(info, deps)?;
        self.lock().push(coordinator.clone());
        debug!(target: "download", "added download {}", coordinator.key());
        Ok(coordinator)
    }

    fn event_sink(&self) -> EventSink {
        // weak refs so coordinators do not keep the manager's list alive
        let downloads: Weak<DownloadList> = Arc::downgrade(&self.downloads);
        let listeners = Arc::downgrade(&self.listeners);
        Arc::new(move |event: &DownloadEvent| {
            if let DownloadEvent::RemoveRequested(key) = event
                && let Some(downloads) = downloads.upgrade()
            {
                downloads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|d| d.key() != key);
                debug!(target: "download", "removed download {key}");
            }
            let Some(listeners) = listeners.upgrade() else {
                return;
            };
            let listeners = listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for listener in listeners {
                listener(event);
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DownloadCoordinator>> {
        self.downloads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.cancel_running();
    }
}
