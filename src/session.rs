//! 会话：主上下文一侧的协调者。
//!
//! 持有后台请求队列、内容源、下载格式、下载管理器与配置。搜索、章节加载、
//! 预览与预加载都作为队列请求执行，结果在主上下文整体替换到视图中；
//! 队列清空时（`TasksCompleted`）清除忙碌状态。

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, info, warn};

use crate::base_system::context::Config;
use crate::dispatch::Marshaller;
use crate::download::coordinator::{DownloadCoordinator, DownloadError};
use crate::download::manager::DownloadManager;
use crate::download::models::{ChapterRecord, DownloadEvent, DownloadedChapterInfo, MangaRecord};
use crate::gate::GateError;
use crate::library::Library;
use crate::queue::{QueueError, QueueState, WorkQueue, WorkResult};
use crate::scraper::{DownloadFormatProvider, Scraper, find_format, find_scraper};

const SEARCHING: &str = "Searching ...";
const LOADING_CHAPTERS: &str = "Loading chapters ...";
const PRELOADING: &str = "Preloading manga directories ...";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no scrapers are available")]
    NoScrapers,
    #[error("unknown scraper: {0}")]
    UnknownScraper(String),
    #[error("unknown download format: {0}")]
    UnknownFormat(String),
    #[error("Output folder must be selected.")]
    NoOutputFolder,
    #[error("Chapter must be selected.")]
    NoChapterSelected,
    #[error("Unable to create output folder {path}: {source}")]
    CreateOutputFolder { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// 已排队的搜索、预览或章节加载请求的句柄。
///
/// 普通优先级请求按提交顺序完成，因此之前的请求都交付结果后该 id 即视为完成。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OperationId(u64);

/// 章节及其下载记录。
#[derive(Debug, Clone)]
pub struct ChapterEntry {
    pub chapter: ChapterRecord,
    pub download: DownloadedChapterInfo,
}

#[derive(Default)]
struct SessionView {
    current_scraper: Option<Arc<dyn Scraper>>,
    current_format: Option<Arc<dyn DownloadFormatProvider>>,
    // replaced wholesale, never edited in place
    mangas: Arc<Vec<MangaRecord>>,
    chapters: Arc<Vec<ChapterEntry>>,
    selected_manga: Option<MangaRecord>,
    output_path: String,
    operation_in_progress: bool,
    current_action_text: String,
    last_error: Option<String>,
    issued_ops: u64,
    finished_ops: u64,
}

impl SessionView {
    fn issue(&mut self) -> OperationId {
        self.issued_ops += 1;
        OperationId(self.issued_ops)
    }

    fn finish(&mut self, op: OperationId) {
        self.finished_ops = self.finished_ops.max(op.0);
    }
}

type SharedView = Arc<Mutex<SessionView>>;

fn lock_view(view: &SharedView) -> MutexGuard<'_, SessionView> {
    view.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Session {
    queue: WorkQueue,
    scrapers: Arc<Vec<Arc<dyn Scraper>>>,
    formats: Arc<Vec<Arc<dyn DownloadFormatProvider>>>,
    library: Arc<dyn Library>,
    downloads: Arc<DownloadManager>,
    config: Arc<Mutex<Config>>,
    view: SharedView,
}

impl Session {
    /// 创建绑定到调用方上下文的会话，并启动其任务队列。
    pub fn new(
        config: Config,
        scrapers: Vec<Arc<dyn Scraper>>,
        formats: Vec<Arc<dyn DownloadFormatProvider>>,
        library: Arc<dyn Library>,
    ) -> Result<Self, SessionError> {
        if scrapers.is_empty() {
            return Err(SessionError::NoScrapers);
        }
        let home = Marshaller::capture();
        let scrapers = Arc::new(scrapers);
        let formats = Arc::new(formats);

        let downloads = Arc::new(DownloadManager::with_marshaller(
            config.parallel_downloads(),
            scrapers.clone(),
            formats.clone(),
            library.clone(),
            home.clone(),
        )?);

        let view: SharedView = Arc::new(Mutex::new(SessionView {
            current_format: find_format(&formats, Some(config.download_format.as_str())),
            output_path: config.output_path.clone(),
            ..SessionView::default()
        }));

        let queue = WorkQueue::with_marshaller(home);
        {
            let view = view.clone();
            queue.on_tasks_completed(move || {
                let mut v = lock_view(&view);
                v.operation_in_progress = false;
                v.current_action_text.clear();
            });
        }
        queue.initialize()?;

        {
            let view = view.clone();
            let library = library.clone();
            downloads.on_event(move |event| refresh_chapter(&view, library.as_ref(), event));
        }

        let initial = find_scraper(&scrapers, &config.selected_scraper)
            .or_else(|| scrapers.first().cloned())
            .ok_or(SessionError::NoScrapers)?;
        let enable_preload = config.enable_preload;

        let session = Self {
            queue,
            scrapers,
            formats,
            library,
            downloads,
            config: Arc::new(Mutex::new(config)),
            view,
        };
        session.set_scraper(initial)?;
        if enable_preload {
            session.preload()?;
        }
        Ok(session)
    }

    fn view(&self) -> MutexGuard<'_, SessionView> {
        lock_view(&self.view)
    }

    fn config_mut(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> Config {
        self.config_mut().clone()
    }

    pub fn scrapers(&self) -> &[Arc<dyn Scraper>] {
        &self.scrapers
    }

    pub fn formats(&self) -> &[Arc<dyn DownloadFormatProvider>] {
        &self.formats
    }

    pub fn downloads(&self) -> &Arc<DownloadManager> {
        &self.downloads
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.state()
    }

    pub fn current_scraper(&self) -> Option<Arc<dyn Scraper>> {
        self.view().current_scraper.clone()
    }

    pub fn current_format(&self) -> Option<Arc<dyn DownloadFormatProvider>> {
        self.view().current_format.clone()
    }

    pub fn mangas(&self) -> Arc<Vec<MangaRecord>> {
        self.view().mangas.clone()
    }

    pub fn chapters(&self) -> Arc<Vec<ChapterEntry>> {
        self.view().chapters.clone()
    }

    pub fn selected_manga(&self) -> Option<MangaRecord> {
        self.view().selected_manga.clone()
    }

    pub fn output_path(&self) -> String {
        self.view().output_path.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.view().operation_in_progress
    }

    pub fn current_action_text(&self) -> String {
        self.view().current_action_text.clone()
    }

    /// 最近一次失败的搜索或章节加载的错误信息。
    pub fn last_error(&self) -> Option<String> {
        self.view().last_error.clone()
    }

    /// 切换内容源；若该内容源支持预览，返回预览请求。
    pub fn select_scraper(&self, id: &str) -> Result<Option<OperationId>, SessionError> {
        let scraper = find_scraper(&self.scrapers, id)
            .ok_or_else(|| SessionError::UnknownScraper(id.to_string()))?;
        self.set_scraper(scraper)
    }

    fn set_scraper(&self, scraper: Arc<dyn Scraper>) -> Result<Option<OperationId>, SessionError> {
        self.config_mut().selected_scraper = scraper.id().to_string();
        {
            let mut v = self.view();
            v.current_scraper = Some(scraper.clone());
            v.mangas = Arc::new(Vec::new());
            v.chapters = Arc::new(Vec::new());
            v.selected_manga = None;
        }
        debug!(target: "session", "selected scraper {}", scraper.id());

        if scraper.preview().is_none() {
            return Ok(None);
        }
        let op = self.view().issue();
        let view = self.view.clone();
        let expected = scraper.id().to_string();
        self.queue.add(
            move || match scraper.preview() {
                Some(preview) => preview.preview(),
                None => Ok(Vec::new()),
            },
            move |result| apply_mangas(&view, &expected, op, result),
        )?;
        Ok(Some(op))
    }

    pub fn select_format(&self, id: &str) -> Result<(), SessionError> {
        let format = self
            .formats
            .iter()
            .find(|f| f.id() == id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownFormat(id.to_string()))?;
        self.config_mut().download_format = format.id().to_string();
        self.view().current_format = Some(format);
        Ok(())
    }

    pub fn set_output_path(&self, path: impl Into<String>) {
        let path = path.into();
        self.config_mut().output_path.clone_from(&path);
        self.view().output_path = path;
    }

    /// 用当前内容源做完整搜索。
    pub fn search(&self, query: &str) -> Result<OperationId, SessionError> {
        let scraper = self.current_scraper().ok_or(SessionError::NoScrapers)?;
        let query = query.to_string();
        let view = self.view.clone();
        let expected = scraper.id().to_string();
        self.run_operation(SEARCHING, |queue, op| {
            queue.add(
                move || scraper.search(&query),
                move |result| apply_mangas(&view, &expected, op, result),
            )
        })
    }

    /// 边输入边搜索；当前内容源不支持时返回 `None`。
    pub fn search_immediate(&self, query: &str) -> Result<Option<OperationId>, SessionError> {
        let scraper = self.current_scraper().ok_or(SessionError::NoScrapers)?;
        if scraper.immediate_search().is_none() {
            return Ok(None);
        }
        let query = query.to_string();
        let view = self.view.clone();
        let expected = scraper.id().to_string();
        let op = self.run_operation(SEARCHING, |queue, op| {
            queue.add(
                move || match scraper.immediate_search() {
                    Some(search) => search.search_immediate(&query),
                    None => Ok(Vec::new()),
                },
                move |result| apply_mangas(&view, &expected, op, result),
            )
        })?;
        Ok(Some(op))
    }

    /// 加载 `manga` 的章节，并预选它上次的输出目录。
    pub fn select_manga(&self, manga: MangaRecord) -> Result<OperationId, SessionError> {
        let scraper = self.current_scraper().ok_or(SessionError::NoScrapers)?;
        self.view().selected_manga = Some(manga.clone());
        self.preselect_output_folder(&manga);

        let view = self.view.clone();
        let library = self.library.clone();
        self.run_operation(LOADING_CHAPTERS, |queue, op| {
            queue.add(
                move || {
                    let chapters = scraper.list_chapters(&manga)?;
                    Ok((manga, chapters))
                },
                move |result: WorkResult<(MangaRecord, Vec<ChapterRecord>)>| match result {
                    Ok((manga, chapters)) => {
                        let entries: Vec<ChapterEntry> = chapters
                            .into_iter()
                            .map(|chapter| ChapterEntry {
                                download: library.download_info(&chapter),
                                chapter,
                            })
                            .collect();
                        let mut v = lock_view(&view);
                        v.finish(op);
                        // a later selection wins
                        if v.selected_manga.as_ref() == Some(&manga) {
                            v.chapters = Arc::new(entries);
                        }
                    }
                    Err(err) => {
                        warn!(target: "session", "loading chapters of {} failed: {err}", manga_name_hint(&view));
                        let mut v = lock_view(&view);
                        v.last_error = Some(err.to_string());
                        v.finish(op);
                    }
                },
            )
        })
    }

    fn preselect_output_folder(&self, manga: &MangaRecord) {
        if !self.config_mut().preselect_output_folder {
            return;
        }
        if let Some(folder) = self.library.recent_output_folder(manga) {
            debug!(target: "session", "preselecting {} for {}", folder.display(), manga.name);
            self.set_output_path(folder.display().to_string());
        }
    }

    /// 以低优先级预热所有支持预加载的内容源；没有可预热的返回 false。
    pub fn preload(&self) -> Result<bool, SessionError> {
        let preloadable: Vec<_> = self
            .scrapers
            .iter()
            .filter(|s| s.preload().is_some())
            .cloned()
            .collect();
        if preloadable.is_empty() {
            return Ok(false);
        }

        {
            let mut v = self.view();
            if !v.operation_in_progress {
                v.operation_in_progress = true;
                v.current_action_text = PRELOADING.to_string();
            }
        }

        let result = self.queue.add_low_priority(
            move || {
                thread::scope(|s| {
                    for scraper in &preloadable {
                        s.spawn(move || {
                            if let Some(preload) = scraper.preload()
                                && let Err(err) = preload.preload_directory()
                            {
                                warn!(target: "session", "preloading {} failed: {err:#}", scraper.id());
                            }
                        });
                    }
                });
                Ok(())
            },
            |_: WorkResult<()>| {},
        );
        if let Err(err) = result {
            self.end_operation();
            return Err(err.into());
        }
        Ok(true)
    }

    /// 校验所选章节并全部加入下载。
    ///
    /// 无法加入的章节记日志后跳过。
    pub fn download_selected(
        &self,
        chapters: &[ChapterRecord],
    ) -> Result<Vec<DownloadCoordinator>, SessionError> {
        let output = self.output_path();
        if output.trim().is_empty() {
            return Err(SessionError::NoOutputFolder);
        }
        if chapters.is_empty() {
            return Err(SessionError::NoChapterSelected);
        }

        let folder = PathBuf::from(output.trim());
        if !folder.is_dir() {
            fs::create_dir_all(&folder).map_err(|source| SessionError::CreateOutputFolder {
                path: folder.clone(),
                source,
            })?;
            info!(target: "session", "created output folder {}", folder.display());
        }
        self.config_mut().add_recent_folder(&folder);

        let format = self.current_format().map(|f| f.id().to_string());
        let mut started = Vec::with_capacity(chapters.len());
        for chapter in chapters {
            match self
                .downloads
                .download(chapter.clone(), &folder, format.as_deref())
            {
                Ok(download) => started.push(download),
                Err(err) => warn!(target: "session", "cannot download {}: {err}", chapter.key()),
            }
        }
        Ok(started)
    }

    /// 停止任务队列并取消所有进行中的下载。
    pub fn cleanup(&self) {
        self.queue.stop();
        self.downloads.cancel_running();
        self.end_operation();
        info!(target: "session", "session cleaned up");
    }

    /// `op` 的结果是否已生效。
    pub fn is_finished(&self, op: OperationId) -> bool {
        self.view().finished_ops >= op.0
    }

    fn run_operation<F>(&self, text: &str, enqueue: F) -> Result<OperationId, SessionError>
    where
        F: FnOnce(&WorkQueue, OperationId) -> Result<(), QueueError>,
    {
        let op = {
            let mut v = self.view();
            v.operation_in_progress = true;
            v.current_action_text = text.to_string();
            v.last_error = None;
            v.issue()
        };
        if let Err(err) = enqueue(&self.queue, op) {
            self.end_operation();
            return Err(err.into());
        }
        Ok(op)
    }

    fn end_operation(&self) {
        let mut v = self.view();
        v.operation_in_progress = false;
        v.current_action_text.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.queue.stop();
    }
}

fn apply_mangas(
    view: &SharedView,
    scraper_id: &str,
    op: OperationId,
    result: WorkResult<Vec<MangaRecord>>,
) {
    let mut v = lock_view(view);
    v.finish(op);
    match result {
        // results for a scraper that is no longer selected are dropped
        Ok(mangas) if v.current_scraper.as_ref().is_some_and(|s| s.id() == scraper_id) => {
            v.mangas = Arc::new(mangas);
        }
        Ok(_) => {}
        Err(err) => {
            warn!(target: "session", "search with {scraper_id} failed: {err}");
            v.last_error = Some(err.to_string());
        }
    }
}

fn manga_name_hint(view: &SharedView) -> String {
    lock_view(view)
        .selected_manga
        .as_ref()
        .map(|m| m.name.clone())
        .unwrap_or_default()
}

fn refresh_chapter(view: &SharedView, library: &dyn Library, event: &DownloadEvent) {
    let DownloadEvent::Completed { key, .. } = event else {
        return;
    };
    let mut v = lock_view(view);
    let Some(pos) = v.chapters.iter().position(|e| e.chapter.key() == *key) else {
        return;
    };
    let mut entries = (*v.chapters).clone();
    entries[pos].download = library.download_info(&entries[pos].chapter);
    v.chapters = Arc::new(entries);
}
