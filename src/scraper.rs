//! 内容源插件接口。
//!
//! 具体的网页抓取逻辑不在本 crate 内：这里只定义核心所依赖的能力。

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::download::coordinator::DownloadReporter;
use crate::download::models::{ChapterRecord, MangaRecord};

pub trait Scraper: Send + Sync {
    /// 稳定的标识，写入该内容源产生的记录。
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn search(&self, query: &str) -> Result<Vec<MangaRecord>>;

    fn list_chapters(&self, manga: &MangaRecord) -> Result<Vec<ChapterRecord>>;

    fn downloader(&self) -> Arc<dyn Downloader>;

    fn immediate_search(&self) -> Option<&dyn ImmediateSearch> {
        None
    }

    fn preview(&self) -> Option<&dyn Preview> {
        None
    }

    fn preload(&self) -> Option<&dyn Preload> {
        None
    }
}

/// 开销小的搜索，适合边输入边搜索。
pub trait ImmediateSearch: Send + Sync {
    fn search_immediate(&self, query: &str) -> Result<Vec<MangaRecord>>;
}

/// 选中内容源时展示的默认列表。
pub trait Preview: Send + Sync {
    fn preview(&self) -> Result<Vec<MangaRecord>>;
}

/// 在后台预热内容源的目录缓存。
pub trait Preload: Send + Sync {
    fn preload_directory(&self) -> Result<()>;
}

pub trait DownloadFormatProvider: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// 产物的扩展名；普通文件夹为空。
    fn extension(&self) -> &str;
}

/// 一次传输尝试所需的全部信息。
pub struct DownloadJob {
    pub chapter: ChapterRecord,
    pub destination: PathBuf,
    pub format: Arc<dyn DownloadFormatProvider>,
    pub cancel: Arc<AtomicBool>,
}

impl DownloadJob {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// 传输单个章节。
///
/// 实现必须为每次 `start` 恰好报告一次完成（内部出错时也一样），
/// 收到取消时必须以 `Completion::Cancelled` 结束而不是挂起。
/// `start` 可以在调用线程上传输，也可以交给其他线程。
pub trait Downloader: Send + Sync {
    fn start(&self, job: DownloadJob, reporter: DownloadReporter);
}

pub(crate) fn find_format(
    formats: &[Arc<dyn DownloadFormatProvider>],
    id: Option<&str>,
) -> Option<Arc<dyn DownloadFormatProvider>> {
    id.and_then(|id| formats.iter().find(|f| f.id() == id))
        .or_else(|| formats.first())
        .cloned()
}

pub(crate) fn find_scraper(scrapers: &[Arc<dyn Scraper>], id: &str) -> Option<Arc<dyn Scraper>> {
    scrapers.iter().find(|s| s.id() == id).cloned()
}
