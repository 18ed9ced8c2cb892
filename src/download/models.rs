//! 下载相关的数据模型定义。
//!
//! 包含漫画/章节记录、下载状态、下载快照与下载事件等核心数据结构。

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use time::OffsetDateTime;
use time::macros::format_description;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MangaRecord {
    pub manga_id: String,
    pub name: String,
    pub url: Option<String>,
    /// 产生该记录的内容源 id。
    pub scraper: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterRecord {
    pub chapter_id: String,
    pub name: String,
    pub url: Option<String>,
    pub manga: MangaRecord,
    pub scraper: String,
}

impl ChapterRecord {
    pub fn key(&self) -> ChapterKey {
        ChapterKey {
            manga_id: self.manga.manga_id.clone(),
            chapter_id: self.chapter_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChapterKey {
    pub manga_id: String,
    pub chapter_id: String,
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.manga_id, self.chapter_id)
    }
}

/// 库为单个章节保存的下载记录。
#[derive(Debug, Clone)]
pub struct DownloadedChapterInfo {
    pub chapter: ChapterRecord,
    /// 已完成章节的位置；下载成功前为 `None`。
    pub path: Option<PathBuf>,
    pub download_folder: Option<PathBuf>,
    pub format_provider: Option<String>,
    pub downloaded: Option<OffsetDateTime>,
}

impl DownloadedChapterInfo {
    pub fn new(chapter: ChapterRecord) -> Self {
        Self {
            chapter,
            path: None,
            download_folder: None,
            format_provider: None,
            downloaded: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// 以前已完成，尚未探测文件是否还在。
    Unknown,
    Ok,
    Cancelled,
    NotFound,
    Error,
}

impl DownloadState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ok => "ok",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not found",
            Self::Error => "error",
        }
    }
}

/// 下载器报告的传输结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Finished(PathBuf),
    Cancelled,
    Failed(String),
}

/// 供界面展示的单个下载只读快照。
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSnapshot {
    pub key: ChapterKey,
    pub manga_name: String,
    pub chapter_name: String,
    pub scraper: String,
    pub state: DownloadState,
    pub progress: u8,
    pub status_text: String,
    pub completed: bool,
    pub path: Option<PathBuf>,
    pub downloaded_at: Option<String>,
    pub last_error: Option<String>,
    pub cancel_label: &'static str,
    pub can_cancel: bool,
    pub can_retry: bool,
    pub can_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// 当前尝试第一次报告大于零的进度。
    Started(ChapterKey),
    Progress {
        key: ChapterKey,
        percent: u8,
        message: String,
    },
    Completed {
        key: ChapterKey,
        state: DownloadState,
        path: Option<PathBuf>,
    },
    RemoveRequested(ChapterKey),
}

impl DownloadEvent {
    pub fn key(&self) -> &ChapterKey {
        match self {
            Self::Started(key) | Self::RemoveRequested(key) => key,
            Self::Progress { key, .. } | Self::Completed { key, .. } => key,
        }
    }
}

pub(crate) fn format_timestamp(ts: OffsetDateTime) -> Option<String> {
    ts.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .ok()
}
