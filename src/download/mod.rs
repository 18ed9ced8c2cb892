//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`：数据模型（章节记录 / 下载状态 / 快照 / 事件）
//! - `coordinator`：单章下载状态机
//! - `manager`：下载列表与全局并发闸门
//! - `progress`：CLI 进度条

pub mod coordinator;
pub mod manager;
pub mod models;
pub mod progress;

pub use coordinator::{DownloadCoordinator, DownloadError, DownloadReporter};
pub use manager::DownloadManager;
pub use progress::ProgressBoard;
pub use models::{
    ChapterKey, ChapterRecord, Completion, DownloadEvent, DownloadSnapshot, DownloadState,
    DownloadedChapterInfo, MangaRecord,
};
