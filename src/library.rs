//! 下载记录（library）接口与内存实现。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use time::OffsetDateTime;

use crate::download::models::{ChapterKey, ChapterRecord, DownloadedChapterInfo, MangaRecord};

pub trait Library: Send + Sync {
    /// 已完成的下载是否仍在磁盘上。
    fn probe_exists(&self, path: &Path) -> bool;

    fn record_download(&self, info: &DownloadedChapterInfo, path: &Path, when: OffsetDateTime);

    /// `chapter` 的下载记录；没有则返回新记录。
    fn download_info(&self, chapter: &ChapterRecord) -> DownloadedChapterInfo;

    fn recent_output_folder(&self, manga: &MangaRecord) -> Option<PathBuf>;
}

/// 在进程生命周期内保存下载历史。
#[derive(Debug, Default)]
pub struct MemoryLibrary {
    records: Mutex<HashMap<ChapterKey, DownloadedChapterInfo>>,
    recent_folders: Mutex<HashMap<String, PathBuf>>,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Library for MemoryLibrary {
    fn probe_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn record_download(&self, info: &DownloadedChapterInfo, path: &Path, when: OffsetDateTime) {
        let mut stored = info.clone();
        stored.path = Some(path.to_path_buf());
        stored.downloaded = Some(when);

        if let Some(folder) = &info.download_folder {
            self.recent_folders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(info.chapter.manga.manga_id.clone(), folder.clone());
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.chapter.key(), stored);
    }

    fn download_info(&self, chapter: &ChapterRecord) -> DownloadedChapterInfo {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chapter.key())
            .cloned()
            .unwrap_or_else(|| DownloadedChapterInfo::new(chapter.clone()))
    }

    fn recent_output_folder(&self, manga: &MangaRecord) -> Option<PathBuf> {
        self.recent_folders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&manga.manga_id)
            .cloned()
    }
}
