//! 本地目录内容源：`<root>/<漫画>/<章节>/<页面文件>`。
//!
//! 下载即把章节页面复制到 `<目标目录>/<漫画>/<章节>`，或打包为 `<章节>.cbz`。

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, info, warn};
use zip::CompressionMethod;
use zip::write::FileOptions;

use crate::base_system::context::safe_fs_name;
use crate::download::coordinator::DownloadReporter;
use crate::download::models::{ChapterRecord, Completion, MangaRecord};
use crate::scraper::{DownloadJob, Downloader, ImmediateSearch, Preload, Preview, Scraper};

pub const LOCAL_SCRAPER_ID: &str = "local";
const PREVIEW_LIMIT: usize = 20;
const MAX_NAME_LEN: usize = 120;

static RE_NUMBER: OnceLock<Regex> = OnceLock::new();

fn re_number() -> &'static Regex {
    RE_NUMBER.get_or_init(|| Regex::new(r"\d+").expect("compile RE_NUMBER"))
}

/// 自然排序："Chapter 2" 排在 "Chapter 10" 之前。
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let num = |s: &str| {
        re_number()
            .find(s)
            .and_then(|m| m.as_str().parse::<u64>().ok())
    };
    num(a)
        .cmp(&num(b))
        .then_with(|| a.to_lowercase().cmp(&b.to_lowercase()))
}

fn list_entries(dir: &Path, want_dirs: bool) -> io::Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || entry.file_type()?.is_dir() != want_dirs {
            continue;
        }
        entries.push((name, entry.path()));
    }
    entries.sort_by(|a, b| natural_cmp(&a.0, &b.0));
    Ok(entries)
}

pub struct LocalFolderScraper {
    root: PathBuf,
    downloader: Arc<FolderCopyDownloader>,
    // filled by preload; searches scan the disk until then
    index: Mutex<Option<Arc<Vec<MangaRecord>>>>,
}

impl LocalFolderScraper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            downloader: Arc::new(FolderCopyDownloader { root: root.clone() }),
            root,
            index: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self) -> Result<Vec<MangaRecord>> {
        let dirs = list_entries(&self.root, true)
            .with_context(|| format!("cannot read source folder {}", self.root.display()))?;
        Ok(dirs
            .into_iter()
            .map(|(name, path)| MangaRecord {
                manga_id: name.clone(),
                name,
                url: Some(path.display().to_string()),
                scraper: LOCAL_SCRAPER_ID.to_string(),
            })
            .collect())
    }

    fn mangas(&self) -> Result<Arc<Vec<MangaRecord>>> {
        if let Some(index) = self
            .index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(index);
        }
        Ok(Arc::new(self.scan()?))
    }
}

impl Scraper for LocalFolderScraper {
    fn id(&self) -> &str {
        LOCAL_SCRAPER_ID
    }

    fn name(&self) -> &str {
        "Local folder"
    }

    fn search(&self, query: &str) -> Result<Vec<MangaRecord>> {
        let query = query.trim().to_lowercase();
        Ok(self
            .mangas()?
            .iter()
            .filter(|m| m.name.to_lowercase().contains(&query))
            .cloned()
            .collect())
    }

    fn list_chapters(&self, manga: &MangaRecord) -> Result<Vec<ChapterRecord>> {
        let dir = self.root.join(&manga.manga_id);
        let chapters = list_entries(&dir, true)
            .with_context(|| format!("cannot read manga folder {}", dir.display()))?;
        Ok(chapters
            .into_iter()
            .map(|(name, path)| ChapterRecord {
                chapter_id: name.clone(),
                name,
                url: Some(path.display().to_string()),
                manga: manga.clone(),
                scraper: LOCAL_SCRAPER_ID.to_string(),
            })
            .collect())
    }

    fn downloader(&self) -> Arc<dyn Downloader> {
        self.downloader.clone()
    }

    fn immediate_search(&self) -> Option<&dyn ImmediateSearch> {
        Some(self)
    }

    fn preview(&self) -> Option<&dyn Preview> {
        Some(self)
    }

    fn preload(&self) -> Option<&dyn Preload> {
        Some(self)
    }
}

impl ImmediateSearch for LocalFolderScraper {
    /// 前缀匹配，结果数量有上限，适合边输入边搜索。
    fn search_immediate(&self, query: &str) -> Result<Vec<MangaRecord>> {
        let query = query.trim().to_lowercase();
        Ok(self
            .mangas()?
            .iter()
            .filter(|m| m.name.to_lowercase().starts_with(&query))
            .take(PREVIEW_LIMIT)
            .cloned()
            .collect())
    }
}

impl Preview for LocalFolderScraper {
    fn preview(&self) -> Result<Vec<MangaRecord>> {
        Ok(self.mangas()?.iter().take(PREVIEW_LIMIT).cloned().collect())
    }
}

impl Preload for LocalFolderScraper {
    fn preload_directory(&self) -> Result<()> {
        let mangas = self.scan()?;
        info!(target: "sources", "indexed {} manga(s) under {}", mangas.len(), self.root.display());
        *self.index.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(mangas));
        Ok(())
    }
}

/// 把章节页面从源目录复制出来。
pub struct FolderCopyDownloader {
    root: PathBuf,
}

impl Downloader for FolderCopyDownloader {
    fn start(&self, job: DownloadJob, reporter: DownloadReporter) {
        let progress = |percent: u8, msg: String| reporter.progress(percent, msg);
        let completion = match self.transfer(&job, &progress) {
            Ok(Some(path)) => Completion::Finished(path),
            Ok(None) => Completion::Cancelled,
            Err(err) => Completion::Failed(format!("{err:#}")),
        };
        reporter.completed(completion);
    }
}

impl FolderCopyDownloader {
    /// 返回写出的路径；被取消时返回 `None`。
    fn transfer(&self, job: &DownloadJob, progress: &dyn Fn(u8, String)) -> Result<Option<PathBuf>> {
        let chapter = &job.chapter;
        let source = self.root.join(&chapter.manga.manga_id).join(&chapter.chapter_id);
        let pages = list_entries(&source, false)
            .with_context(|| format!("cannot read chapter folder {}", source.display()))?;
        if pages.is_empty() {
            bail!("chapter folder {} contains no pages", source.display());
        }

        let manga_dir = job
            .destination
            .join(safe_fs_name(&chapter.manga.name, "_", MAX_NAME_LEN));
        let chapter_name = safe_fs_name(&chapter.name, "_", MAX_NAME_LEN);
        fs::create_dir_all(&manga_dir)
            .with_context(|| format!("cannot create {}", manga_dir.display()))?;

        match job.format.extension() {
            "" => copy_pages(job, &pages, &manga_dir.join(chapter_name), progress),
            ext => pack_pages(
                job,
                &pages,
                &manga_dir.join(format!("{chapter_name}.{ext}")),
                progress,
            ),
        }
    }
}

fn page_progress(done: usize, total: usize) -> u8 {
    ((done * 100) / total.max(1)).min(100) as u8
}

/// `<目标>.part`：写入过程中的暂存路径，成功后才改名为目标。
fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn copy_pages(
    job: &DownloadJob,
    pages: &[(String, PathBuf)],
    target: &Path,
    progress: &dyn Fn(u8, String),
) -> Result<Option<PathBuf>> {
    let staging = part_path(target);
    if staging.exists() {
        discard(&staging, fs::remove_dir_all(&staging));
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("cannot create {}", staging.display()))?;

    let outcome = copy_into(job, pages, &staging, progress).and_then(|done| {
        if !done {
            return Ok(None);
        }
        if target.exists() {
            fs::remove_dir_all(target)
                .with_context(|| format!("cannot replace {}", target.display()))?;
        }
        fs::rename(&staging, target)
            .with_context(|| format!("cannot move pages to {}", target.display()))?;
        debug!(target: "sources", "copied {} page(s) to {}", pages.len(), target.display());
        Ok(Some(target.to_path_buf()))
    });
    if !matches!(outcome, Ok(Some(_))) {
        discard(&staging, fs::remove_dir_all(&staging));
    }
    outcome
}

/// 返回 `false` 表示中途被取消。
fn copy_into(
    job: &DownloadJob,
    pages: &[(String, PathBuf)],
    dir: &Path,
    progress: &dyn Fn(u8, String),
) -> Result<bool> {
    for (i, (name, page)) in pages.iter().enumerate() {
        if job.is_cancelled() {
            return Ok(false);
        }
        fs::copy(page, dir.join(name))
            .with_context(|| format!("cannot copy {}", page.display()))?;
        progress(
            page_progress(i + 1, pages.len()),
            format!("page {}/{}", i + 1, pages.len()),
        );
    }
    Ok(true)
}

fn pack_pages(
    job: &DownloadJob,
    pages: &[(String, PathBuf)],
    target: &Path,
    progress: &dyn Fn(u8, String),
) -> Result<Option<PathBuf>> {
    let partial = part_path(target);
    let outcome = write_archive(job, pages, &partial, progress).and_then(|done| {
        if !done {
            return Ok(None);
        }
        fs::rename(&partial, target)
            .with_context(|| format!("cannot move archive to {}", target.display()))?;
        Ok(Some(target.to_path_buf()))
    });
    if !matches!(outcome, Ok(Some(_))) && partial.exists() {
        discard(&partial, fs::remove_file(&partial));
    }
    outcome
}

/// 返回 `false` 表示中途被取消；此时归档未写完。
fn write_archive(
    job: &DownloadJob,
    pages: &[(String, PathBuf)],
    partial: &Path,
    progress: &dyn Fn(u8, String),
) -> Result<bool> {
    let file =
        File::create(partial).with_context(|| format!("cannot create {}", partial.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    // pages are already compressed images
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    for (i, (name, page)) in pages.iter().enumerate() {
        if job.is_cancelled() {
            return Ok(false);
        }
        zip.start_file(name.as_str(), options)?;
        let mut input = File::open(page).with_context(|| format!("cannot read {}", page.display()))?;
        io::copy(&mut input, &mut zip)?;
        progress(
            page_progress(i + 1, pages.len()),
            format!("page {}/{}", i + 1, pages.len()),
        );
    }
    zip.finish()?;
    Ok(true)
}

fn discard(path: &Path, result: io::Result<()>) {
    if let Err(err) = result {
        warn!(target: "sources", "failed to remove partial download {}: {err}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::DownloadFormatProvider;
    use crate::sources::formats::{CbzFormat, FolderFormat};
    use std::sync::atomic::AtomicBool;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (manga, chapter, pages) in [
            ("Naruto", "Chapter 10", 3),
            ("Naruto", "Chapter 2", 2),
            ("Bleach", "Chapter 1", 1),
            ("Blue Lock", "Chapter 1", 0),
        ] {
            let ch = dir.path().join(manga).join(chapter);
            fs::create_dir_all(&ch).unwrap();
            for p in 0..pages {
                fs::write(ch.join(format!("{p:02}.png")), format!("{manga}/{chapter}/{p}")).unwrap();
            }
        }
        dir
    }

    fn job(
        scraper: &LocalFolderScraper,
        manga: &str,
        chapter: &str,
        dest: &Path,
        format: Arc<dyn DownloadFormatProvider>,
    ) -> DownloadJob {
        let manga = scraper.search(manga).unwrap().remove(0);
        let chapter = scraper
            .list_chapters(&manga)
            .unwrap()
            .into_iter()
            .find(|c| c.name == chapter)
            .unwrap();
        DownloadJob {
            chapter,
            destination: dest.to_path_buf(),
            format,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn test_search_is_case_insensitive_substring() {
        let root = tree();
        let scraper = LocalFolderScraper::new(root.path());
        let names: Vec<_> = scraper
            .search("BL")
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["Bleach", "Blue Lock"]);
        assert_eq!(scraper.search("").unwrap().len(), 3);
        assert!(scraper.search("one piece").unwrap().is_empty());
    }

    #[test]
    fn test_chapters_in_natural_order() {
        let root = tree();
        let scraper = LocalFolderScraper::new(root.path());
        let naruto = scraper.search("naruto").unwrap().remove(0);
        let chapters: Vec<_> = scraper
            .list_chapters(&naruto)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(chapters, vec!["Chapter 2", "Chapter 10"]);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let root = tree();
        let scraper = LocalFolderScraper::new(root.path().join("nope"));
        let err = scraper.search("x").unwrap_err();
        assert!(format!("{err:#}").contains("cannot read source folder"));
    }

    #[test]
    fn test_preload_index_serves_searches() {
        let root = tree();
        let scraper = LocalFolderScraper::new(root.path());
        scraper.preload_directory().unwrap();
        fs::create_dir_all(root.path().join("Berserk")).unwrap();
        // index is a snapshot taken at preload time
        assert!(scraper.search("berserk").unwrap().is_empty());
        let immediate = scraper.search_immediate("b").unwrap();
        assert_eq!(immediate.len(), 2);
        assert_eq!(Preview::preview(&scraper).unwrap().len(), 3);
    }

    #[test]
    fn test_copy_pages_into_folder() {
        let root = tree();
        let dest = tempfile::tempdir().unwrap();
        let scraper = LocalFolderScraper::new(root.path());
        let job = job(&scraper, "naruto", "Chapter 10", dest.path(), Arc::new(FolderFormat));

        let reports = Mutex::new(Vec::new());
        let progress = |p: u8, m: String| reports.lock().unwrap().push((p, m));
        let path = scraper.downloader.transfer(&job, &progress).unwrap().unwrap();

        assert_eq!(path, dest.path().join("Naruto").join("Chapter 10"));
        assert_eq!(fs::read_dir(&path).unwrap().count(), 3);
        assert_eq!(
            fs::read_to_string(path.join("02.png")).unwrap(),
            "Naruto/Chapter 10/2"
        );
        let reports = reports.into_inner().unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[2], (100, "page 3/3".to_string()));
    }

    #[test]
    fn test_pack_pages_into_cbz() {
        let root = tree();
        let dest = tempfile::tempdir().unwrap();
        let scraper = LocalFolderScraper::new(root.path());
        let job = job(&scraper, "naruto", "Chapter 2", dest.path(), Arc::new(CbzFormat));

        let path = scraper.downloader.transfer(&job, &|_, _| {}).unwrap().unwrap();
        assert_eq!(path, dest.path().join("Naruto").join("Chapter 2.cbz"));
        let archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        assert!(!path.with_extension("cbz.part").exists());
    }

    #[test]
    fn test_cancelled_transfer_leaves_nothing() {
        let root = tree();
        let dest = tempfile::tempdir().unwrap();
        let scraper = LocalFolderScraper::new(root.path());
        let job = job(&scraper, "naruto", "Chapter 10", dest.path(), Arc::new(FolderFormat));
        job.cancel.store(true, std::sync::atomic::Ordering::SeqCst);

        let result = scraper.downloader.transfer(&job, &|_, _| {}).unwrap();
        assert!(result.is_none());
        assert!(!dest.path().join("Naruto").join("Chapter 10").exists());
    }

    #[test]
    fn test_cancelled_redownload_keeps_previous_copy() {
        let root = tree();
        let dest = tempfile::tempdir().unwrap();
        let scraper = LocalFolderScraper::new(root.path());
        let first = job(&scraper, "naruto", "Chapter 10", dest.path(), Arc::new(FolderFormat));
        let path = scraper.downloader.transfer(&first, &|_, _| {}).unwrap().unwrap();

        let again = job(&scraper, "naruto", "Chapter 10", dest.path(), Arc::new(FolderFormat));
        again.cancel.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(scraper.downloader.transfer(&again, &|_, _| {}).unwrap().is_none());

        assert_eq!(fs::read_dir(&path).unwrap().count(), 3);
        assert!(!part_path(&path).exists());
    }

    #[test]
    fn test_redownload_replaces_folder() {
        let root = tree();
        let dest = tempfile::tempdir().unwrap();
        let scraper = LocalFolderScraper::new(root.path());
        let first = job(&scraper, "naruto", "Chapter 2", dest.path(), Arc::new(FolderFormat));
        let path = scraper.downloader.transfer(&first, &|_, _| {}).unwrap().unwrap();
        fs::write(path.join("stale.txt"), "old").unwrap();

        let again = job(&scraper, "naruto", "Chapter 2", dest.path(), Arc::new(FolderFormat));
        let path = scraper.downloader.transfer(&again, &|_, _| {}).unwrap().unwrap();
        assert!(!path.join("stale.txt").exists());
        assert_eq!(fs::read_dir(&path).unwrap().count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_page_leaves_no_partial_output() {
        let root = tree();
        let dest = tempfile::tempdir().unwrap();
        let chapter = root.path().join("Naruto").join("Chapter 2");
        // dangling link: listed as a page, fails to open
        std::os::unix::fs::symlink(chapter.join("missing.png"), chapter.join("05.png")).unwrap();
        let scraper = LocalFolderScraper::new(root.path());
        let manga_dir = dest.path().join("Naruto");

        let folder = job(&scraper, "naruto", "Chapter 2", dest.path(), Arc::new(FolderFormat));
        let err = scraper.downloader.transfer(&folder, &|_, _| {}).unwrap_err();
        assert!(format!("{err:#}").contains("cannot copy"));

        let cbz = job(&scraper, "naruto", "Chapter 2", dest.path(), Arc::new(CbzFormat));
        let err = scraper.downloader.transfer(&cbz, &|_, _| {}).unwrap_err();
        assert!(format!("{err:#}").contains("cannot read"));

        assert_eq!(fs::read_dir(&manga_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_chapter_fails() {
        let root = tree();
        let dest = tempfile::tempdir().unwrap();
        let scraper = LocalFolderScraper::new(root.path());
        let job = job(&scraper, "blue", "Chapter 1", dest.path(), Arc::new(FolderFormat));
        let err = scraper.downloader.transfer(&job, &|_, _| {}).unwrap_err();
        assert!(err.to_string().contains("contains no pages"));
    }

    #[test]
    fn test_page_progress_bounds() {
        assert_eq!(page_progress(0, 4), 0);
        assert_eq!(page_progress(1, 3), 33);
        assert_eq!(page_progress(3, 3), 100);
        assert_eq!(page_progress(1, 0), 100);
    }
}
