//! 内置内容源与下载格式。

pub mod formats;
pub mod local;

use std::sync::Arc;

use tracing::warn;

use crate::base_system::context::Config;
use crate::scraper::{DownloadFormatProvider, Scraper};

pub use formats::{CbzFormat, FolderFormat};
pub use local::{LOCAL_SCRAPER_ID, LocalFolderScraper};

/// 按菜单顺序排列的下载格式，第一个为默认。
pub fn default_formats() -> Vec<Arc<dyn DownloadFormatProvider>> {
    vec![Arc::new(FolderFormat), Arc::new(CbzFormat)]
}

/// 配置中启用的内容源。
pub fn configured_scrapers(config: &Config) -> Vec<Arc<dyn Scraper>> {
    let mut scrapers: Vec<Arc<dyn Scraper>> = Vec::new();
    match config.source_root_dir() {
        Some(root) if root.is_dir() => scrapers.push(Arc::new(LocalFolderScraper::new(root))),
        Some(root) => {
            warn!(target: "sources", "source root {} is not a directory, skipped", root.display());
        }
        None => {}
    }
    scrapers
}
