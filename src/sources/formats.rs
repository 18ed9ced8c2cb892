//! 内置下载格式。

use crate::scraper::DownloadFormatProvider;

/// 章节文件夹，每页一个图片文件。
pub struct FolderFormat;

impl DownloadFormatProvider for FolderFormat {
    fn id(&self) -> &str {
        "folder"
    }

    fn name(&self) -> &str {
        "Folder"
    }

    fn extension(&self) -> &str {
        ""
    }
}

/// 漫画归档（CBZ）：章节页面存放在一个 zip 文件中。
pub struct CbzFormat;

impl DownloadFormatProvider for CbzFormat {
    fn id(&self) -> &str {
        "cbz"
    }

    fn name(&self) -> &str {
        "Comic book archive (.cbz)"
    }

    fn extension(&self) -> &str {
        "cbz"
    }
}
