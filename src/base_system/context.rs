//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息，以及文件名清洗工具。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

pub const MAX_RECENT_FOLDERS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // 下载配置
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    #[serde(default)]
    pub output_path: String,
    #[serde(default = "default_download_format")]
    pub download_format: String,
    #[serde(default = "default_true")]
    pub preselect_output_folder: bool,
    #[serde(default)]
    pub recent_folders: Vec<String>,

    // 内容源配置
    #[serde(default)]
    pub selected_scraper: String,
    #[serde(default = "default_true")]
    pub enable_preload: bool,
    #[serde(default)]
    pub source_root: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel_downloads: default_max_parallel_downloads(),
            output_path: String::new(),
            download_format: default_download_format(),
            preselect_output_folder: default_true(),
            recent_folders: Vec::new(),
            selected_scraper: String::new(),
            enable_preload: default_true(),
            source_root: String::new(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 8] = [
            FieldMeta {
                name: "max_parallel_downloads",
                description: "同时进行的章节下载数（至少为 1）",
            },
            FieldMeta {
                name: "output_path",
                description: "默认下载目录，留空则使用当前目录",
            },
            FieldMeta {
                name: "download_format",
                description: "下载格式（folder / cbz）",
            },
            FieldMeta {
                name: "preselect_output_folder",
                description: "选择漫画时自动使用上次的下载目录",
            },
            FieldMeta {
                name: "recent_folders",
                description: "最近使用的下载目录（自动维护）",
            },
            FieldMeta {
                name: "selected_scraper",
                description: "当前选择的内容源 id",
            },
            FieldMeta {
                name: "enable_preload",
                description: "启动时在后台预加载内容源目录",
            },
            FieldMeta {
                name: "source_root",
                description: "本地内容源根目录：<root>/<漫画>/<章节>/文件",
            },
        ];
        &FIELDS
    }
}

impl Config {
    /// 并发下载数；文件中写 0 按 1 处理。
    pub fn parallel_downloads(&self) -> usize {
        self.max_parallel_downloads.max(1)
    }

    pub fn default_output_dir(&self) -> PathBuf {
        if self.output_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.output_path)
        }
    }

    pub fn source_root_dir(&self) -> Option<PathBuf> {
        let root = self.source_root.trim();
        (!root.is_empty()).then(|| PathBuf::from(root))
    }

    /// 把 `folder` 移到最近目录列表最前，超出上限的旧条目丢弃。
    pub fn add_recent_folder(&mut self, folder: &Path) {
        let folder = folder.display().to_string();
        if folder.trim().is_empty() {
            return;
        }
        self.recent_folders.retain(|f| f != &folder);
        self.recent_folders.insert(0, folder);
        self.recent_folders.truncate(MAX_RECENT_FOLDERS);
    }
}

static RE_FORBIDDEN: OnceLock<Regex> = OnceLock::new();

fn re_forbidden() -> &'static Regex {
    RE_FORBIDDEN.get_or_init(|| {
        Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("compile RE_FORBIDDEN")
    })
}

/// 把漫画/章节标题转换为可移植的文件名。
pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let mut cleaned = re_forbidden()
        .replace_all(name.trim(), replacement)
        .into_owned();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let upper = cleaned.to_uppercase();
    if RESERVED.contains(&upper.as_str()) {
        cleaned = format!("_{}", cleaned);
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符中间截断导致 panic
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
        while cleaned.ends_with(' ') || cleaned.ends_with('.') {
            cleaned.pop();
        }
        if cleaned.is_empty() {
            cleaned.push_str("unnamed");
        }
    }

    cleaned
}

fn default_true() -> bool {
    true
}

fn default_max_parallel_downloads() -> usize {
    2
}

fn default_download_format() -> String {
    "folder".to_string()
}
