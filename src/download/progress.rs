//! CLI 进度条：每个下载项一条，由下载事件驱动。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::manager::DownloadManager;
use super::models::{ChapterKey, DownloadEvent, DownloadState};

pub struct ProgressBoard {
    mp: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<ChapterKey, ProgressBar>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr())
    }

    pub fn hidden() -> Self {
        Self::with_draw_target(ProgressDrawTarget::hidden())
    }

    fn with_draw_target(target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {pos:>3}% {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
        Self {
            mp: MultiProgress::with_draw_target(target),
            style,
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// 订阅 `manager` 的全部下载事件。
    pub fn attach(self: &Arc<Self>, manager: &DownloadManager) {
        let board = Arc::clone(self);
        manager.on_event(move |event| board.handle(event));
    }

    pub fn handle(&self, event: &DownloadEvent) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            DownloadEvent::Started(key) => {
                self.bar(&mut bars, key);
            }
            DownloadEvent::Progress {
                key,
                percent,
                message,
            } => {
                let bar = self.bar(&mut bars, key);
                bar.set_position(u64::from(*percent));
                bar.set_message(message.clone());
            }
            DownloadEvent::Completed { key, state, path } => {
                let bar = self.bar(&mut bars, key);
                match (state, path) {
                    (DownloadState::Ok, Some(path)) => {
                        bar.finish_with_message(path.display().to_string());
                    }
                    // finish 会把进度拉满，失败/取消保留当前位置
                    _ => bar.abandon_with_message(state.label().to_string()),
                }
            }
            DownloadEvent::RemoveRequested(key) => {
                if let Some(bar) = bars.remove(key) {
                    bar.finish_and_clear();
                    self.mp.remove(&bar);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bars.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 单条进度条的位置与是否结束。
    pub fn position(&self, key: &ChapterKey) -> Option<(u64, bool)> {
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|b| (b.position(), b.is_finished()))
    }

    pub fn clear(&self) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, bar) in bars.drain() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
        let _ = self.mp.clear();
    }

    fn bar(&self, bars: &mut HashMap<ChapterKey, ProgressBar>, key: &ChapterKey) -> ProgressBar {
        bars.entry(key.clone())
            .or_insert_with(|| {
                let bar = self.mp.add(ProgressBar::new(100));
                bar.set_style(self.style.clone());
                bar.set_prefix(key.to_string());
                bar
            })
            .clone()
    }
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new()
    }
}
