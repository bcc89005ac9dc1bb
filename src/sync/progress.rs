//! 进度上报：包装外部注入的 `ProgressSink`，并提供 CLI 进度条实现。

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::debug;

use super::collaborators::ProgressSink;
use super::models::SyncProgress;

/// 对 sink 的调用既不能阻断同步，也不能让 sink 的错误/panic 冒泡。
#[derive(Clone, Copy)]
pub(crate) struct ProgressReporter<'a> {
    sink: Option<&'a dyn ProgressSink>,
}

impl<'a> ProgressReporter<'a> {
    pub(crate) fn new(sink: Option<&'a dyn ProgressSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn emit(&self, progress: SyncProgress) {
        let Some(sink) = self.sink else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| sink.report(&progress))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(target: "sync", error = %e, "进度回调出错，已忽略"),
            Err(_) => debug!(target: "sync", "进度回调 panic，已忽略"),
        }
    }
}

struct CliBars {
    _mp: MultiProgress,
    chapter_bar: ProgressBar,
    image_bar: ProgressBar,
}

/// 终端进度条：章节下载与图片下载各一条。
pub struct CliProgressSink {
    bars: Mutex<Option<CliBars>>,
}

impl CliProgressSink {
    pub fn new() -> Self {
        let mp = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        let chapter_bar = mp.add(ProgressBar::new(0));
        chapter_bar.set_style(style.clone());
        chapter_bar.set_prefix("章节下载");

        let image_bar = mp.add(ProgressBar::new(0));
        image_bar.set_style(style);
        image_bar.set_prefix("图片下载");

        Self {
            bars: Mutex::new(Some(CliBars {
                _mp: mp,
                chapter_bar,
                image_bar,
            })),
        }
    }

    fn finish(&self) {
        let Ok(mut guard) = self.bars.lock() else {
            return;
        };
        if let Some(bars) = guard.take() {
            bars.chapter_bar.finish_and_clear();
            bars.image_bar.finish_and_clear();
        }
    }
}

impl Default for CliProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for CliProgressSink {
    fn report(&self, progress: &SyncProgress) -> Result<()> {
        match progress {
            SyncProgress::Completed(_) | SyncProgress::Cancelled(_) | SyncProgress::Failed(_) => {
                self.finish();
                return Ok(());
            }
            _ => {}
        }

        let guard = self
            .bars
            .lock()
            .map_err(|_| anyhow::anyhow!("progress bars poisoned"))?;
        let Some(bars) = guard.as_ref() else {
            return Ok(());
        };
        match progress {
            SyncProgress::DownloadingChapters(p) => {
                bars.chapter_bar.set_length(p.total as u64);
                bars.chapter_bar.set_position(p.completed as u64);
                bars.chapter_bar.set_message(p.last_title.clone());
            }
            SyncProgress::DownloadingImages(p) => {
                bars.image_bar.set_length(p.queued as u64);
                bars.image_bar.set_position((p.downloaded + p.failed) as u64);
            }
            SyncProgress::AssemblingArtifact(p) => {
                bars.chapter_bar.set_message(format!("组装 {}/{}", p.processed, p.total));
            }
            _ => {}
        }
        Ok(())
    }
}
