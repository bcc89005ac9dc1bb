//! 章节并发下载工作池。
//!
//! 固定数量的 worker 线程从预先填满的队列里取章节；每章下载后立即落盘，
//! 再把正文中发现的图片交给图片管线。完成顺序不做保证，最终顺序由 index 决定。

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use crossbeam_channel as channel;
use tracing::{debug, error, info, warn};

use super::cache::ResumableCache;
use super::collaborators::RemoteSourceClient;
use super::error::SyncError;
use super::image_pipeline::{ImageKind, ImageQueue, ImageTask};
use super::models::{CachedChapterRecord, ChapterProgress, ChapterRef, SyncProgress};
use super::progress::ProgressReporter;
use super::stats::SyncCounters;
use crate::book_parser::html_utils::{extract_body_fragment, rewrite_chapter_images};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// 本次真正发起过远端请求的章节
    pub attempted: BTreeSet<usize>,
    pub succeeded: BTreeSet<usize>,
    pub failed: BTreeSet<usize>,
    /// 已是 Downloaded 而被跳过的章节
    pub skipped: BTreeSet<usize>,
}

pub struct ChapterDownloadPool<'a> {
    pub book_id: &'a str,
    pub client: &'a dyn RemoteSourceClient,
    pub cache: &'a ResumableCache,
    pub images: Option<ImageQueue>,
    pub counters: &'a SyncCounters,
    pub progress: ProgressReporter<'a>,
    pub cancel: &'a AtomicBool,
    pub max_concurrency: usize,
    pub continue_on_error: bool,
}

#[derive(Default)]
struct PoolShared {
    completed: AtomicUsize,
    abort: AtomicBool,
    first_error: Mutex<Option<SyncError>>,
    report: Mutex<PoolReport>,
}

impl PoolShared {
    fn record(&self, f: impl FnOnce(&mut PoolReport)) {
        let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut report);
    }
}

impl ChapterDownloadPool<'_> {
    /// 下载 `chapters` 中尚未缓存为 Downloaded 的章节。
    ///
    /// `continue_on_error=false` 时第一个失败会让其它 worker 停止取新任务，
    /// 并把该错误返回给调用方。
    pub fn run(&self, chapters: &[ChapterRef]) -> Result<PoolReport, SyncError> {
        let shared = PoolShared::default();

        let pending: Vec<&ChapterRef> = chapters
            .iter()
            .filter(|c| !c.is_volume)
            .filter(|c| {
                if self.cache.is_downloaded(c.index) {
                    shared.record(|r| {
                        r.skipped.insert(c.index);
                    });
                    false
                } else {
                    true
                }
            })
            .collect();

        let total = pending.len();
        if total == 0 {
            return Ok(shared
                .report
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner));
        }

        let workers = self.max_concurrency.clamp(1, total);
        info!(target: "pool", total, workers, "开始下载章节");

        let (tx, rx) = channel::bounded::<&ChapterRef>(total);
        for ch in &pending {
            // 容量等于任务数，不会阻塞
            let _ = tx.send(ch);
        }
        drop(tx);

        thread::scope(|s| {
            for n in 0..workers {
                let rx = rx.clone();
                let shared = &shared;
                let images = self.images.clone();
                let spawned = thread::Builder::new()
                    .name(format!("chapter-worker-{n}"))
                    .spawn_scoped(s, move || self.worker_loop(rx, images, shared, total));
                if let Err(e) = spawned {
                    error!(target: "pool", error = %e, "worker 线程启动失败");
                }
            }
        });

        if self.cancel.load(Ordering::Relaxed) {
            info!(target: "pool", "收到停止信号，结束章节下载");
            return Err(SyncError::Cancelled);
        }

        if let Some(err) = shared
            .first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(err);
        }

        let report = shared
            .report
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        info!(
            target: "pool",
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "章节下载结束"
        );
        Ok(report)
    }

    fn worker_loop(
        &self,
        rx: channel::Receiver<&ChapterRef>,
        images: Option<ImageQueue>,
        shared: &PoolShared,
        total: usize,
    ) {
        loop {
            if self.cancel.load(Ordering::Relaxed) || shared.abort.load(Ordering::Acquire) {
                return;
            }
            let Ok(chapter) = rx.try_recv() else {
                return;
            };

            shared.record(|r| {
                r.attempted.insert(chapter.index);
            });

            let outcome = self.fetch_chapter(chapter, images.as_ref());
            let title = match outcome {
                Ok(title) => {
                    self.counters.inc_newly_downloaded();
                    self.counters.clear_failed(chapter.index);
                    shared.record(|r| {
                        r.succeeded.insert(chapter.index);
                    });
                    title
                }
                Err(SyncError::Cancelled) => return,
                Err(err) => {
                    if !self.continue_on_error {
                        error!(target: "pool", index = chapter.index, error = %err, "章节下载失败，中止本批次");
                        shared.abort.store(true, Ordering::Release);
                        let mut slot = shared
                            .first_error
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        return;
                    }

                    warn!(target: "pool", index = chapter.index, error = %err, "章节下载失败，记录后继续");
                    let reason = err.to_string();
                    if let Err(e) = self
                        .cache
                        .save_chapter(&CachedChapterRecord::failed(chapter, &reason))
                    {
                        warn!(target: "pool", index = chapter.index, error = %e, "失败记录写入失败");
                    }
                    self.counters.mark_failed(chapter.index);
                    shared.record(|r| {
                        r.failed.insert(chapter.index);
                    });
                    chapter.title.clone()
                }
            };

            let completed = shared.completed.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(
                target: "pool",
                done = completed,
                remaining = total - completed,
                "保存完成 {} 章 剩 {} 章",
                completed,
                total - completed
            );
            self.progress
                .emit(SyncProgress::DownloadingChapters(ChapterProgress {
                    completed,
                    total,
                    last_title: title,
                }));
        }
    }

    /// 下载并落盘单章，返回章节标题。
    fn fetch_chapter(
        &self,
        chapter: &ChapterRef,
        images: Option<&ImageQueue>,
    ) -> Result<String, SyncError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(SyncError::Cancelled);
        }

        let fetch_err = |reason: String| SyncError::ChapterFetch {
            index: chapter.index,
            reason,
        };

        let remote = self
            .client
            .chapter_content(self.book_id, chapter.index)
            .map_err(|e| fetch_err(format!("{e:#}")))?;

        let body = extract_body_fragment(&remote.html);
        if body.trim().is_empty() {
            return Err(fetch_err("章节内容为空".to_string()));
        }

        let title = if remote.title.trim().is_empty() {
            chapter.title.clone()
        } else {
            remote.title.trim().to_string()
        };

        let rewritten = rewrite_chapter_images(chapter.index, &body);
        let record = CachedChapterRecord::downloaded(
            chapter,
            &title,
            rewritten.html,
            rewritten.images.clone(),
        );
        self.cache.save_chapter(&record)?;

        if let Some(queue) = images {
            for img in rewritten.images {
                queue.submit(ImageTask {
                    image_id: img.image_id,
                    url: img.url,
                    kind: ImageKind::Inline,
                });
            }
        }
        Ok(title)
    }
}
