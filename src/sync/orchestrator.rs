//! 同步主流程编排。
//!
//! 阶段严格按顺序推进：
//! 分析旧产物 → 拉目录 → 校验缓存 → 章节下载‖图片下载 → 组装产物 → 清理 → 完成。
//! 每个阶段边界检查停止信号；任何阶段的未处理错误都收敛为 `SyncResult::Failure`。

use std::collections::HashSet;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::cache::ResumableCache;
use super::chapter_pool::ChapterDownloadPool;
use super::collaborators::{
    ArtifactBuilder, BuildOptions, PriorArtifact, PriorArtifactReader, ProgressSink,
    RemoteSourceClient,
};
use super::error::SyncError;
use super::image_pipeline::{COVER_IMAGE_ID, ImageIngestPipeline, ImageKind, ImageTask};
use super::merger::ArtifactMerger;
use super::models::{
    AssembleProgress, BookInfo, BookRef, CacheState, ChapterRef, ChapterStatus, ImageProgress,
    PriorArtifactInfo, SyncOptions, SyncProgress, SyncResult, SyncStatistics,
};
use super::progress::ProgressReporter;
use super::stats::SyncCounters;
use super::toc_hash::toc_hash;
use crate::base_system::book_paths::artifact_path;

const IMAGE_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

pub struct SyncOrchestrator {
    client: Arc<dyn RemoteSourceClient>,
    builder: Arc<dyn ArtifactBuilder>,
    reader: Option<Arc<dyn PriorArtifactReader>>,
}

/// 一次运行中逐步补全的书籍信息；失败/取消时原样返回给调用方。
#[derive(Default)]
struct RunContext {
    book_info: Option<BookInfo>,
}

struct PriorScope {
    handle: Box<dyn PriorArtifact>,
    info: PriorArtifactInfo,
}

impl SyncOrchestrator {
    pub fn new(client: Arc<dyn RemoteSourceClient>, builder: Arc<dyn ArtifactBuilder>) -> Self {
        Self {
            client,
            builder,
            reader: None,
        }
    }

    pub fn with_prior_reader(mut self, reader: Arc<dyn PriorArtifactReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// 同步一本书。永远不会 panic 或返回 `Err`，所有结局都体现在 `SyncResult` 中。
    pub fn sync_book(
        &self,
        book: &BookRef,
        options: &SyncOptions,
        sink: Option<&dyn ProgressSink>,
        cancel: &Arc<AtomicBool>,
    ) -> SyncResult {
        let progress = ProgressReporter::new(sink);
        let mut ctx = RunContext::default();
        info!(target: "sync", book_id = %book.book_id, "开始同步");

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.run(book, options, progress, cancel, &mut ctx)
        }))
        .unwrap_or_else(|_| Err(SyncError::Other(anyhow::anyhow!("同步过程中发生内部错误"))));

        match outcome {
            Ok((output_path, book_info, stats)) => {
                let msg = format!(
                    "同步完成：新下载 {} 章，复用 {} 章，缓存恢复 {} 章，失败 {} 章，图片 {} 张，用时 {:.1}s",
                    stats.newly_downloaded,
                    stats.reused,
                    stats.restored_from_cache,
                    stats.failed,
                    stats.images_downloaded,
                    stats.duration.as_secs_f32()
                );
                info!(target: "sync", output = %output_path.display(), "{}", msg);
                progress.emit(SyncProgress::Completed(msg));
                SyncResult::Success {
                    output_path,
                    book_info,
                    stats,
                }
            }
            Err(SyncError::Cancelled) => {
                info!(target: "sync", "同步已取消，已下载的章节保留在缓存中");
                progress.emit(SyncProgress::Cancelled("用户停止同步".to_string()));
                SyncResult::Cancelled {
                    book_info: ctx.book_info,
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!(target: "sync", error = %message, "同步失败");
                progress.emit(SyncProgress::Failed(message.clone()));
                SyncResult::Failure {
                    message,
                    book_info: ctx.book_info,
                }
            }
        }
    }

    /// 读取旧产物中嵌入的同步信息。打不开或没有信息时返回 `None`。
    pub fn analyze_prior_artifact(&self, path: &Path) -> Option<PriorArtifactInfo> {
        let reader = self.reader.as_deref()?;
        analyze_prior_artifact(reader, path)
    }

    fn run(
        &self,
        book: &BookRef,
        options: &SyncOptions,
        progress: ProgressReporter<'_>,
        cancel: &Arc<AtomicBool>,
        ctx: &mut RunContext,
    ) -> Result<(PathBuf, BookInfo, SyncStatistics), SyncError> {
        let started = Instant::now();
        let concurrency = options.concurrency();
        if concurrency != options.max_concurrency {
            warn!(
                target: "sync",
                requested = options.max_concurrency,
                used = concurrency,
                "并发数超出范围，已修正"
            );
        }

        // ── 分析旧产物 ─────────────────────────────────────────
        progress.emit(SyncProgress::Analyzing);
        let (mut prior_handle, prior_info) = match self.open_prior(book, options) {
            Some(p) => (Some(p.handle), Some(p.info)),
            None => (None, None),
        };
        check_cancel(cancel)?;

        // ── 拉取目录 ───────────────────────────────────────────
        progress.emit(SyncProgress::FetchingToc);
        let toc = self
            .client
            .chapter_list(&book.book_id)
            .map_err(|e| SyncError::TocUnavailable(format!("{e:#}")))?;
        if toc.is_empty() {
            return Err(SyncError::TocUnavailable("目录为空".to_string()));
        }
        let toc = dedup_by_index(toc);
        let hash = toc_hash(&toc);
        let mut book_info = BookInfo::from(book);
        book_info.toc_hash = Some(hash.clone());
        book_info.chapter_count = toc.len();
        ctx.book_info = Some(book_info.clone());

        let mut selected: Vec<ChapterRef> = toc
            .into_iter()
            .filter(|c| options.in_range(c.index))
            .collect();
        selected.sort_by_key(|c| c.index);
        if selected.is_empty() {
            return Err(SyncError::Other(anyhow::anyhow!("范围无效或章节为空")));
        }
        info!(
            target: "sync",
            book = %book_info.name,
            total = book_info.chapter_count,
            selected = selected.len(),
            "目录获取完成"
        );
        check_cancel(cancel)?;

        // ── 校验缓存 ───────────────────────────────────────────
        progress.emit(SyncProgress::CheckingCache);
        let cache = ResumableCache::new(&options.temp_dir, &book.book_id);
        prepare_cache(&cache, book, &book_info, &hash, options)?;
        check_cancel(cancel)?;

        let counters = Arc::new(SyncCounters::new());
        counters.set_total(selected.len());

        let mut pending: Vec<ChapterRef> = Vec::new();
        let mut resume_images: Vec<ImageTask> = Vec::new();
        for ch in selected.iter().filter(|c| !c.is_volume) {
            match cache.load_chapter(ch.index) {
                Some(rec) if rec.status == ChapterStatus::Downloaded => {
                    counters.inc_restored();
                    resume_images.extend(
                        rec.image_refs
                            .into_iter()
                            .filter(|img| !cache.image_exists(&img.image_id))
                            .map(|img| ImageTask {
                                image_id: img.image_id,
                                url: img.url,
                                kind: ImageKind::Inline,
                            }),
                    );
                }
                Some(rec) if rec.status == ChapterStatus::Failed && !options.retry_failed => {
                    debug!(target: "sync", index = ch.index, "失败章节不重试");
                }
                _ if prior_info
                    .as_ref()
                    .is_some_and(|p| !options.force_redownload && p.is_reusable(ch.index)) =>
                {
                    debug!(target: "sync", index = ch.index, "旧产物中已有，跳过下载");
                }
                _ => pending.push(ch.clone()),
            }
        }
        info!(
            target: "sync",
            pending = pending.len(),
            restored = resume_images.len(),
            "待下载章节统计"
        );

        // ── 章节下载 ‖ 图片下载 ────────────────────────────────
        let mut pipeline = ImageIngestPipeline::start(
            Arc::clone(&self.client),
            cache.clone(),
            Arc::clone(&counters),
            Arc::clone(cancel),
        );
        if let Some(url) = book_info.cover_url.as_ref()
            && !cache.image_exists(COVER_IMAGE_ID)
        {
            pipeline.submit(ImageTask {
                image_id: COVER_IMAGE_ID.to_string(),
                url: url.clone(),
                kind: ImageKind::Cover,
            });
        }
        for task in resume_images {
            pipeline.submit(task);
        }

        let pool_result = {
            let pool = ChapterDownloadPool {
                book_id: &book.book_id,
                client: self.client.as_ref(),
                cache: &cache,
                images: pipeline.queue(),
                counters: &counters,
                progress,
                cancel: cancel.as_ref(),
                max_concurrency: concurrency,
                continue_on_error: options.continue_on_error,
            };
            pool.run(&pending)
        };

        pipeline.close();
        while !pipeline.wait_finished(IMAGE_PROGRESS_INTERVAL) {
            progress.emit(SyncProgress::DownloadingImages(ImageProgress {
                downloaded: counters.images_downloaded(),
                failed: pipeline.failed(),
                queued: pipeline.queued(),
            }));
        }
        let image_report = pipeline.finish();
        progress.emit(SyncProgress::DownloadingImages(ImageProgress {
            downloaded: image_report.downloaded,
            failed: image_report.failed.len(),
            queued: image_report.downloaded + image_report.failed.len() + image_report.skipped,
        }));

        let pool_report = pool_result?;
        check_cancel(cancel)?;

        // ── 组装产物 ───────────────────────────────────────────
        progress.emit(SyncProgress::AssemblingArtifact(AssembleProgress {
            processed: 0,
            total: selected.len(),
        }));
        let merged = {
            let merger = ArtifactMerger {
                cache: &cache,
                prior_info: prior_info.as_ref(),
                force_redownload: options.force_redownload,
                attempted: &pool_report.attempted,
                counters: &counters,
                progress,
            };
            merger.merge(&selected, prior_handle.as_mut())
        };
        // 旧产物可能就是即将覆盖的输出文件，先释放句柄
        drop(prior_handle);
        check_cancel(cancel)?;

        let images_missing = !image_report.failed.is_empty() || !merged.incomplete.is_empty();
        let sync_info = PriorArtifactInfo {
            book_url: book.book_url.clone(),
            toc_hash: hash,
            downloaded_indexes: merged.resolved,
            failed_indexes: merged.failed,
        };
        let output_path =
            artifact_path(&options.output_dir, &book_info.name, self.builder.extension());
        fs::create_dir_all(&options.output_dir)
            .map_err(|e| SyncError::io(&options.output_dir, e))?;
        let build_options = BuildOptions {
            cover: cache.load_image(COVER_IMAGE_ID),
            sync_info,
        };
        self.builder
            .build(&book_info, &merged.chapters, &output_path, &build_options)
            .map_err(|e| SyncError::Build(format!("{e:#}")))?;
        info!(
            target: "sync",
            output = %output_path.display(),
            chapters = merged.chapters.len(),
            "产物已生成"
        );

        // ── 清理 ───────────────────────────────────────────────
        progress.emit(SyncProgress::CleaningUp);
        let stats = counters.snapshot(started.elapsed());
        if stats.failed > 0 {
            info!(target: "sync", failed = stats.failed, "存在失败章节，保留缓存以便下次续传");
        } else if images_missing {
            info!(
                target: "sync",
                failed_images = image_report.failed.len(),
                incomplete = ?merged.incomplete,
                "存在未下载的图片，保留缓存以便下次补全"
            );
        } else if options.clear_cache_on_success
            && let Err(e) = cache.cleanup()
        {
            warn!(target: "sync", error = %e, "清理缓存失败");
        }

        Ok((output_path, book_info, stats))
    }

    fn open_prior(&self, book: &BookRef, options: &SyncOptions) -> Option<PriorScope> {
        if options.force_redownload {
            debug!(target: "sync", "强制重新下载，忽略旧产物");
            return None;
        }
        let path = options.prior_artifact_path.as_deref()?;
        if !path.exists() {
            debug!(target: "sync", path = %path.display(), "旧产物不存在");
            return None;
        }
        let Some(reader) = self.reader.as_deref() else {
            warn!(target: "sync", "未配置旧产物读取器，忽略旧产物");
            return None;
        };

        let mut handle = match reader.open(path) {
            Ok(h) => h,
            Err(e) => {
                warn!(target: "sync", path = %path.display(), error = %format!("{e:#}"), "旧产物打开失败");
                return None;
            }
        };
        let Some(info) = handle.sync_info() else {
            info!(target: "sync", path = %path.display(), "旧产物中没有同步信息");
            return None;
        };
        if !book.book_url.is_empty() && info.book_url != book.book_url {
            warn!(
                target: "sync",
                expected = %book.book_url,
                found = %info.book_url,
                "旧产物属于其它书籍，忽略"
            );
            return None;
        }
        info!(
            target: "sync",
            downloaded = info.downloaded_indexes.len(),
            failed = info.failed_indexes.len(),
            "已读取旧产物同步信息"
        );
        Some(PriorScope { handle, info })
    }
}

/// 同一 index 只保留目录中第一次出现的条目。
fn dedup_by_index(toc: Vec<ChapterRef>) -> Vec<ChapterRef> {
    let mut seen = HashSet::with_capacity(toc.len());
    let mut out = Vec::with_capacity(toc.len());
    for ch in toc {
        if seen.insert(ch.index) {
            out.push(ch);
        } else {
            warn!(
                target: "sync",
                index = ch.index,
                title = %ch.title,
                "目录中章节 index 重复，忽略后者"
            );
        }
    }
    out
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), SyncError> {
    if cancel.load(Ordering::Relaxed) {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

/// 缓存指纹不一致（或强制重下）时清空并重建，绝不沿用。
fn prepare_cache(
    cache: &ResumableCache,
    book: &BookRef,
    book_info: &BookInfo,
    hash: &str,
    options: &SyncOptions,
) -> Result<(), SyncError> {
    let reinit = match cache.get_state() {
        Some(state) if state.toc_hash == hash && !options.force_redownload => {
            info!(
                target: "sync",
                cached = state.cached_chapter_indexes.len(),
                "检测到已存在的下载状态，尝试断点续传"
            );
            false
        }
        Some(state) => {
            if options.force_redownload {
                info!(target: "sync", "强制重新下载，清空缓存");
            } else {
                info!(
                    target: "sync",
                    old = %state.toc_hash,
                    new = %hash,
                    "目录已变化，缓存失效"
                );
            }
            true
        }
        None => true,
    };
    if reinit {
        cache.cleanup()?;
        cache.initialize(
            &book.book_id,
            hash,
            &book_info.name,
            &book.origin,
            &book.server_url,
        )?;
    }
    Ok(())
}

pub fn analyze_prior_artifact(
    reader: &dyn PriorArtifactReader,
    path: &Path,
) -> Option<PriorArtifactInfo> {
    match reader.open(path) {
        Ok(mut handle) => handle.sync_info(),
        Err(e) => {
            debug!(target: "sync", path = %path.display(), error = %format!("{e:#}"), "旧产物打开失败");
            None
        }
    }
}

pub fn get_cache_state(book_id: &str, temp_dir: &Path) -> Option<CacheState> {
    ResumableCache::new(temp_dir, book_id).get_state()
}

pub fn cleanup_cache(book_id: &str, temp_dir: &Path) -> Result<(), SyncError> {
    ResumableCache::new(temp_dir, book_id).cleanup()
}
