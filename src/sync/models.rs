//! 同步相关的数据模型定义。
//!
//! 包含目录条目、缓存记录、缓存状态、同步选项、进度事件、统计与旧产物信息等核心数据结构。

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 目录中的一个条目。`index` 是跨次运行稳定的排序键。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    pub index: usize,
    pub url: String,
    pub title: String,
    /// 卷标（分卷标题），只在本地合成，不请求远端。
    #[serde(default)]
    pub is_volume: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChapterStatus {
    Downloaded,
    Failed,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub image_id: String,
    pub url: String,
    pub media_type: String,
    /// 改写后正文中引用的本地路径，如 `images/img_3_0.jpg`
    pub href: String,
}

/// 单章缓存记录，创建后立即落盘。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedChapterRecord {
    pub chapter_index: usize,
    pub url: String,
    pub title: String,
    pub is_volume: bool,
    pub status: ChapterStatus,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub downloaded_at: String,
    #[serde(default)]
    pub image_refs: Vec<ImageRef>,
}

impl CachedChapterRecord {
    pub fn downloaded(
        chapter: &ChapterRef,
        title: &str,
        html: String,
        images: Vec<ImageRef>,
    ) -> Self {
        Self {
            chapter_index: chapter.index,
            url: chapter.url.clone(),
            title: title.to_string(),
            is_volume: false,
            status: ChapterStatus::Downloaded,
            html,
            failure_reason: None,
            downloaded_at: now_rfc3339(),
            image_refs: images,
        }
    }

    pub fn failed(chapter: &ChapterRef, reason: &str) -> Self {
        Self {
            chapter_index: chapter.index,
            url: chapter.url.clone(),
            title: chapter.title.clone(),
            is_volume: false,
            status: ChapterStatus::Failed,
            html: String::new(),
            failure_reason: Some(reason.to_string()),
            downloaded_at: now_rfc3339(),
            image_refs: Vec::new(),
        }
    }

    pub fn volume(chapter: &ChapterRef) -> Self {
        Self {
            chapter_index: chapter.index,
            url: chapter.url.clone(),
            title: chapter.title.clone(),
            is_volume: true,
            status: ChapterStatus::Volume,
            html: String::new(),
            failure_reason: None,
            downloaded_at: now_rfc3339(),
            image_refs: Vec::new(),
        }
    }

    /// Downloaded 或 Volume 都算“可直接使用”的内容。
    pub fn is_usable(&self) -> bool {
        matches!(self.status, ChapterStatus::Downloaded | ChapterStatus::Volume)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheState {
    pub book_id: String,
    pub toc_hash: String,
    pub book_name: String,
    pub origin: String,
    pub server_url: String,
    /// 读取时由磁盘上的章节记录推导，不写入 state.json。
    #[serde(skip)]
    pub cached_chapter_indexes: BTreeSet<usize>,
}

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 50;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub start_index: Option<usize>,
    pub end_index: Option<usize>,
    pub retry_failed: bool,
    pub continue_on_error: bool,
    pub max_concurrency: usize,
    pub force_redownload: bool,
    pub prior_artifact_path: Option<PathBuf>,
    /// 全部成功后删除缓存目录
    pub clear_cache_on_success: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("novel-sync"),
            output_dir: PathBuf::from("."),
            start_index: None,
            end_index: None,
            retry_failed: true,
            continue_on_error: true,
            max_concurrency: 4,
            force_redownload: false,
            prior_artifact_path: None,
            clear_cache_on_success: true,
        }
    }
}

impl SyncOptions {
    pub fn in_range(&self, index: usize) -> bool {
        self.start_index.is_none_or(|s| index >= s) && self.end_index.is_none_or(|e| index <= e)
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterProgress {
    pub completed: usize,
    pub total: usize,
    pub last_title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageProgress {
    pub downloaded: usize,
    pub failed: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssembleProgress {
    pub processed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncProgress {
    Analyzing,
    FetchingToc,
    CheckingCache,
    DownloadingChapters(ChapterProgress),
    DownloadingImages(ImageProgress),
    AssemblingArtifact(AssembleProgress),
    CleaningUp,
    Completed(String),
    Cancelled(String),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatistics {
    pub total: usize,
    pub newly_downloaded: usize,
    pub reused: usize,
    pub restored_from_cache: usize,
    pub failed: usize,
    pub images_downloaded: usize,
    pub volume_chapters: usize,
    pub duration: Duration,
    pub failed_indexes: BTreeSet<usize>,
}

/// 从旧产物中提取的同步信息，同时也是写入新产物、供下次运行使用的内容。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorArtifactInfo {
    pub book_url: String,
    pub toc_hash: String,
    #[serde(default)]
    pub downloaded_indexes: BTreeSet<usize>,
    #[serde(default)]
    pub failed_indexes: BTreeSet<usize>,
}

impl PriorArtifactInfo {
    pub fn is_reusable(&self, index: usize) -> bool {
        self.downloaded_indexes.contains(&index) && !self.failed_indexes.contains(&index)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BookRef {
    pub book_id: String,
    pub book_url: String,
    pub name: Option<String>,
    pub author: Option<String>,
    pub cover_url: Option<String>,
    pub origin: String,
    pub server_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookInfo {
    pub book_id: String,
    pub book_url: String,
    pub name: String,
    pub author: String,
    pub cover_url: Option<String>,
    pub toc_hash: Option<String>,
    pub chapter_count: usize,
}

impl From<&BookRef> for BookInfo {
    fn from(book: &BookRef) -> Self {
        Self {
            book_id: book.book_id.clone(),
            book_url: book.book_url.clone(),
            name: book
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| book.book_id.clone()),
            author: book.author.clone().unwrap_or_default(),
            cover_url: book.cover_url.clone().filter(|u| !u.trim().is_empty()),
            toc_hash: None,
            chapter_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub image_id: String,
    pub href: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// 最终输出中的一章。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterContent {
    pub index: usize,
    pub title: String,
    pub html: String,
    pub is_volume: bool,
    pub is_placeholder: bool,
    pub images: Vec<ImageAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChapter {
    pub title: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorChapter {
    pub html: String,
    pub images: Vec<ImageAsset>,
}

#[derive(Debug, Clone)]
pub enum SyncResult {
    Success {
        output_path: PathBuf,
        book_info: BookInfo,
        stats: SyncStatistics,
    },
    Cancelled {
        book_info: Option<BookInfo>,
    },
    Failure {
        message: String,
        book_info: Option<BookInfo>,
    },
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncResult::Success { .. })
    }
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
