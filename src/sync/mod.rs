//! 增量同步模块入口。
//!
//! 子模块：
//! - `models`         — 数据模型（ChapterRef / CacheState / SyncOptions / SyncResult 等）
//! - `error`          — 同步错误类型
//! - `collaborators`  — 远端书源 / 旧产物 / 产物生成 / 进度上报接口
//! - `toc_hash`       — 目录指纹
//! - `cache`          — 断点续传缓存
//! - `stats`          — 运行统计计数器
//! - `progress`       — 进度上报与 CLI 进度条
//! - `image_pipeline` — 图片下载管线（单消费者）
//! - `chapter_pool`   — 章节并发下载工作池
//! - `merger`         — 新缓存与旧产物合并
//! - `orchestrator`   — 同步主流程编排

pub mod cache;
pub(crate) mod chapter_pool;
pub mod collaborators;
pub mod error;
pub(crate) mod image_pipeline;
pub(crate) mod merger;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub(crate) mod stats;
pub mod toc_hash;

pub use collaborators::{
    ArtifactBuilder, BuildOptions, PriorArtifact, PriorArtifactReader, ProgressSink,
    RemoteSourceClient,
};
pub use error::SyncError;
pub use models::{
    BookInfo, BookRef, CacheState, ChapterContent, ChapterRef, ImageAsset, PriorArtifactInfo,
    PriorChapter, RemoteChapter, SyncOptions, SyncProgress, SyncResult, SyncStatistics,
};
pub use orchestrator::{SyncOrchestrator, analyze_prior_artifact, cleanup_cache, get_cache_state};
pub use progress::CliProgressSink;
pub use toc_hash::toc_hash;
