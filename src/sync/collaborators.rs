//! 同步核心依赖的外部协作者接口。
//!
//! 远端客户端、旧产物读取、产物生成与进度上报都通过 trait 注入；
//! 默认实现见 `network_parser` 与 `book_parser`。

use std::path::Path;

use anyhow::Result;

use super::models::{
    BookInfo, ChapterContent, ChapterRef, PriorArtifactInfo, PriorChapter, RemoteChapter,
    SyncProgress,
};

/// 远端书源。超时与重试由实现方负责。
pub trait RemoteSourceClient: Send + Sync {
    fn chapter_list(&self, book_id: &str) -> Result<Vec<ChapterRef>>;

    fn chapter_content(&self, book_id: &str, index: usize) -> Result<RemoteChapter>;

    /// 封面可能走与普通图片不同的通道；拿不到时返回 `Ok(None)`。
    fn cover_bytes(&self, url: &str) -> Result<Option<Vec<u8>>>;

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

/// 已打开的旧产物句柄，`Drop` 时释放底层资源。
pub trait PriorArtifact: Send {
    fn sync_info(&mut self) -> Option<PriorArtifactInfo>;

    fn chapter_content(&mut self, index: usize) -> Option<PriorChapter>;
}

pub trait PriorArtifactReader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PriorArtifact>>;
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub cover: Option<Vec<u8>>,
    /// 写入产物，供下次同步判断哪些章节可复用
    pub sync_info: PriorArtifactInfo,
}

pub trait ArtifactBuilder: Send + Sync {
    /// 输出文件扩展名（不含点）
    fn extension(&self) -> &str;

    fn build(
        &self,
        metadata: &BookInfo,
        chapters: &[ChapterContent],
        output_path: &Path,
        options: &BuildOptions,
    ) -> Result<()>;
}

/// 进度观察者。出错或 panic 都不会影响同步本身。
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &SyncProgress) -> Result<()>;
}

impl<F> ProgressSink for F
where
    F: Fn(&SyncProgress) + Send + Sync,
{
    fn report(&self, progress: &SyncProgress) -> Result<()> {
        self(progress);
        Ok(())
    }
}
