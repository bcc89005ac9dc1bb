//! 同步流程的错误类型。

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// 目录为空或拉取失败，整次运行直接失败。
    #[error("目录不可用: {0}")]
    TocUnavailable(String),

    /// 单章拉取失败（含正文为空）。
    #[error("章节 {index} 下载失败: {reason}")]
    ChapterFetch { index: usize, reason: String },

    #[error("用户停止同步")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("读取旧产物失败: {0}")]
    PriorArtifact(String),

    #[error("生成产物失败: {0}")]
    Build(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }
}
