//! novel-sync：小说增量同步引擎。
//!
//! 从远端书源拉目录与章节，断点续传缓存，复用旧 EPUB 中已有的章节，
//! 最终生成新的 EPUB 并在其中嵌入同步信息。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/重试/路径等基础设施
//! - `sync`：同步流程编排（缓存、并发下载、图片管线、合并）
//! - `network_parser`：HTTP 书源客户端
//! - `book_parser`：EPUB 生成与旧 EPUB 读取

pub mod base_system;
pub mod book_parser;
pub mod network_parser;
pub mod sync;
