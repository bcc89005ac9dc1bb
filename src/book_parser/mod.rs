//! 产物格式模块入口。
//!
//! 负责把合并后的章节写成 EPUB，以及从旧 EPUB 中读回同步信息和章节正文。

pub mod epub_generator;
pub mod epub_reader;
pub(crate) mod html_utils;
pub(crate) mod image_utils;

pub use epub_generator::EpubArtifactBuilder;
pub use epub_reader::EpubArtifactReader;
