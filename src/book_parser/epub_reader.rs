//! 旧 EPUB 读取：取出嵌入的同步信息与单章正文，供增量同步复用。

use std::fs::File;
use std::io::Read as _;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use zip::ZipArchive;

use super::epub_generator::{
    CHAPTER_BODY_END, CHAPTER_BODY_START, SYNC_INFO_FILE, chapter_file_name,
};
use super::html_utils::{extract_body_fragment, local_image_hrefs};
use super::image_utils::{effective_mime, mime_from_href};
use crate::sync::collaborators::{PriorArtifact, PriorArtifactReader};
use crate::sync::models::{ImageAsset, PriorArtifactInfo, PriorChapter};

const CONTENT_DIR: &str = "OEBPS";

#[derive(Debug, Clone, Copy, Default)]
pub struct EpubArtifactReader;

impl PriorArtifactReader for EpubArtifactReader {
    fn open(&self, path: &Path) -> Result<Box<dyn PriorArtifact>> {
        let file = File::open(path).with_context(|| format!("打开 {} 失败", path.display()))?;
        let archive = ZipArchive::new(file)
            .with_context(|| format!("{} 不是有效的 EPUB", path.display()))?;
        debug!(target: "epub", path = %path.display(), entries = archive.len(), "已打开旧 EPUB");
        Ok(Box::new(OpenedEpub { archive }))
    }
}

pub struct OpenedEpub {
    archive: ZipArchive<File>,
}

impl OpenedEpub {
    fn read_entry(&mut self, name: &str) -> Option<Vec<u8>> {
        let mut entry = self.archive.by_name(name).ok()?;
        let mut out = Vec::with_capacity(entry.size() as usize);
        match entry.read_to_end(&mut out) {
            Ok(_) => Some(out),
            Err(e) => {
                warn!(target: "epub", entry = name, error = %e, "读取 EPUB 条目失败");
                None
            }
        }
    }
}

impl PriorArtifact for OpenedEpub {
    fn sync_info(&mut self) -> Option<PriorArtifactInfo> {
        let raw = self.read_entry(&format!("{CONTENT_DIR}/{SYNC_INFO_FILE}"))?;
        match serde_json::from_slice(&raw) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(target: "epub", error = %e, "同步信息解析失败");
                None
            }
        }
    }

    fn chapter_content(&mut self, index: usize) -> Option<PriorChapter> {
        let raw = self.read_entry(&format!("{CONTENT_DIR}/{}", chapter_file_name(index)))?;
        let page = String::from_utf8_lossy(&raw);
        let html = chapter_body(&page);

        let mut images = Vec::new();
        for href in local_image_hrefs(&html) {
            let Some(bytes) = self.read_entry(&format!("{CONTENT_DIR}/{href}")) else {
                debug!(target: "epub", index, href = %href, "旧 EPUB 中缺少图片");
                continue;
            };
            let image_id = href
                .rsplit('/')
                .next()
                .and_then(|f| f.split('.').next())
                .unwrap_or(href.as_str())
                .to_string();
            images.push(ImageAsset {
                image_id,
                media_type: effective_mime(&bytes, mime_from_href(&href)).to_string(),
                href,
                bytes,
            });
        }
        Some(PriorChapter { html, images })
    }
}

/// 还原写入时的正文片段；没有标记时退化为 `<body>` 内容并去掉标题。
fn chapter_body(page: &str) -> String {
    if let Some(start) = page.find(CHAPTER_BODY_START)
        && let Some(end) = page[start..].find(CHAPTER_BODY_END)
    {
        let inner = &page[start + CHAPTER_BODY_START.len()..start + end];
        return inner.trim_matches('\n').to_string();
    }
    let body = extract_body_fragment(page);
    let trimmed = body.trim_start();
    if trimmed.starts_with("<h1")
        && let Some(close) = trimmed.find("</h1>")
    {
        return trimmed[close + "</h1>".len()..].trim().to_string();
    }
    body.trim().to_string()
}
