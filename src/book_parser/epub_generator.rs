//! EPUB 生成器。

use std::collections::HashSet;
use std::io::{Cursor, Read as _, Write as _};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use epub_builder::{EpubBuilder, EpubContent, EpubVersion, ReferenceType, ZipLibrary};
use tracing::{debug, info};

use super::html_utils::escape_html;
use super::image_utils::{mime_from_href, sniff_mime};
use crate::base_system::file_cleaner::write_atomic;
use crate::sync::collaborators::{ArtifactBuilder, BuildOptions};
use crate::sync::models::{BookInfo, ChapterContent};

/// 嵌入 EPUB 的同步信息文件（位于 `OEBPS/` 下）。
pub const SYNC_INFO_FILE: &str = "sync_info.json";

/// 用于从 book_id 确定性生成 UUID v5 的命名空间。
/// 这保证同一本书（同 book_id）的 dc:identifier 永远不变。
const EPUB_UUID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x10, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

pub fn chapter_file_name(index: usize) -> String {
    format!("chapter_{index:05}.xhtml")
}

pub fn stable_uuid(book_id: &str) -> uuid::Uuid {
    uuid::Uuid::new_v5(&EPUB_UUID_NAMESPACE, book_id.as_bytes())
}

#[derive(Debug, Clone)]
pub struct EpubArtifactBuilder {
    pub first_line_indent_em: f32,
}

impl Default for EpubArtifactBuilder {
    fn default() -> Self {
        Self {
            first_line_indent_em: 2.0,
        }
    }
}

impl EpubArtifactBuilder {
    pub fn new(first_line_indent_em: f32) -> Self {
        Self {
            first_line_indent_em,
        }
    }

    fn stylesheet(&self) -> String {
        let indent_em = self.first_line_indent_em.max(0.0);
        let indent_rule = if indent_em > 0.0 {
            format!("text-indent:{}em;", indent_em)
        } else {
            "text-indent:0;".to_string()
        };
        format!(
            "body {{ font-family: serif; color:#000 !important; line-height:1.5; }}
             p {{ color:#000 !important; {} margin:0 0 .8em 0; line-height:1.5; }}
             p.no-indent {{ text-indent:0; }}
             h1.volume {{ text-align:center; margin-top:30%; }}
             img {{ max-width:100%; height:auto; }}",
            indent_rule
        )
    }

    fn render(
        &self,
        metadata: &BookInfo,
        chapters: &[ChapterContent],
        options: &BuildOptions,
    ) -> Result<Vec<u8>> {
        let zip = ZipLibrary::new().map_err(|e| anyhow!(e.to_string()))?;
        let mut book = EpubBuilder::new(zip).map_err(|e| anyhow!(e.to_string()))?;
        book.epub_version(EpubVersion::V30);

        // 同一本书无论同步多少次 identifier 都不变，阅读器可正确恢复进度。
        book.set_uuid(stable_uuid(&metadata.book_id));
        book.metadata("title", &metadata.name).ok();
        book.metadata("lang", "zh").ok();
        book.metadata("toc_name", &metadata.name).ok();
        let author = metadata.author.trim();
        if !author.is_empty() {
            book.metadata("author", author).ok();
        }
        book.metadata("generator", "novel-sync").ok();

        if let Some(bytes) = options.cover.as_ref().filter(|b| !b.is_empty()) {
            let (path, mime) = match sniff_mime(bytes) {
                Some("image/png") => ("images/cover.png", "image/png"),
                Some("image/webp") => ("images/cover.webp", "image/webp"),
                Some("image/gif") => ("images/cover.gif", "image/gif"),
                _ => ("images/cover.jpg", "image/jpeg"),
            };
            book.add_cover_image(path, Cursor::new(bytes.clone()), mime)
                .map_err(|e| anyhow!(e.to_string()))?;
        }

        // 使用 stylesheet() 而非 add_resource()，防止 epub-builder 自动创建空的 stylesheet.css。
        book.stylesheet(Cursor::new(self.stylesheet()))
            .map_err(|e| anyhow!(e.to_string()))?;

        let sync_info =
            serde_json::to_vec_pretty(&options.sync_info).context("同步信息序列化失败")?;
        book.add_resource(SYNC_INFO_FILE, Cursor::new(sync_info), "application/json")
            .map_err(|e| anyhow!(e.to_string()))?;

        let mut hrefs: HashSet<&str> = HashSet::new();
        for ch in chapters {
            for img in &ch.images {
                if !hrefs.insert(img.href.as_str()) {
                    continue;
                }
                let mime = if img.media_type.is_empty() {
                    mime_from_href(&img.href)
                } else {
                    img.media_type.as_str()
                };
                book.add_resource(&img.href, Cursor::new(img.bytes.clone()), mime)
                    .map_err(|e| anyhow!(e.to_string()))?;
            }

            let html = if ch.is_volume {
                wrap_volume_html(&ch.title)
            } else {
                wrap_chapter_html(&ch.title, &ch.html)
            };
            book.add_content(
                EpubContent::new(chapter_file_name(ch.index), Cursor::new(html))
                    .title(ch.title.clone())
                    .reftype(ReferenceType::Text),
            )
            .map_err(|e| anyhow!(e.to_string()))?;
        }

        let mut buffer = Vec::new();
        book.generate(&mut buffer)
            .map_err(|e| anyhow!(e.to_string()))?;
        fixup_epub_identifier(buffer, &metadata.book_id)
    }
}

impl ArtifactBuilder for EpubArtifactBuilder {
    fn extension(&self) -> &str {
        "epub"
    }

    fn build(
        &self,
        metadata: &BookInfo,
        chapters: &[ChapterContent],
        output_path: &Path,
        options: &BuildOptions,
    ) -> Result<()> {
        let bytes = self.render(metadata, chapters, options)?;
        write_atomic(output_path, &bytes)
            .with_context(|| format!("写入 {} 失败", output_path.display()))?;
        info!(
            target: "epub",
            path = %output_path.display(),
            chapters = chapters.len(),
            bytes = bytes.len(),
            "EPUB 已生成"
        );
        Ok(())
    }
}

/// 后处理 EPUB zip：
/// 1. 将 content.opf 和 toc.ncx 中的 `urn:uuid:xxx` 替换为原始 book_id
/// 2. 在 toc.ncx 的 `<head>` 中补充 `<meta name="dtb:uid" content="{book_id}" />`
fn fixup_epub_identifier(epub_bytes: Vec<u8>, book_id: &str) -> Result<Vec<u8>> {
    let urn_str = format!("urn:uuid:{}", stable_uuid(book_id).hyphenated());

    let mut archive = zip::ZipArchive::new(Cursor::new(epub_bytes))
        .map_err(|e| anyhow!("failed to read generated epub: {e}"))?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| anyhow!("zip entry read error: {e}"))?;
        let name = entry.name().to_string();
        let compression = entry.compression();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.push((name, compression, data));
    }
    drop(archive);

    // com.apple.ibooks.display-options.xml 声明 specified-fonts=true，
    // 会让 Calibre/Kindle 误以为内嵌了字体，直接丢弃。
    let dtb_uid_meta = format!("<meta name=\"dtb:uid\" content=\"{}\" />", book_id);
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut out);
        for (name, compression, data) in entries {
            if name.contains("com.apple.ibooks.display-options") {
                continue;
            }
            let options = zip::write::FileOptions::default().compression_method(compression);
            writer
                .start_file(&name, options)
                .map_err(|e| anyhow!("zip write error: {e}"))?;

            let needs_fixup = name.ends_with("content.opf") || name.ends_with("toc.ncx");
            if !needs_fixup {
                writer.write_all(&data)?;
                continue;
            }
            match String::from_utf8(data) {
                Ok(text) => {
                    let mut fixed = text.replace(&urn_str, book_id);
                    // epub-builder 的 toc.ncx 模板没有 dtb:uid
                    if name.ends_with("toc.ncx") && !fixed.contains("dtb:uid") {
                        fixed = fixed.replace(
                            "<meta name=\"dtb:depth\"",
                            &format!("{}\n    <meta name=\"dtb:depth\"", dtb_uid_meta),
                        );
                    }
                    writer.write_all(fixed.as_bytes())?;
                }
                Err(e) => writer.write_all(&e.into_bytes())?,
            }
        }
        writer
            .finish()
            .map_err(|e| anyhow!("zip finish error: {e}"))?;
    }
    debug!(target: "epub", book_id, "已替换 dc:identifier");
    Ok(out.into_inner())
}

fn xhtml_page(title: &str, body: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='utf-8'?>\n<!DOCTYPE html>\n<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"zh\" xml:lang=\"zh\">\n  <head>\n    <title>{}</title>\n    <link href=\"stylesheet.css\" rel=\"stylesheet\" type=\"text/css\"/>\n  </head>\n  <body>{}\n  </body>\n</html>",
        escape_html(title),
        body
    )
}

pub(crate) const CHAPTER_BODY_START: &str = "<!-- chapter-body -->";
pub(crate) const CHAPTER_BODY_END: &str = "<!-- /chapter-body -->";

/// 正文前后加标记，读取旧产物时据此还原出原始片段。
fn wrap_chapter_html(title: &str, body: &str) -> String {
    let inner = format!(
        "<h1>{}</h1>\n{}\n{}\n{}",
        escape_html(title),
        CHAPTER_BODY_START,
        body,
        CHAPTER_BODY_END
    );
    xhtml_page(title, &inner)
}

fn wrap_volume_html(title: &str) -> String {
    xhtml_page(title, &format!("<h1 class=\"volume\">{}</h1>", escape_html(title)))
}
