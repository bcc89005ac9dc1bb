//! HTML/XHTML 文本处理工具。
//!
//! 转义、正文片段提取、正文图片引用的提取与改写等纯文本操作。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use super::image_utils::{ext_from_url, mime_from_ext};
use crate::sync::models::ImageRef;

// 编译一次复用的正则缓存
fn re_src_attr() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| {
        Regex::new(r#"(?is)(\s)src\s*=\s*(['"])([^'"]+)(['"])"#).expect("valid src regex")
    })
}

fn re_img_tag() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r#"(?is)<img\b[^>]*?>"#).expect("valid img regex"))
}

// ── 实体解码 ────────────────────────────────────────────────────

pub(crate) fn decode_xhtml_attr_url(src: &str) -> std::borrow::Cow<'_, str> {
    if src.contains("&amp;") {
        return std::borrow::Cow::Owned(src.replace("&amp;", "&"));
    }
    std::borrow::Cow::Borrowed(src)
}

// ── HTML 转义 ───────────────────────────────────────────────────

pub(crate) fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

// ── 正文片段 ────────────────────────────────────────────────────

/// 若输入是完整文档，只保留 `<body>` 内部；否则原样返回。
pub(crate) fn extract_body_fragment(input: &str) -> String {
    let lower = input.to_ascii_lowercase();
    if let Some(body_idx) = lower.find("<body")
        && let Some(open_end) = lower[body_idx..].find('>')
    {
        let start = body_idx + open_end + 1;
        if let Some(close_idx) = lower[start..].find("</body>") {
            return input[start..start + close_idx].to_string();
        }
    }
    input.to_string()
}

// ── 正文图片 ────────────────────────────────────────────────────

fn absolute_image_url(src: &str) -> Option<String> {
    let src = decode_xhtml_attr_url(src.trim());
    let lower = src.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Some(src.into_owned())
    } else if src.starts_with("//") {
        Some(format!("https:{src}"))
    } else {
        None
    }
}

/// 改写后的章节正文与其中引用到的图片。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RewrittenChapter {
    pub(crate) html: String,
    pub(crate) images: Vec<ImageRef>,
}

/// 把正文里的绝对地址图片改写为本地引用 `images/img_{chapter}_{seq}.{ext}`。
///
/// 同一章内同一 URL 只分配一个 id；相对地址与 data URI 保持不动。
pub(crate) fn rewrite_chapter_images(chapter_index: usize, html: &str) -> RewrittenChapter {
    let mut by_url: HashMap<String, usize> = HashMap::new();
    let mut images: Vec<ImageRef> = Vec::new();

    let rewritten = re_img_tag().replace_all(html, |tag: &Captures| {
        let tag = &tag[0];
        let Some(src) = re_src_attr().captures(tag) else {
            return tag.to_string();
        };
        let Some(url) = absolute_image_url(&src[3]) else {
            return tag.to_string();
        };

        let pos = *by_url.entry(url.clone()).or_insert_with(|| {
            let seq = images.len();
            let ext = ext_from_url(&url).unwrap_or(".jpg");
            let image_id = format!("img_{chapter_index}_{seq}");
            images.push(ImageRef {
                href: format!("images/{image_id}{ext}"),
                media_type: mime_from_ext(ext).to_string(),
                image_id,
                url,
            });
            seq
        });

        let href = &images[pos].href;
        let whole = src.get(0).map(|m| m.range()).unwrap_or(0..0);
        format!(
            "{}{}src={}{}{}{}",
            &tag[..whole.start],
            &src[1],
            &src[2],
            href,
            &src[4],
            &tag[whole.end..]
        )
    });

    RewrittenChapter {
        html: rewritten.into_owned(),
        images,
    }
}

/// 收集正文中指向本地 `images/` 目录的图片引用（去重，保持出现顺序）。
pub(crate) fn local_image_hrefs(html: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in re_img_tag().find_iter(html) {
        let Some(src) = re_src_attr().captures(tag.as_str()) else {
            continue;
        };
        let href = decode_xhtml_attr_url(src[3].trim()).into_owned();
        let href = href.trim_start_matches("./").to_string();
        if href.starts_with("images/") && !out.contains(&href) {
            out.push(href);
        }
    }
    out
}
