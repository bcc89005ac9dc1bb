//! 图片 MIME / 扩展名判定。
//!
//! 下载阶段按 URL 扩展名猜测，打包阶段再按字节头纠正。

// ── MIME / 扩展名 ───────────────────────────────────────────────

pub(crate) fn mime_from_ext(ext: &str) -> &'static str {
    match ext {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".avif" => "image/avif",
        ".svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// 从 URL 路径部分取出已知的图片扩展名（忽略 query / fragment）。
pub(crate) fn ext_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = last.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" => Some(".jpg"),
        "jpeg" => Some(".jpeg"),
        "png" => Some(".png"),
        "gif" => Some(".gif"),
        "webp" => Some(".webp"),
        "avif" => Some(".avif"),
        "svg" => Some(".svg"),
        _ => None,
    }
}

pub(crate) fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF {
        return Some("image/jpeg");
    }
    if bytes.len() >= 8 && bytes[..8] == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some("image/png");
    }
    if bytes.len() >= 6 && &bytes[0..3] == b"GIF" {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    None
}

/// 字节头能识别就以字节头为准，否则沿用下载时记录的类型。
pub(crate) fn effective_mime<'a>(bytes: &[u8], recorded: &'a str) -> &'a str {
    sniff_mime(bytes).unwrap_or(recorded)
}

pub(crate) fn mime_from_href(href: &str) -> &'static str {
    ext_from_url(href)
        .map(mime_from_ext)
        .unwrap_or("application/octet-stream")
}
