//! 基于 HTTP JSON 接口的远端书源客户端。
//!
//! 接口约定：
//! - `GET {server}/book/{id}/chapters`         → `[{index, url, title, is_volume}]`
//! - `GET {server}/book/{id}/chapters/{index}` → `{title, content}`
//! - 图片 / 封面直接按 URL 取字节

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, CONNECTION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::base_system::cooldown_retry::{Attempt, retry_with_backoff};
use crate::sync::collaborators::RemoteSourceClient;
use crate::sync::models::{ChapterRef, RemoteChapter};

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub server_url: String,
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub user_agent: String,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            request_timeout: Duration::from_secs(15),
            max_retries: 3,
            user_agent: format!("novel-sync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub struct HttpSourceClient {
    client: Client,
    config: HttpSourceConfig,
}

#[derive(Debug, Deserialize)]
struct ChapterContentBody {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

impl HttpSourceClient {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        default_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .unwrap_or(HeaderValue::from_static("novel-sync")),
        );

        let client = Client::builder()
            .default_headers(default_headers)
            .timeout(config.request_timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { client, config })
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.server_url.trim_end_matches('/'), path)
    }

    /// 带退避重试的 GET。传输错误、429 与 5xx 会重试，其它非 2xx 直接失败。
    fn get_with_retry(&self, url: &str, accept: &'static str) -> Result<Response> {
        retry_with_backoff(self.config.max_retries, |attempt| {
            if attempt > 0 {
                debug!(target: "network", attempt, url, "重试请求");
            }
            let resp = match self.client.get(url).header(ACCEPT, accept).send() {
                Ok(r) => r,
                Err(e) => {
                    warn!(target: "network", url, error = %e, "请求失败");
                    return Attempt::Retry(anyhow!(e).context(format!("请求 {url} 失败")));
                }
            };
            let status = resp.status();
            if status.is_success() {
                return Attempt::Done(resp);
            }
            let err = anyhow!("请求 {url} 返回 HTTP {}", status.as_u16());
            if is_retryable(status) {
                warn!(target: "network", url, status = status.as_u16(), "服务端繁忙，稍后重试");
                Attempt::Retry(err)
            } else {
                Attempt::Fatal(err)
            }
        })
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

impl RemoteSourceClient for HttpSourceClient {
    fn chapter_list(&self, book_id: &str) -> Result<Vec<ChapterRef>> {
        let url = self.endpoint(&format!("book/{book_id}/chapters"));
        let resp = self.get_with_retry(&url, "application/json")?;
        let chapters: Vec<ChapterRef> = resp.json().context("目录 JSON 解析失败")?;
        debug!(target: "network", book_id, count = chapters.len(), "目录获取成功");
        Ok(chapters)
    }

    fn chapter_content(&self, book_id: &str, index: usize) -> Result<RemoteChapter> {
        let url = self.endpoint(&format!("book/{book_id}/chapters/{index}"));
        let resp = self.get_with_retry(&url, "application/json")?;
        let body: ChapterContentBody = resp
            .json()
            .with_context(|| format!("章节 {index} JSON 解析失败"))?;
        Ok(RemoteChapter {
            title: body.title,
            html: body.content,
        })
    }

    fn cover_bytes(&self, url: &str) -> Result<Option<Vec<u8>>> {
        if url.trim().is_empty() {
            return Ok(None);
        }
        let bytes = self.fetch_bytes(url)?;
        Ok((!bytes.is_empty()).then_some(bytes))
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.get_with_retry(url, "image/*,*/*;q=0.8")?;
        let bytes = resp.bytes().with_context(|| format!("读取 {url} 响应失败"))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
        assert!(!is_retryable(StatusCode::FORBIDDEN));
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let client = HttpSourceClient::new(HttpSourceConfig {
            server_url: "http://host:1/api/".to_string(),
            ..HttpSourceConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.endpoint("book/7/chapters"),
            "http://host:1/api/book/7/chapters"
        );
    }

    #[test]
    fn chapter_list_json_shape() {
        let raw = r#"[{"index":1,"url":"u1","title":"第一卷","is_volume":true},{"index":2,"url":"u2","title":"第一章"}]"#;
        let chapters: Vec<ChapterRef> = serde_json::from_str(raw).unwrap();
        assert_eq!(chapters.len(), 2);
        assert!(chapters[0].is_volume);
        assert!(!chapters[1].is_volume);
    }
}
