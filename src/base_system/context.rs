//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};
use crate::sync::models::SyncOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 路径配置
    #[serde(default)]
    pub save_path: String,
    #[serde(default)]
    pub temp_dir: String,

    // 网络配置
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    // 同步配置
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    #[serde(default = "default_false")]
    pub retry_failed: bool,
    #[serde(default = "default_true")]
    pub auto_clear_dump: bool,

    // 排版配置
    #[serde(default = "default_first_line_indent_em")]
    pub first_line_indent_em: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            temp_dir: String::new(),
            api_endpoint: default_api_endpoint(),
            max_workers: default_max_workers(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            continue_on_error: default_true(),
            retry_failed: default_false(),
            auto_clear_dump: default_true(),
            first_line_indent_em: default_first_line_indent_em(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 10] = [
            FieldMeta {
                name: "save_path",
                description: "EPUB 保存路径，留空则使用当前目录",
            },
            FieldMeta {
                name: "temp_dir",
                description: "断点缓存目录，留空则使用保存路径下的 .novel-sync",
            },
            FieldMeta {
                name: "api_endpoint",
                description: "书源服务地址",
            },
            FieldMeta {
                name: "max_workers",
                description: "最大并发线程数（1-50）",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "max_retries",
                description: "请求失败最大重试次数",
            },
            FieldMeta {
                name: "continue_on_error",
                description: "单章下载失败时继续其余章节",
            },
            FieldMeta {
                name: "retry_failed",
                description: "重新下载之前失败的章节",
            },
            FieldMeta {
                name: "auto_clear_dump",
                description: "全部成功后自动清理断点缓存",
            },
            FieldMeta {
                name: "first_line_indent_em",
                description: "段落首行缩进（em），0 表示不缩进",
            },
        ];
        &FIELDS
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    pub fn temp_dir_path(&self) -> PathBuf {
        if self.temp_dir.trim().is_empty() {
            self.default_save_dir().join(".novel-sync")
        } else {
            PathBuf::from(&self.temp_dir)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    /// 由配置生成一次同步的默认选项，命令行参数再在其上覆盖。
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            temp_dir: self.temp_dir_path(),
            output_dir: self.default_save_dir(),
            retry_failed: self.retry_failed,
            continue_on_error: self.continue_on_error,
            max_concurrency: self.max_workers,
            clear_cache_on_success: self.auto_clear_dump,
            ..SyncOptions::default()
        }
    }
}

pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|ch| match ch {
            // Convert forbidden Windows filename characters to Chinese equivalents
            ':' => '：',        // English colon to Chinese colon
            '"' => '"',         // English quotes to Chinese left double quote
            '<' => '《',        // Less than to Chinese left angle quote
            '>' => '》',        // Greater than to Chinese right angle quote
            '/' | '\\' => '、', // Slashes to Chinese comma
            '|' => '｜',        // Pipe to fullwidth pipe
            '?' => '？',        // Question mark to Chinese question mark
            '*' => '＊',        // Asterisk to fullwidth asterisk
            c if (c as u32) < 32 => replacement.chars().next().unwrap_or('_'),
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let upper = cleaned.to_uppercase();
    if RESERVED.contains(&upper.as_str()) {
        cleaned = format!("_{}", cleaned);
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符（如中文）中间截断导致 panic
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
        while cleaned.ends_with(' ') || cleaned.ends_with('.') {
            cleaned.pop();
        }
        if cleaned.is_empty() {
            cleaned.push_str("unnamed");
        }
    }

    cleaned
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_api_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_max_workers() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_first_line_indent_em() -> f32 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::config::{generate_yaml_with_comments, load_or_create};
    use crate::sync::models::MAX_CONCURRENCY;

    #[test]
    fn safe_fs_name_handles_reserved_and_long_names() {
        assert_eq!(safe_fs_name("a:b?", "_", 120), "a：b？");
        assert_eq!(safe_fs_name("con", "_", 120), "_con");
        assert_eq!(safe_fs_name("  ..", "_", 120), "unnamed");
        let long = "书".repeat(100);
        let cut = safe_fs_name(&long, "_", 10);
        assert!(cut.len() <= 10);
        assert!(cut.chars().all(|c| c == '书'));
    }

    #[test]
    fn user_values_merge_over_defaults_and_file_is_completed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(Config::FILE_NAME);
        std::fs::write(&path, "max_workers: 99\nretry_failed: true\n").unwrap();

        let cfg: Config = load_or_create(Some(dir.path())).unwrap();
        assert_eq!(cfg.max_workers, 99);
        assert!(cfg.retry_failed);
        assert_eq!(cfg.request_timeout, 15);
        assert_eq!(cfg.sync_options().concurrency(), MAX_CONCURRENCY);

        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("# 书源服务地址"));
        assert!(rewritten.contains("max_workers: 99"));
    }

    #[test]
    fn sync_options_follow_config() {
        let cfg = Config {
            save_path: "/books".to_string(),
            auto_clear_dump: false,
            ..Config::default()
        };
        let opts = cfg.sync_options();
        assert_eq!(opts.output_dir, PathBuf::from("/books"));
        assert_eq!(opts.temp_dir, PathBuf::from("/books/.novel-sync"));
        assert!(!opts.clear_cache_on_success);
        assert!(generate_yaml_with_comments(&cfg).unwrap().contains("save_path: /books"));
    }
}
