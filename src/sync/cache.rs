//! 断点续传缓存。
//!
//! 每本书一个目录：
//! - `state.json`             — 书籍 ID / 目录指纹 / 书名 / 来源
//! - `chapters/{index}.json`  — 单章记录，创建即落盘
//! - `images/{id}.img`        — 图片原始字节
//!
//! 每个键一个文件，写入用临时文件 + rename 原子替换；并发的章节 worker
//! 永远不会写同一个键，因此不需要加锁。读取失败一律视为“不存在”。

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::error::SyncError;
use super::models::{CacheState, CachedChapterRecord, ChapterStatus};
use crate::base_system::book_paths::cache_folder_path;
use crate::base_system::file_cleaner::{
    remove_dir_all_if_exists, remove_parent_if_empty, write_atomic,
};

const STATE_FILE: &str = "state.json";
const CHAPTER_DIR: &str = "chapters";
const IMAGE_DIR: &str = "images";

#[derive(Debug, Clone)]
pub struct ResumableCache {
    book_id: String,
    root: PathBuf,
}

impl ResumableCache {
    pub fn new(temp_dir: &Path, book_id: &str) -> Self {
        Self {
            book_id: book_id.to_string(),
            root: cache_folder_path(temp_dir, book_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    fn chapter_path(&self, index: usize) -> PathBuf {
        self.root.join(CHAPTER_DIR).join(format!("{index:06}.json"))
    }

    fn image_path(&self, image_id: &str) -> PathBuf {
        self.root.join(IMAGE_DIR).join(format!("{image_id}.img"))
    }

    pub fn get_state(&self) -> Option<CacheState> {
        let raw = fs::read_to_string(self.state_path()).ok()?;
        let mut state: CacheState = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    target: "cache",
                    book_id = %self.book_id,
                    error = %e,
                    "state.json 解析失败，视为无缓存"
                );
                return None;
            }
        };
        state.cached_chapter_indexes = self.cached_indexes();
        Some(state)
    }

    pub fn initialize(
        &self,
        book_id: &str,
        toc_hash: &str,
        book_name: &str,
        origin: &str,
        server_url: &str,
    ) -> Result<(), SyncError> {
        let state = CacheState {
            book_id: book_id.to_string(),
            toc_hash: toc_hash.to_string(),
            book_name: book_name.to_string(),
            origin: origin.to_string(),
            server_url: server_url.to_string(),
            cached_chapter_indexes: BTreeSet::new(),
        };
        let bytes = serde_json::to_vec_pretty(&state).map_err(anyhow::Error::from)?;
        let path = self.state_path();
        write_atomic(&path, &bytes).map_err(|e| SyncError::io(&path, e))?;
        info!(target: "cache", book_id, toc_hash, "初始化断点缓存");
        Ok(())
    }

    pub fn is_valid(&self, toc_hash: &str) -> bool {
        self.get_state()
            .map(|s| s.toc_hash == toc_hash)
            .unwrap_or(false)
    }

    /// 清空这本书的全部缓存。
    pub fn cleanup(&self) -> Result<(), SyncError> {
        remove_dir_all_if_exists(&self.root).map_err(|e| SyncError::io(&self.root, e))?;
        remove_parent_if_empty(&self.root);
        debug!(target: "cache", book_id = %self.book_id, "已清理缓存目录");
        Ok(())
    }

    pub fn save_chapter(&self, record: &CachedChapterRecord) -> Result<(), SyncError> {
        let bytes = serde_json::to_vec(record).map_err(anyhow::Error::from)?;
        let path = self.chapter_path(record.chapter_index);
        write_atomic(&path, &bytes).map_err(|e| SyncError::io(&path, e))?;
        debug!(
            target: "cache",
            index = record.chapter_index,
            status = ?record.status,
            bytes = bytes.len(),
            "保存章节记录"
        );
        Ok(())
    }

    pub fn load_chapter(&self, index: usize) -> Option<CachedChapterRecord> {
        read_record(&self.chapter_path(index))
    }

    /// 按 index 排序返回全部可读的章节记录。
    pub fn load_all_chapters(&self) -> Vec<CachedChapterRecord> {
        let Ok(rd) = fs::read_dir(self.root.join(CHAPTER_DIR)) else {
            return Vec::new();
        };
        let mut out: Vec<CachedChapterRecord> = rd
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .filter_map(|p| read_record(&p))
            .collect();
        out.sort_by_key(|r| r.chapter_index);
        out
    }

    /// 已缓存且状态为 Downloaded 的章节。
    pub fn is_downloaded(&self, index: usize) -> bool {
        self.load_chapter(index)
            .map(|r| r.status == ChapterStatus::Downloaded)
            .unwrap_or(false)
    }

    pub fn image_exists(&self, image_id: &str) -> bool {
        self.image_path(image_id).is_file()
    }

    pub fn save_image(&self, image_id: &str, bytes: &[u8]) -> Result<(), SyncError> {
        let path = self.image_path(image_id);
        write_atomic(&path, bytes).map_err(|e| SyncError::io(&path, e))
    }

    pub fn load_image(&self, image_id: &str) -> Option<Vec<u8>> {
        fs::read(self.image_path(image_id)).ok()
    }

    fn cached_indexes(&self) -> BTreeSet<usize> {
        let Ok(rd) = fs::read_dir(self.root.join(CHAPTER_DIR)) else {
            return BTreeSet::new();
        };
        rd.filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    return None;
                }
                path.file_stem()?.to_str()?.parse::<usize>().ok()
            })
            .collect()
    }
}

fn read_record(path: &Path) -> Option<CachedChapterRecord> {
    let raw = fs::read(path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(r) => Some(r),
        Err(e) => {
            debug!(target: "cache", path = %path.display(), error = %e, "章节记录损坏，忽略");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{ChapterRef, ImageRef};

    fn chapter(i: usize) -> ChapterRef {
        ChapterRef {
            index: i,
            url: format!("https://example.org/{i}"),
            title: format!("第{i}章"),
            is_volume: false,
        }
    }

    #[test]
    fn state_roundtrip_and_validity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResumableCache::new(dir.path(), "42");
        assert!(cache.get_state().is_none());
        assert!(!cache.is_valid("h1"));

        cache.initialize("42", "h1", "书名", "web", "https://api").unwrap();
        let state = cache.get_state().unwrap();
        assert_eq!(state.toc_hash, "h1");
        assert_eq!(state.book_name, "书名");
        assert!(state.cached_chapter_indexes.is_empty());
        assert!(cache.is_valid("h1"));
        assert!(!cache.is_valid("h2"));
    }

    #[test]
    fn chapters_upsert_and_list_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResumableCache::new(dir.path(), "42");
        cache.initialize("42", "h", "n", "o", "s").unwrap();

        cache
            .save_chapter(&CachedChapterRecord::failed(&chapter(7), "timeout"))
            .unwrap();
        cache
            .save_chapter(&CachedChapterRecord::downloaded(
                &chapter(2),
                "第2章",
                "<p>x</p>".to_string(),
                vec![ImageRef {
                    image_id: "img_2_0".to_string(),
                    url: "https://img/a.png".to_string(),
                    media_type: "image/png".to_string(),
                    href: "images/img_2_0.png".to_string(),
                }],
            ))
            .unwrap();
        // 同一键再次写入覆盖旧记录
        cache
            .save_chapter(&CachedChapterRecord::downloaded(
                &chapter(7),
                "第7章",
                "<p>ok</p>".to_string(),
                Vec::new(),
            ))
            .unwrap();

        let all = cache.load_all_chapters();
        assert_eq!(
            all.iter().map(|r| r.chapter_index).collect::<Vec<_>>(),
            vec![2, 7]
        );
        assert!(cache.is_downloaded(7));
        assert_eq!(all[0].image_refs.len(), 1);
        assert_eq!(
            cache.get_state().unwrap().cached_chapter_indexes,
            BTreeSet::from([2, 7])
        );
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResumableCache::new(dir.path(), "42");
        let path = cache.chapter_path(3);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{not json").unwrap();
        assert!(cache.load_chapter(3).is_none());
        assert!(cache.load_all_chapters().is_empty());
    }

    #[test]
    fn images_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResumableCache::new(dir.path(), "42");
        assert!(!cache.image_exists("img_1_0"));
        assert!(cache.load_image("img_1_0").is_none());
        cache.save_image("img_1_0", b"\x89PNG").unwrap();
        assert!(cache.image_exists("img_1_0"));
        assert_eq!(cache.load_image("img_1_0").unwrap(), b"\x89PNG");

        cache.cleanup().unwrap();
        assert!(!cache.root().exists());
        assert!(!cache.image_exists("img_1_0"));
        // 重复清理不报错
        cache.cleanup().unwrap();
    }
}
