//! 多个 worker 并发更新的统计计数。
//!
//! 每个指标一个原子计数器，失败章节集合用互斥锁保护；对外只暴露快照。

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::models::SyncStatistics;

#[derive(Debug, Default)]
pub struct SyncCounters {
    total: AtomicUsize,
    newly_downloaded: AtomicUsize,
    reused: AtomicUsize,
    restored_from_cache: AtomicUsize,
    images_downloaded: AtomicUsize,
    volume_chapters: AtomicUsize,
    failed_indexes: Mutex<BTreeSet<usize>>,
}

impl SyncCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn inc_newly_downloaded(&self) -> usize {
        self.newly_downloaded.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn inc_reused(&self) {
        self.reused.fetch_add(1, Ordering::AcqRel);
    }

    pub fn inc_restored(&self) {
        self.restored_from_cache.fetch_add(1, Ordering::AcqRel);
    }

    pub fn inc_images(&self) -> usize {
        self.images_downloaded.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn inc_volume(&self) {
        self.volume_chapters.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mark_failed(&self, index: usize) {
        if let Ok(mut set) = self.failed_indexes.lock() {
            set.insert(index);
        }
    }

    /// 章节最终被解析成功（例如重试后成功）时撤销失败标记。
    pub fn clear_failed(&self, index: usize) {
        if let Ok(mut set) = self.failed_indexes.lock() {
            set.remove(&index);
        }
    }

    pub fn images_downloaded(&self) -> usize {
        self.images_downloaded.load(Ordering::Acquire)
    }

    pub fn failed_indexes(&self) -> BTreeSet<usize> {
        self.failed_indexes
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, duration: Duration) -> SyncStatistics {
        let failed_indexes = self.failed_indexes();
        SyncStatistics {
            total: self.total.load(Ordering::Acquire),
            newly_downloaded: self.newly_downloaded.load(Ordering::Acquire),
            reused: self.reused.load(Ordering::Acquire),
            restored_from_cache: self.restored_from_cache.load(Ordering::Acquire),
            failed: failed_indexes.len(),
            images_downloaded: self.images_downloaded.load(Ordering::Acquire),
            volume_chapters: self.volume_chapters.load(Ordering::Acquire),
            duration,
            failed_indexes,
        }
    }
}
