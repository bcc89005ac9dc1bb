//! 产物组装：把新缓存、旧产物与失败章节合并为按 index 排序的完整章节列表。
//!
//! 优先级：
//! 1. 本次缓存中 Downloaded / Volume 的记录
//! 2. 旧产物中成功且本次未尝试下载的章节（未强制重下时）
//! 3. 占位章节，并记为失败

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::cache::ResumableCache;
use super::collaborators::PriorArtifact;
use super::models::{
    AssembleProgress, CachedChapterRecord, ChapterContent, ChapterRef, ImageAsset,
    PriorArtifactInfo, SyncProgress,
};
use super::progress::ProgressReporter;
use super::stats::SyncCounters;
use crate::book_parser::image_utils::effective_mime;

pub const PLACEHOLDER_HTML: &str =
    "<p class='no-indent'>本章内容未下载完成或为空（可能是用户中断或网络错误）。</p>";

#[derive(Debug, Clone, Default)]
pub struct MergeOutput {
    pub chapters: Vec<ChapterContent>,
    /// 成功解析（含卷标）的章节，下次运行可复用
    pub resolved: BTreeSet<usize>,
    pub failed: BTreeSet<usize>,
    /// 正文可用但图片没有全部到位的章节；不记入 `resolved`，下次运行补图或重下
    pub incomplete: BTreeSet<usize>,
}

pub struct ArtifactMerger<'a> {
    pub cache: &'a ResumableCache,
    pub prior_info: Option<&'a PriorArtifactInfo>,
    pub force_redownload: bool,
    /// 本次真正请求过远端的章节；这些章节失败时不回退到旧产物
    pub attempted: &'a BTreeSet<usize>,
    pub counters: &'a SyncCounters,
    pub progress: ProgressReporter<'a>,
}

impl ArtifactMerger<'_> {
    pub fn merge(
        &self,
        chapters: &[ChapterRef],
        mut prior: Option<&mut Box<dyn PriorArtifact>>,
    ) -> MergeOutput {
        let mut ordered: Vec<&ChapterRef> = chapters.iter().collect();
        ordered.sort_by_key(|c| c.index);

        let total = ordered.len();
        let mut out = MergeOutput {
            chapters: Vec::with_capacity(total),
            ..MergeOutput::default()
        };

        for (n, ch) in ordered.into_iter().enumerate() {
            let content = if ch.is_volume {
                Some((self.volume_content(ch), true))
            } else {
                self.cached_content(ch).or_else(|| {
                    self.prior_content(ch, prior.as_deref_mut())
                        .map(|c| (c, true))
                })
            };

            match content {
                Some((c, complete)) => {
                    if complete {
                        out.resolved.insert(ch.index);
                    } else {
                        out.incomplete.insert(ch.index);
                    }
                    self.counters.clear_failed(ch.index);
                    out.chapters.push(c);
                }
                None => {
                    debug!(target: "merge", index = ch.index, "章节无可用内容，使用占位");
                    self.counters.mark_failed(ch.index);
                    out.failed.insert(ch.index);
                    out.chapters.push(ChapterContent {
                        index: ch.index,
                        title: ch.title.clone(),
                        html: PLACEHOLDER_HTML.to_string(),
                        is_volume: false,
                        is_placeholder: true,
                        images: Vec::new(),
                    });
                }
            }

            self.progress
                .emit(SyncProgress::AssemblingArtifact(AssembleProgress {
                    processed: n + 1,
                    total,
                }));
        }

        info!(
            target: "merge",
            total,
            resolved = out.resolved.len(),
            incomplete = out.incomplete.len(),
            failed = out.failed.len(),
            "章节组装完成"
        );
        out
    }

    /// 卷标只在本地合成并以 Volume 状态写入缓存。
    fn volume_content(&self, ch: &ChapterRef) -> ChapterContent {
        let cached = self
            .cache
            .load_chapter(ch.index)
            .filter(|r| r.is_volume && r.is_usable());
        let record = match cached {
            Some(r) => r,
            None => {
                let r = CachedChapterRecord::volume(ch);
                if let Err(e) = self.cache.save_chapter(&r) {
                    warn!(target: "merge", index = ch.index, error = %e, "卷标写入缓存失败");
                }
                r
            }
        };
        self.counters.inc_volume();
        ChapterContent {
            index: ch.index,
            title: record.title,
            html: String::new(),
            is_volume: true,
            is_placeholder: false,
            images: Vec::new(),
        }
    }

    /// 返回缓存中的正文，以及其引用的图片是否全部已缓存。
    fn cached_content(&self, ch: &ChapterRef) -> Option<(ChapterContent, bool)> {
        let record = self.cache.load_chapter(ch.index).filter(|r| r.is_usable())?;
        let mut images = Vec::with_capacity(record.image_refs.len());
        let mut complete = true;
        for img in &record.image_refs {
            match self.cache.load_image(&img.image_id) {
                Some(bytes) => images.push(ImageAsset {
                    image_id: img.image_id.clone(),
                    href: img.href.clone(),
                    media_type: effective_mime(&bytes, &img.media_type).to_string(),
                    bytes,
                }),
                None => {
                    complete = false;
                    debug!(
                        target: "merge",
                        index = ch.index,
                        image_id = %img.image_id,
                        "图片未下载，章节标记为不完整"
                    );
                }
            }
        }
        let content = ChapterContent {
            index: ch.index,
            title: record.title,
            html: record.html,
            is_volume: false,
            is_placeholder: false,
            images,
        };
        Some((content, complete))
    }

    fn prior_content(
        &self,
        ch: &ChapterRef,
        prior: Option<&mut Box<dyn PriorArtifact>>,
    ) -> Option<ChapterContent> {
        if self.force_redownload || self.attempted.contains(&ch.index) {
            return None;
        }
        let info = self.prior_info?;
        if !info.is_reusable(ch.index) {
            return None;
        }
        let Some(extracted) = prior?.chapter_content(ch.index) else {
            warn!(target: "merge", index = ch.index, "旧产物中缺少该章节内容");
            return None;
        };
        self.counters.inc_reused();
        Some(ChapterContent {
            index: ch.index,
            title: ch.title.clone(),
            html: extracted.html,
            is_volume: false,
            is_placeholder: false,
            images: extracted.images,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{ChapterStatus, ImageRef, PriorChapter};
    use std::collections::HashMap;
    use std::time::Duration;

    struct MemoryPrior {
        chapters: HashMap<usize, PriorChapter>,
        asked: Vec<usize>,
    }

    impl PriorArtifact for MemoryPrior {
        fn sync_info(&mut self) -> Option<PriorArtifactInfo> {
            None
        }

        fn chapter_content(&mut self, index: usize) -> Option<PriorChapter> {
            self.asked.push(index);
            self.chapters.get(&index).cloned()
        }
    }

    fn chapter(i: usize, volume: bool) -> ChapterRef {
        ChapterRef {
            index: i,
            url: format!("u{i}"),
            title: format!("t{i}"),
            is_volume: volume,
        }
    }

    #[test]
    fn resolves_by_priority_and_orders_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResumableCache::new(dir.path(), "b");
        let counters = SyncCounters::new();

        // 4: 新下载（带图片）；5: 本次尝试但失败；2: 旧的失败记录，未重试
        cache
            .save_chapter(&CachedChapterRecord::downloaded(
                &chapter(4, false),
                "t4",
                "<img src=\"images/img_4_0.png\">".to_string(),
                vec![ImageRef {
                    image_id: "img_4_0".to_string(),
                    url: "https://x/4.png".to_string(),
                    media_type: "image/png".to_string(),
                    href: "images/img_4_0.png".to_string(),
                }],
            ))
            .unwrap();
        cache.save_image("img_4_0", &[0xFF, 0xD8, 0xFF, 0x00]).unwrap();
        cache
            .save_chapter(&CachedChapterRecord::failed(&chapter(5, false), "boom"))
            .unwrap();
        cache
            .save_chapter(&CachedChapterRecord::failed(&chapter(2, false), "old"))
            .unwrap();

        let prior_info = PriorArtifactInfo {
            book_url: "b".to_string(),
            toc_hash: "h".to_string(),
            downloaded_indexes: BTreeSet::from([2, 3, 5, 6]),
            failed_indexes: BTreeSet::from([6]),
        };
        let mut prior: Box<dyn PriorArtifact> = Box::new(MemoryPrior {
            chapters: [2, 3, 5, 6]
                .into_iter()
                .map(|i| {
                    (
                        i,
                        PriorChapter {
                            html: format!("<p>prior {i}</p>"),
                            images: Vec::new(),
                        },
                    )
                })
                .collect(),
            asked: Vec::new(),
        });

        let attempted = BTreeSet::from([4, 5]);
        let merger = ArtifactMerger {
            cache: &cache,
            prior_info: Some(&prior_info),
            force_redownload: false,
            attempted: &attempted,
            counters: &counters,
            progress: ProgressReporter::new(None),
        };
        let toc = vec![
            chapter(6, false),
            chapter(5, false),
            chapter(4, false),
            chapter(3, false),
            chapter(2, false),
            chapter(1, true),
        ];
        let out = merger.merge(&toc, Some(&mut prior));

        let order: Vec<usize> = out.chapters.iter().map(|c| c.index).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5, 6]);
        assert!(out.chapters[0].is_volume);
        assert_eq!(out.chapters[1].html, "<p>prior 2</p>");
        assert_eq!(out.chapters[2].html, "<p>prior 3</p>");
        assert_eq!(out.chapters[3].images[0].media_type, "image/jpeg");
        // 5 本次尝试失败：即使旧产物有也用占位
        assert!(out.chapters[4].is_placeholder);
        // 6 在旧产物里被标记失败
        assert!(out.chapters[5].is_placeholder);

        assert_eq!(out.resolved, BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(out.failed, BTreeSet::from([5, 6]));

        let stats = counters.snapshot(Duration::ZERO);
        assert_eq!(stats.reused, 2);
        assert_eq!(stats.volume_chapters, 1);
        assert_eq!(stats.failed_indexes, BTreeSet::from([5, 6]));

        let volume = cache.load_chapter(1).unwrap();
        assert_eq!(volume.status, ChapterStatus::Volume);
    }

    #[test]
    fn force_redownload_ignores_prior() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResumableCache::new(dir.path(), "b");
        let counters = SyncCounters::new();
        let prior_info = PriorArtifactInfo {
            downloaded_indexes: BTreeSet::from([1]),
            ..PriorArtifactInfo::default()
        };
        let mut prior: Box<dyn PriorArtifact> = Box::new(MemoryPrior {
            chapters: HashMap::from([(
                1,
                PriorChapter {
                    html: "<p>x</p>".to_string(),
                    images: Vec::new(),
                },
            )]),
            asked: Vec::new(),
        });
        let attempted = BTreeSet::new();
        let merger = ArtifactMerger {
            cache: &cache,
            prior_info: Some(&prior_info),
            force_redownload: true,
            attempted: &attempted,
            counters: &counters,
            progress: ProgressReporter::new(None),
        };
        let out = merger.merge(&[chapter(1, false)], Some(&mut prior));
        assert!(out.chapters[0].is_placeholder);
        assert_eq!(out.failed, BTreeSet::from([1]));
    }

    #[test]
    fn chapter_with_missing_image_is_not_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResumableCache::new(dir.path(), "b");
        let counters = SyncCounters::new();
        cache
            .save_chapter(&CachedChapterRecord::downloaded(
                &chapter(1, false),
                "t1",
                "<p>c1</p><img src=\"images/img_1_0.png\"/>".to_string(),
                vec![ImageRef {
                    image_id: "img_1_0".to_string(),
                    url: "https://x/1.png".to_string(),
                    media_type: "image/png".to_string(),
                    href: "images/img_1_0.png".to_string(),
                }],
            ))
            .unwrap();

        let attempted = BTreeSet::from([1]);
        let merger = ArtifactMerger {
            cache: &cache,
            prior_info: None,
            force_redownload: false,
            attempted: &attempted,
            counters: &counters,
            progress: ProgressReporter::new(None),
        };
        let out = merger.merge(&[chapter(1, false)], None);

        assert!(!out.chapters[0].is_placeholder);
        assert!(out.chapters[0].images.is_empty());
        assert!(out.resolved.is_empty());
        assert!(out.failed.is_empty());
        assert_eq!(out.incomplete, BTreeSet::from([1]));
    }
}
