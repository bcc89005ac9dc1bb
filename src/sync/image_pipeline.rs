//! 图片下载管线。
//!
//! 单消费者线程从队列里按 FIFO 顺序取任务：已缓存则跳过，否则下载并落盘。
//! 失败只记录，不会中断同步。生产者全部 drop 掉 `ImageQueue` 后队列关闭，
//! `finish()` 等待消费者把剩余任务处理完。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as channel;
use tracing::{debug, info, warn};

use super::cache::ResumableCache;
use super::collaborators::RemoteSourceClient;
use super::stats::SyncCounters;

pub const COVER_IMAGE_ID: &str = "cover";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Cover,
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTask {
    pub image_id: String,
    pub url: String,
    pub kind: ImageKind,
}

#[derive(Debug, Clone, Default)]
pub struct ImageIngestReport {
    pub downloaded: usize,
    pub skipped: usize,
    /// (image_id, 原因)
    pub failed: Vec<(String, String)>,
    pub cancelled: bool,
}

/// 生产端句柄，可以随意 clone 给多个 worker。
#[derive(Clone)]
pub struct ImageQueue {
    tx: channel::Sender<ImageTask>,
    queued: Arc<AtomicUsize>,
}

impl ImageQueue {
    pub fn submit(&self, task: ImageTask) {
        if self.tx.send(task).is_ok() {
            self.queued.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
impl ImageQueue {
    pub(crate) fn for_test(tx: channel::Sender<ImageTask>) -> Self {
        Self {
            tx,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub struct ImageIngestPipeline {
    queue: Option<ImageQueue>,
    handle: Option<JoinHandle<ImageIngestReport>>,
    /// 消费者线程退出时随之 drop，接收端立即返回 Disconnected
    done: channel::Receiver<()>,
    queued: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl ImageIngestPipeline {
    /// 启动唯一的消费者线程。
    pub fn start(
        client: Arc<dyn RemoteSourceClient>,
        cache: ResumableCache,
        counters: Arc<SyncCounters>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let (tx, rx) = channel::unbounded::<ImageTask>();
        let queued = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let failed_in_worker = Arc::clone(&failed);
        let (done_tx, done) = channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("image-ingest".to_string())
            .spawn(move || {
                let _done = done_tx;
                consume(rx, &*client, &cache, &counters, &cancel, &failed_in_worker)
            })
            .ok();
        if handle.is_none() {
            warn!(target: "image", "图片下载线程启动失败，本次不下载图片");
        }

        Self {
            queue: Some(ImageQueue {
                tx,
                queued: Arc::clone(&queued),
            }),
            handle,
            done,
            queued,
            failed,
        }
    }

    /// 给生产者的句柄；`close()` 之后返回 `None`。
    pub fn queue(&self) -> Option<ImageQueue> {
        self.queue.clone()
    }

    pub fn submit(&self, task: ImageTask) {
        if let Some(q) = &self.queue {
            q.submit(task);
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    /// 关闭自己持有的发送端。其它 clone 出去的 `ImageQueue` 也必须先 drop。
    pub fn close(&mut self) {
        self.queue.take();
    }

    /// 最多等待 `timeout`；消费者线程已退出（或从未启动）时立即返回 `true`。
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        !matches!(
            self.done.recv_timeout(timeout),
            Err(channel::RecvTimeoutError::Timeout)
        )
    }

    /// 关闭队列并等待消费者处理完全部已入队的任务。
    pub fn finish(mut self) -> ImageIngestReport {
        self.close();
        match self.handle.take() {
            Some(h) => h.join().unwrap_or_else(|_| {
                warn!(target: "image", "图片下载线程 panic");
                ImageIngestReport::default()
            }),
            None => ImageIngestReport::default(),
        }
    }
}

impl Drop for ImageIngestPipeline {
    fn drop(&mut self) {
        self.queue.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn consume(
    rx: channel::Receiver<ImageTask>,
    client: &dyn RemoteSourceClient,
    cache: &ResumableCache,
    counters: &SyncCounters,
    cancel: &AtomicBool,
    failed_count: &AtomicUsize,
) -> ImageIngestReport {
    let mut report = ImageIngestReport::default();
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        if cancel.load(Ordering::Relaxed) {
            report.cancelled = true;
            info!(target: "image", "收到停止信号，图片下载结束");
            break;
        }

        let task = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(task) => task,
            Err(channel::RecvTimeoutError::Timeout) => continue,
            Err(channel::RecvTimeoutError::Disconnected) => break,
        };

        if !seen.insert(task.image_id.clone()) || cache.image_exists(&task.image_id) {
            report.skipped += 1;
            continue;
        }

        match fetch_one(client, &task) {
            Ok(bytes) => match cache.save_image(&task.image_id, &bytes) {
                Ok(()) => {
                    counters.inc_images();
                    report.downloaded += 1;
                    debug!(
                        target: "image",
                        image_id = %task.image_id,
                        bytes = bytes.len(),
                        "图片已保存"
                    );
                }
                Err(e) => {
                    failed_count.fetch_add(1, Ordering::AcqRel);
                    warn!(target: "image", image_id = %task.image_id, error = %e, "图片保存失败");
                    report.failed.push((task.image_id, e.to_string()));
                }
            },
            Err(reason) => {
                failed_count.fetch_add(1, Ordering::AcqRel);
                warn!(
                    target: "image",
                    image_id = %task.image_id,
                    url = %task.url,
                    %reason,
                    "图片下载失败"
                );
                report.failed.push((task.image_id, reason));
            }
        }
    }

    info!(
        target: "image",
        downloaded = report.downloaded,
        skipped = report.skipped,
        failed = report.failed.len(),
        "图片下载结束"
    );
    report
}

fn fetch_one(client: &dyn RemoteSourceClient, task: &ImageTask) -> Result<Vec<u8>, String> {
    let bytes = match task.kind {
        ImageKind::Cover => client
            .cover_bytes(&task.url)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "封面不可用".to_string())?,
        ImageKind::Inline => client.fetch_bytes(&task.url).map_err(|e| e.to_string())?,
    };
    if bytes.is_empty() {
        return Err("图片内容为空".to_string());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{ChapterRef, RemoteChapter};
    use anyhow::{Result, anyhow};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeImages {
        calls: Mutex<Vec<String>>,
    }

    impl RemoteSourceClient for FakeImages {
        fn chapter_list(&self, _book_id: &str) -> Result<Vec<ChapterRef>> {
            Ok(Vec::new())
        }

        fn chapter_content(&self, _book_id: &str, _index: usize) -> Result<RemoteChapter> {
            Err(anyhow!("unused"))
        }

        fn cover_bytes(&self, url: &str) -> Result<Option<Vec<u8>>> {
            self.calls.lock().unwrap().push(url.to_string());
            Ok(Some(b"cover".to_vec()))
        }

        fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(url.to_string());
            if url.contains("broken") {
                return Err(anyhow!("404"));
            }
            Ok(url.as_bytes().to_vec())
        }
    }

    fn task(id: &str, url: &str) -> ImageTask {
        ImageTask {
            image_id: id.to_string(),
            url: url.to_string(),
            kind: ImageKind::Inline,
        }
    }

    #[test]
    fn drains_everything_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResumableCache::new(dir.path(), "b");
        cache.save_image("img_1_0", b"old").unwrap();

        let client = Arc::new(FakeImages::default());
        let counters = Arc::new(SyncCounters::new());
        let pipeline = ImageIngestPipeline::start(
            client.clone(),
            cache.clone(),
            counters.clone(),
            Arc::new(AtomicBool::new(false)),
        );

        let producer = pipeline.queue().unwrap();
        let worker = std::thread::spawn(move || {
            producer.submit(task("img_1_0", "https://i/cached.png"));
            producer.submit(task("img_2_0", "https://i/broken.png"));
            producer.submit(task("img_2_1", "https://i/ok.png"));
            producer.submit(task("img_2_1", "https://i/ok.png"));
        });
        pipeline.submit(ImageTask {
            image_id: COVER_IMAGE_ID.to_string(),
            url: "https://i/cover.jpg".to_string(),
            kind: ImageKind::Cover,
        });
        worker.join().unwrap();

        let report = pipeline.finish();
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "img_2_0");
        assert_eq!(counters.images_downloaded(), 2);
        assert_eq!(cache.load_image("img_2_1").unwrap(), b"https://i/ok.png");
        assert_eq!(cache.load_image(COVER_IMAGE_ID).unwrap(), b"cover");

        let calls = client.calls.lock().unwrap().clone();
        let mut per_url: HashMap<String, usize> = HashMap::new();
        for c in calls {
            *per_url.entry(c).or_default() += 1;
        }
        assert_eq!(per_url.get("https://i/ok.png"), Some(&1));
        assert!(!per_url.contains_key("https://i/cached.png"));
    }

    #[test]
    fn cancelled_consumer_stops() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let pipeline = ImageIngestPipeline::start(
            Arc::new(FakeImages::default()),
            ResumableCache::new(dir.path(), "b"),
            Arc::new(SyncCounters::new()),
            cancel,
        );
        let report = pipeline.finish();
        assert!(report.cancelled);
        assert_eq!(report.downloaded, 0);
    }

    #[test]
    fn wait_finished_returns_as_soon_as_consumer_exits() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = ImageIngestPipeline::start(
            Arc::new(FakeImages::default()),
            ResumableCache::new(dir.path(), "b"),
            Arc::new(SyncCounters::new()),
            Arc::new(AtomicBool::new(false)),
        );
        pipeline.submit(task("img_1_0", "https://i/1.png"));
        assert!(!pipeline.wait_finished(Duration::from_millis(20)));

        pipeline.close();
        let started = std::time::Instant::now();
        assert!(pipeline.wait_finished(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        // 已退出后再次等待也立即返回
        assert!(pipeline.wait_finished(Duration::from_secs(10)));
        assert_eq!(pipeline.finish().downloaded, 1);
    }
}
