//! novel-sync 命令行入口。
//!
//! 加载配置与日志后构造默认协作者（HTTP 书源、EPUB 生成/读取、终端进度条），
//! 执行一次同步或缓存维护操作。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::{info, warn};

use novel_sync::base_system::config::load_or_create;
use novel_sync::base_system::context::Config;
use novel_sync::base_system::logging::{LogOptions, LogSystem};
use novel_sync::book_parser::{EpubArtifactBuilder, EpubArtifactReader};
use novel_sync::network_parser::{HttpSourceClient, HttpSourceConfig};
use novel_sync::sync::{
    BookRef, CliProgressSink, SyncOrchestrator, SyncResult, cleanup_cache, get_cache_state,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "novel-sync", version)]
#[command(about = "增量同步小说到 EPUB：断点续传，复用旧 EPUB 中已有章节")]
struct Cli {
    /// 书籍 ID
    book_id: String,

    /// 书籍地址，写入 EPUB 用于识别旧产物归属
    #[arg(long)]
    book_url: Option<String>,

    /// 书名（默认使用书籍 ID）
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    author: Option<String>,

    #[arg(long)]
    cover_url: Option<String>,

    /// 起始章节 index（含）
    #[arg(long)]
    start: Option<usize>,

    /// 结束章节 index（含）
    #[arg(long)]
    end: Option<usize>,

    /// 上一次生成的 EPUB，已有章节直接复用
    #[arg(long)]
    prior: Option<PathBuf>,

    /// 忽略缓存与旧 EPUB，全部重新下载
    #[arg(long, default_value_t = false)]
    force: bool,

    /// 重新下载之前失败的章节
    #[arg(long, default_value_t = false)]
    retry_failed: bool,

    /// 并发下载线程数（1-50），覆盖配置文件
    #[arg(long)]
    workers: Option<usize>,

    /// 数据目录路径（用于存放 config.yml 和 logs 等文件）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 只显示该书的断点缓存状态
    #[arg(long, default_value_t = false)]
    cache_state: bool,

    /// 删除该书的断点缓存
    #[arg(long, default_value_t = false)]
    clear_cache: bool,

    /// 只读取指定 EPUB 中的同步信息
    #[arg(long)]
    analyze: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.as_deref();
    let _log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "novel-sync v{}", VERSION);

    let config = load_or_create::<Config>(data_dir).map_err(|e| anyhow!(e.to_string()))?;

    if let Some(path) = cli.analyze.as_deref() {
        return analyze(path);
    }

    let temp_dir = config.temp_dir_path();
    if cli.cache_state {
        match get_cache_state(&cli.book_id, &temp_dir) {
            Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
            None => println!("没有找到 {} 的断点缓存", cli.book_id),
        }
        return Ok(());
    }
    if cli.clear_cache {
        cleanup_cache(&cli.book_id, &temp_dir)?;
        println!("已清理 {} 的断点缓存", cli.book_id);
        return Ok(());
    }

    run_sync(&cli, &config)
}

fn run_sync(cli: &Cli, config: &Config) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        if let Err(e) = ctrlc::set_handler(move || {
            if !cancel.swap(true, Ordering::SeqCst) {
                eprintln!("\n收到停止信号，正在结束当前任务…");
            }
        }) {
            warn!(target: "startup", "注册 Ctrl-C 处理失败: {e}");
        }
    }

    let client = HttpSourceClient::new(HttpSourceConfig {
        server_url: config.api_endpoint.clone(),
        request_timeout: config.request_timeout(),
        max_retries: config.max_retries as usize,
        ..HttpSourceConfig::default()
    })?;
    let server_url = client.server_url().to_string();

    let orchestrator = SyncOrchestrator::new(
        Arc::new(client),
        Arc::new(EpubArtifactBuilder::new(config.first_line_indent_em)),
    )
    .with_prior_reader(Arc::new(EpubArtifactReader));

    let book = BookRef {
        book_id: cli.book_id.clone(),
        book_url: cli.book_url.clone().unwrap_or_default(),
        name: cli.name.clone(),
        author: cli.author.clone(),
        cover_url: cli.cover_url.clone(),
        origin: "cli".to_string(),
        server_url,
    };

    let mut options = config.sync_options();
    options.start_index = cli.start;
    options.end_index = cli.end;
    options.force_redownload = cli.force;
    options.retry_failed |= cli.retry_failed;
    options.prior_artifact_path = cli.prior.clone();
    if let Some(n) = cli.workers {
        options.max_concurrency = n;
    }

    let sink = CliProgressSink::new();
    match orchestrator.sync_book(&book, &options, Some(&sink), &cancel) {
        SyncResult::Success {
            output_path, stats, ..
        } => {
            println!("已生成：{}", output_path.display());
            if stats.failed > 0 {
                println!(
                    "{} 章下载失败（{:?}），再次运行并加 --retry-failed 可重试",
                    stats.failed, stats.failed_indexes
                );
            }
            Ok(())
        }
        SyncResult::Cancelled { .. } => {
            println!("同步已取消，下次运行会从断点继续");
            Ok(())
        }
        SyncResult::Failure { message, .. } => Err(anyhow!(message)),
    }
}

fn analyze(path: &Path) -> Result<()> {
    let reader = EpubArtifactReader;
    match novel_sync::sync::analyze_prior_artifact(&reader, path) {
        Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
        None => println!("{} 中没有同步信息", path.display()),
    }
    Ok(())
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
        base_dir: base_dir.map(Path::to_path_buf),
    };
    LogSystem::init(opts).map_err(|e| anyhow!(e))
}
