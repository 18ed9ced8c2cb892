//! Manga Scraper 命令行入口。
//!
//! 负责：参数解析、日志与配置初始化、在主线程上安装 HomeLoop，
//! 然后把子命令翻译成 `Session` 操作并等待结果。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use manga_scraper::base_system::config::{load_or_create_with_base, resolve_path, write_with_comments};
use manga_scraper::base_system::context::Config;
use manga_scraper::base_system::logging::{LogOptions, LogSystem};
use manga_scraper::dispatch::{HomeLoop, Marshaller};
use manga_scraper::download::{DownloadSnapshot, DownloadState, MangaRecord, ProgressBoard};
use manga_scraper::library::MemoryLibrary;
use manga_scraper::session::{OperationId, Session};
use manga_scraper::sources::{configured_scrapers, default_formats};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const OPERATION_TIMEOUT: Duration = Duration::from_secs(120);
const DOWNLOAD_TICK: Duration = Duration::from_secs(1);
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "manga-scraper")]
#[command(about = "Search, list and download manga chapters")]
struct Cli {
    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,

    /// 数据目录路径（存放 config.yml 与 logs）
    #[arg(long)]
    data_dir: Option<String>,

    /// 本地漫画目录（覆盖配置中的 source_root）
    #[arg(long)]
    source_root: Option<String>,

    /// 以 JSON 输出结果
    #[arg(long, default_value_t = false)]
    json: bool,

    /// 使用的内容源 id
    #[arg(long)]
    scraper: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 列出可用的内容源与下载格式
    Sources,
    /// 搜索漫画
    Search { query: String },
    /// 列出某部漫画的章节
    Chapters { manga: String },
    /// 下载章节（不指定章节时下载全部）
    Download {
        manga: String,
        chapters: Vec<String>,
        /// 输出目录
        #[arg(long)]
        output: Option<String>,
        /// 下载格式 id（folder / cbz）
        #[arg(long)]
        format: Option<String>,
    },
}

#[derive(Serialize)]
struct SourceLine<'a> {
    kind: &'static str,
    id: &'a str,
    name: &'a str,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("Manga Scraper v{VERSION}");
        return Ok(());
    }

    let data_dir = cli.data_dir.as_deref().map(Path::new);
    let log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "当前版本: v{}", VERSION);

    let mut config = load_or_create_with_base::<Config>(None, data_dir)?;
    if let Some(root) = &cli.source_root {
        config.source_root.clone_from(root);
    }
    if let Some(id) = &cli.scraper {
        config.selected_scraper.clone_from(id);
    }

    let home = HomeLoop::install();
    let scrapers = configured_scrapers(&config);
    if scrapers.is_empty() {
        bail!("no manga sources configured; set source_root in config.yml or pass --source-root");
    }
    let library = Arc::new(MemoryLibrary::new());
    let session = Session::new(config, scrapers, default_formats(), library)?;

    {
        let downloads = Arc::clone(session.downloads());
        let home_context = Marshaller::capture();
        log.add_exit_hook(move || {
            downloads.cancel_running();
            // Ctrl-C 线程：主线程仍在泵取 HomeLoop，等下载器确认取消并清理暂存文件
            if !home_context.is_home() && !downloads.wait_idle(CANCEL_GRACE) {
                warn!(target: "download", "downloads did not stop within {CANCEL_GRACE:?}");
            }
        });
    }

    let outcome = match cli.command.unwrap_or(Command::Sources) {
        Command::Sources => list_sources(&session, cli.json),
        Command::Search { query } => search(&home, &session, &query, cli.json),
        Command::Chapters { manga } => chapters(&home, &session, &manga, cli.json),
        Command::Download {
            manga,
            chapters,
            output,
            format,
        } => download(&home, &session, &manga, &chapters, output, format, cli.json),
    };

    session.cleanup();
    let config_path = resolve_path::<Config>(None, data_dir);
    if let Err(err) = write_with_comments(&session.config(), &config_path) {
        warn!(target: "startup", "saving config failed: {err}");
    }
    outcome
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}

fn wait_for(home: &HomeLoop, session: &Session, op: OperationId) -> Result<()> {
    if !home.run_until(|| session.is_finished(op), OPERATION_TIMEOUT) {
        bail!("timed out waiting for {}", session.current_action_text());
    }
    match session.last_error() {
        Some(err) => Err(anyhow!(err)),
        None => Ok(()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list_sources(session: &Session, json: bool) -> Result<()> {
    let mut lines: Vec<SourceLine<'_>> = session
        .scrapers()
        .iter()
        .map(|s| SourceLine {
            kind: "scraper",
            id: s.id(),
            name: s.name(),
        })
        .collect();
    lines.extend(session.formats().iter().map(|f| SourceLine {
        kind: "format",
        id: f.id(),
        name: f.name(),
    }));

    if json {
        return print_json(&lines);
    }
    for line in &lines {
        println!("{:<8} {:<12} {}", line.kind, line.id, line.name);
    }
    Ok(())
}

fn search(home: &HomeLoop, session: &Session, query: &str, json: bool) -> Result<()> {
    let op = session.search(query)?;
    wait_for(home, session, op)?;
    let mangas = session.mangas();
    if json {
        return print_json(mangas.as_slice());
    }
    if mangas.is_empty() {
        println!("no manga matches \"{query}\"");
    }
    for manga in mangas.iter() {
        println!("{:<24} {}", manga.manga_id, manga.name);
    }
    Ok(())
}

/// 按 id 或名称查找 `wanted`，并把它的章节加载到会话中。
fn load_manga(home: &HomeLoop, session: &Session, wanted: &str) -> Result<MangaRecord> {
    let op = session.search(wanted)?;
    wait_for(home, session, op)?;
    let mangas = session.mangas();
    let manga = mangas
        .iter()
        .find(|m| m.manga_id == wanted || m.name.eq_ignore_ascii_case(wanted))
        .or_else(|| mangas.first())
        .cloned()
        .ok_or_else(|| anyhow!("manga not found: {wanted}"))?;

    let op = session.select_manga(manga.clone())?;
    wait_for(home, session, op)?;
    Ok(manga)
}

fn chapters(home: &HomeLoop, session: &Session, wanted: &str, json: bool) -> Result<()> {
    load_manga(home, session, wanted)?;
    let entries = session.chapters();
    if json {
        let chapters: Vec<_> = entries.iter().map(|e| &e.chapter).collect();
        return print_json(&chapters);
    }
    for entry in entries.iter() {
        let mark = if entry.download.path.is_some() { "*" } else { " " };
        println!("{mark} {:<24} {}", entry.chapter.chapter_id, entry.chapter.name);
    }
    Ok(())
}

fn download(
    home: &HomeLoop,
    session: &Session,
    wanted: &str,
    wanted_chapters: &[String],
    output: Option<String>,
    format: Option<String>,
    json: bool,
) -> Result<()> {
    load_manga(home, session, wanted)?;

    if let Some(format) = format {
        session.select_format(&format)?;
    }
    match output {
        Some(output) => session.set_output_path(output),
        None if session.output_path().trim().is_empty() => {
            let fallback: PathBuf = session.config().default_output_dir();
            session.set_output_path(fallback.display().to_string());
        }
        None => {}
    }

    let selected: Vec<_> = session
        .chapters()
        .iter()
        .filter(|e| {
            wanted_chapters.is_empty()
                || wanted_chapters
                    .iter()
                    .any(|c| *c == e.chapter.chapter_id || c.eq_ignore_ascii_case(&e.chapter.name))
        })
        .map(|e| e.chapter.clone())
        .collect();

    let board = Arc::new(if json {
        ProgressBoard::hidden()
    } else {
        ProgressBoard::new()
    });
    board.attach(session.downloads());

    let started = session.download_selected(&selected)?;
    info!(target: "download", "queued {} chapter(s) into {}", started.len(), session.output_path());

    while session.downloads().is_busy() {
        home.run_until(|| !session.downloads().is_busy(), DOWNLOAD_TICK);
    }
    // flush completion events posted by the last workers
    home.run_pending();
    board.clear();

    let snapshots: Vec<DownloadSnapshot> = started.iter().map(|d| d.snapshot()).collect();

    if json {
        print_json(&snapshots)?;
    } else {
        for snap in &snapshots {
            let detail = match (&snap.path, &snap.last_error) {
                (Some(path), _) if snap.state == DownloadState::Ok => path.display().to_string(),
                (_, Some(err)) => err.clone(),
                _ => snap.status_text.clone(),
            };
            println!("{:<10} {:<24} {}", snap.state.label(), snap.chapter_name, detail);
        }
    }

    let skipped = selected.len().saturating_sub(started.len());
    if skipped > 0 {
        warn!(target: "download", "{skipped} chapter(s) could not be queued");
    }
    let unfinished = unfinished_count(selected.len(), &snapshots);
    if unfinished > 0 {
        bail!("{unfinished} of {} chapter(s) did not finish", selected.len());
    }
    Ok(())
}

/// 未完成的章节数：失败/取消的下载加上根本没能排队的章节。
fn unfinished_count(selected: usize, snapshots: &[DownloadSnapshot]) -> usize {
    let failed = snapshots
        .iter()
        .filter(|s| s.state != DownloadState::Ok)
        .count();
    failed + selected.saturating_sub(snapshots.len())
}
