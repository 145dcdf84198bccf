//! ting-mirror 命令行：解析一本有声书，按缺失优先补齐所有集。

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{info, warn};

use ting_mirror::base_system::config::{load_or_create, load_or_create_with_base};
use ting_mirror::base_system::context::Config;
use ting_mirror::base_system::logging::{LogOptions, LogSystem};
use ting_mirror::download::models::{DownloadPlan, DownloadResult, EpisodeRange, RunSummary};
use ting_mirror::download::progress::ProgressDisplay;
use ting_mirror::{Engine, TaskState};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "ting-mirror")]
#[command(version = VERSION)]
#[command(about = "Audio book mirror: resolve a book page and download every missing episode")]
struct Cli {
    /// 书籍页或任意一集的播放页地址
    url: String,

    /// 输出目录（覆盖配置中的 save_path）
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// 起始集（含）
    #[arg(long)]
    start: Option<u32>,

    /// 结束集（含）
    #[arg(long)]
    end: Option<u32>,

    /// 并发数
    #[arg(short = 'j', long = "concurrency")]
    concurrency: Option<usize>,

    /// 代理：direct、auto 或代理地址
    #[arg(long)]
    proxy: Option<String>,

    /// 每完成多少集轮换一次出口（0 关闭）
    #[arg(long)]
    rotate_every: Option<usize>,

    /// 显示浏览器窗口
    #[arg(long, default_value_t = false)]
    visible: bool,

    /// 忽略已存在的文件，范围内全部重新下载
    #[arg(long, default_value_t = false)]
    force: bool,

    /// 完整性检查方式：signature 或 hash
    #[arg(long)]
    integrity: Option<String>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 数据目录路径（用于存放 config.yml 和 logs）
    #[arg(long)]
    data_dir: Option<String>,

    /// 只生成计划并列出已有/缺失的集
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(out) = &self.output {
            config.save_path = out.clone();
        }
        if let Some(j) = self.concurrency {
            config.max_workers = j;
        }
        if let Some(proxy) = self.proxy.as_deref().map(str::trim) {
            match proxy.to_ascii_lowercase().as_str() {
                "direct" => config.proxy_mode = "direct".into(),
                "auto" => config.proxy_mode = "auto".into(),
                _ => {
                    config.proxy_mode = "fixed".into();
                    config.proxy_address = proxy.to_string();
                }
            }
        }
        if let Some(n) = self.rotate_every {
            config.rotate_every = n;
        }
        if self.visible {
            config.headless = false;
        }
        if self.force {
            config.force = true;
        }
        if let Some(mode) = &self.integrity {
            config.integrity = mode.clone();
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.as_deref().map(Path::new);
    let log = match init_logging(cli.debug, data_dir) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("failed to initialize logging: {e:#}");
            return ExitCode::from(1);
        }
    };

    let code = match run(&cli, data_dir) {
        Ok(summary) => exit_code(summary.as_ref()),
        Err(e) => {
            tracing::error!(target: "startup", "{e:#}");
            eprintln!("错误: {e:#}");
            ExitCode::from(1)
        }
    };
    log.safe_exit();
    code
}

fn exit_code(summary: Option<&RunSummary>) -> ExitCode {
    match summary {
        Some(s) if s.failed() > 0 => ExitCode::from(2),
        _ => ExitCode::SUCCESS,
    }
}

fn run(cli: &Cli, data_dir: Option<&Path>) -> Result<Option<RunSummary>> {
    let mut config = match data_dir {
        Some(dir) => load_or_create_with_base::<Config>(None, Some(dir)),
        None => load_or_create::<Config>(None),
    }
    .map_err(|e| anyhow!(e.to_string()))?;
    cli.apply(&mut config);
    info!(target: "startup", "ting-mirror v{VERSION}");

    let engine = Engine::new(config).context("failed to start engine")?;
    let handle = engine.abort_handle();
    ctrlc::set_handler(move || {
        if handle.is_aborted() {
            warn!(target: "startup", "already aborting, waiting for running episodes");
        }
        handle.abort();
    })
    .context("failed to install Ctrl+C handler")?;

    let range = EpisodeRange::new(cli.start, cli.end);
    let plan = engine.plan(&cli.url, range, cli.force)?;
    print_plan(&plan);
    if cli.dry_run {
        engine.shutdown();
        return Ok(None);
    }
    if plan.tasks.is_empty() {
        println!("没有需要下载的集。");
        engine.shutdown();
        return Ok(None);
    }

    let progress = ProgressDisplay::new(plan.tasks.len());
    let result = engine.run(&plan, Some(progress.sink()));
    progress.finish();
    engine.shutdown();
    let summary = result?;
    print_summary(&summary);
    Ok(Some(summary))
}

fn print_plan(plan: &DownloadPlan) {
    println!("《{}》 共 {} 集", plan.book.title, plan.book.episodes.len());
    println!("输出目录: {}", plan.book_dir.display());
    println!("已存在: {} 集", plan.present.len());
    println!("待下载: {} 集 {}", plan.tasks.len(), compact(&task_indices(plan)));
    if !plan.omitted.is_empty() {
        println!("站点缺失: {}", compact(&plan.omitted));
    }
}

fn task_indices(plan: &DownloadPlan) -> Vec<u32> {
    plan.tasks.iter().map(|t| t.index).collect()
}

fn print_summary(s: &RunSummary) {
    println!(
        "完成 {}，失败 {}，跳过 {}，取消 {}，未开始 {}，轮换 {} 次",
        s.completed(),
        s.failed(),
        s.skipped.len(),
        s.cancelled(),
        s.not_started.len(),
        s.rotations
    );
    if s.rotation_degraded > 0 {
        println!("轮换降级 {} 次（沿用原出口）", s.rotation_degraded);
    }
    for ep in s.episodes.iter().filter(|e| e.final_state() == TaskState::Failed) {
        if let DownloadResult::Failed { reason, message, .. } = &ep.result {
            println!("  #{:04} {} [{reason}] {message}", ep.index, ep.title);
        }
    }
    if s.aborted {
        println!("运行已中止。");
    }
    if s.abort_recommended {
        println!("多次出现磁盘/权限错误，请检查输出目录。");
    }
}

/// `[1,2,3,5,7,8]` → `1-3,5,7-8`
fn compact(indices: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = indices.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
        ..LogOptions::default()
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compacts_index_runs() {
        assert_eq!(compact(&[1, 2, 3, 5, 7, 8]), "1-3,5,7-8");
        assert_eq!(compact(&[]), "");
    }

    #[test]
    fn proxy_flag_selects_mode() {
        let cli = Cli::parse_from(["ting-mirror", "https://x", "--proxy", "127.0.0.1:7890"]);
        let mut cfg = Config::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.proxy_mode, "fixed");
        assert_eq!(cfg.proxy_address, "127.0.0.1:7890");

        let cli = Cli::parse_from(["ting-mirror", "https://x", "--proxy", "AUTO", "-j", "5"]);
        let mut cfg = Config::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.proxy_mode, "auto");
        assert_eq!(cfg.max_workers, 5);
    }
}
