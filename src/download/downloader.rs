//! 引擎入口：`plan` 解析书籍并生成任务表，`run` 执行任务表并写出运行摘要。

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use super::coordinator::{Coordinator, effective_rotate_every};
use super::fetch::{HttpMediaFetcher, MediaFetcher};
use super::layout::{IntegrityCheck, IntegrityMode};
use super::models::{DownloadPlan, EpisodeRange, EventSink, RunSummary};
use super::plan::{plan_resume, resolve_book};
use super::record::{DownloadRecord, SUMMARY_FILE, write_atomic};
use super::worker::WorkerShared;
use crate::base_system::book_paths::book_folder_path;
use crate::base_system::config::ConfigSpec;
use crate::base_system::context::Config;
use crate::base_system::cooldown_retry::Backoff;
use crate::base_system::file_cleaner::remove_stale_parts;
use crate::challenge::SliderSolver;
use crate::network::http::HttpClients;
use crate::network::identity::IdentityManager;
use crate::render::chrome::ChromeFactory;
use crate::render::{SessionFactory, SessionPool};
use crate::sites::{SiteAdapter, SiteContext, SiteRegistry};

/// 可跨线程持有的中止开关（Ctrl+C 处理器里用）。
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!(target: "download", "abort requested");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct Engine {
    config: Arc<Config>,
    registry: SiteRegistry,
    identity: Arc<IdentityManager>,
    fetcher: Arc<dyn MediaFetcher>,
    http: Arc<HttpClients>,
    sessions: Option<Arc<SessionPool>>,
    solver: SliderSolver,
    abort: Arc<AtomicBool>,
}

impl Engine {
    /// 带浏览器渲染的完整引擎。
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow!("invalid config: {e}"))?;
        let factory = ChromeFactory::new(&config).context("failed to start render runtime")?;
        let identity = Arc::new(IdentityManager::from_config(&config));
        let http = Arc::new(HttpClients::new(&config));
        let fetcher: Arc<dyn MediaFetcher> = Arc::new(HttpMediaFetcher::new(Arc::clone(&http)));
        let mut engine = Self::with_parts(config, SiteRegistry::with_defaults(), identity, fetcher);
        engine.http = http;
        Ok(engine.with_session_factory(Box::new(factory)))
    }

    /// 自行组装各部件；不带渲染会话，需要时用 `with_session_factory` 补上。
    pub fn with_parts(
        config: Config,
        registry: SiteRegistry,
        identity: Arc<IdentityManager>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        let http = Arc::new(HttpClients::new(&config));
        let solver = SliderSolver::new(config.challenge_threshold);
        Self {
            config: Arc::new(config),
            registry,
            identity,
            fetcher,
            http,
            sessions: None,
            solver,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_session_factory(mut self, factory: Box<dyn SessionFactory>) -> Self {
        self.sessions = Some(Arc::new(SessionPool::from_config(factory, &self.config)));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &IdentityManager {
        &self.identity
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: Arc::clone(&self.abort),
        }
    }

    fn context(&self) -> SiteContext<'_> {
        SiteContext {
            config: &self.config,
            identity: self.identity.snapshot(),
            http: &self.http,
            sessions: self.sessions.as_deref(),
            solver: &self.solver,
            stop: &self.abort,
        }
    }

    /// 解析书籍并对照磁盘生成任务表。解析失败对整个运行是致命的。
    pub fn plan(&self, url: &str, range: EpisodeRange, force: bool) -> Result<DownloadPlan> {
        let adapter = self
            .registry
            .select(url)
            .with_context(|| format!("no site adapter for {url}"))?;
        let ctx = self.context();
        let (book, omitted) = resolve_book(adapter.as_ref(), &ctx, url)
            .with_context(|| format!("failed to resolve book {url}"))?;

        let book_dir = book_folder_path(&self.config, &book.title);
        let record = DownloadRecord::load(&book_dir);
        let mode = IntegrityMode::parse(&self.config.integrity).unwrap_or(IntegrityMode::Signature);
        let check = IntegrityCheck {
            mode,
            min_bytes: self.config.min_audio_bytes,
            record: &record,
        };
        let resume = plan_resume(&book, &book_dir, range, force || self.config.force, &check);
        let omitted = omitted.into_iter().filter(|i| range.contains(*i)).collect();
        Ok(DownloadPlan {
            book,
            book_dir,
            tasks: resume.tasks,
            present: resume.present,
            omitted,
        })
    }

    /// 执行任务表。单集失败只进摘要；只有输出目录不可用这类环境问题才返回 Err。
    ///
    /// 中止请求只作用于当前这次运行：返回前清除中止标记，同一个引擎可以接着 `plan`/`run`。
    pub fn run(&self, plan: &DownloadPlan, sink: Option<EventSink>) -> Result<RunSummary> {
        let out = self.run_inner(plan, sink);
        self.abort.store(false, Ordering::SeqCst);
        out
    }

    fn run_inner(&self, plan: &DownloadPlan, sink: Option<EventSink>) -> Result<RunSummary> {
        let adapter = self
            .registry
            .select(&plan.book.source_url)
            .with_context(|| format!("no site adapter for {}", plan.book.source_url))?;
        let book_dir = &plan.book_dir;
        fs::create_dir_all(book_dir)
            .with_context(|| format!("cannot create output directory {}", book_dir.display()))?;
        match remove_stale_parts(book_dir) {
            Ok(0) => {}
            Ok(n) => debug!(target: "download", removed = n, "stale partial files removed"),
            Err(e) => warn!(target: "download", "could not scan for partial files: {e}"),
        }

        let mut record = DownloadRecord::load(book_dir);
        record.title = plan.book.title.clone();
        record.source = plan.book.source_url.clone();
        record
            .save(book_dir)
            .with_context(|| format!("cannot write to {}", book_dir.display()))?;

        if self.config.download_cover {
            self.download_cover(adapter.as_ref(), plan);
        }

        let shared = Arc::new(WorkerShared {
            config: Arc::clone(&self.config),
            adapter,
            fetcher: Arc::clone(&self.fetcher),
            http: Arc::clone(&self.http),
            sessions: self.sessions.clone(),
            solver: self.solver.clone(),
            book_dir: book_dir.clone(),
            backoff: Backoff::from_config(&self.config),
            interrupt: Arc::new(AtomicBool::new(false)),
        });
        let coordinator = Coordinator {
            shared,
            identity: &self.identity,
            workers: self.config.max_workers,
            rotate_every: effective_rotate_every(&self.config, &self.identity),
            abort: Arc::clone(&self.abort),
            grace: self.config.abort_grace(),
            env_error_threshold: self.config.env_error_threshold,
            abort_on_env_errors: self.config.abort_on_env_errors,
        };
        let outcome = coordinator.run(&plan.tasks, record, sink);

        let summary = RunSummary {
            book_title: plan.book.title.clone(),
            episodes: outcome.reports,
            skipped: plan.present.clone(),
            omitted: plan.omitted.clone(),
            not_started: outcome.not_started,
            rotations: outcome.rotations,
            rotation_degraded: outcome.rotation_degraded,
            aborted: outcome.aborted,
            abort_recommended: outcome.abort_recommended,
        };
        info!(
            target: "download",
            completed = summary.completed(),
            failed = summary.failed(),
            skipped = summary.skipped.len(),
            not_started = summary.not_started.len(),
            rotations = summary.rotations,
            "run finished"
        );
        write_summary(book_dir, &summary);
        Ok(summary)
    }

    /// 关闭所有渲染会话。
    pub fn shutdown(&self) {
        if let Some(pool) = &self.sessions {
            pool.shutdown();
        }
    }

    fn download_cover(&self, adapter: &dyn SiteAdapter, plan: &DownloadPlan) {
        let Some(url) = plan.book.cover_url.as_deref().filter(|u| !u.is_empty()) else {
            return;
        };
        if has_cover(&plan.book_dir) {
            return;
        }
        let identity = self.identity.snapshot();
        let bytes = match self.http.get_bytes(&identity, url, Some(adapter.base_url())) {
            Ok(b) => b,
            Err(e) => {
                warn!(target: "download", url, "cover download failed: {e}");
                return;
            }
        };
        let ext = match image::guess_format(&bytes) {
            Ok(image::ImageFormat::Png) => "png",
            Ok(image::ImageFormat::WebP) => "webp",
            Ok(image::ImageFormat::Gif) => "gif",
            Ok(_) => "jpg",
            Err(_) => {
                warn!(target: "download", url, "cover is not an image, skipped");
                return;
            }
        };
        let path = plan.book_dir.join(format!("cover.{ext}"));
        if let Err(e) = write_atomic(&path, &bytes) {
            warn!(target: "download", "failed to save cover: {e}");
        }
    }
}

fn has_cover(book_dir: &Path) -> bool {
    ["jpg", "png", "webp", "gif"]
        .iter()
        .any(|ext| book_dir.join(format!("cover.{ext}")).exists())
}

fn write_summary(book_dir: &Path, summary: &RunSummary) {
    let path = book_dir.join(SUMMARY_FILE);
    let written = serde_json::to_vec_pretty(summary)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        .and_then(|bytes| write_atomic(&path, &bytes));
    if let Err(e) = written {
        warn!(target: "download", path = %path.display(), "failed to write run summary: {e}");
    }
}
