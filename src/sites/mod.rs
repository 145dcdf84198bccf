//! 站点适配层：每个支持的网站一个 `SiteAdapter`，按 URL 正则选择。
//!
//! 子模块：
//! - `html`     — scraper 选择器与链接补全
//! - `ting13`   — ting13.cc（渲染播放页截获音频地址）
//! - `huanting` — huanting.cc / ting22.com（接口 + 滑块验证）

pub mod html;
pub mod huanting;
pub mod ting13;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use image::DynamicImage;
use regex::Regex;
use thiserror::Error;

use crate::base_system::context::Config;
use crate::challenge::{ChallengeError, SliderSolution, SliderSolver};
use crate::download::errors::{EpisodeError, ErrorKind, http_kind};
use crate::download::models::{BookMetadata, EpisodeRef, MediaLocator};
use crate::network::http::{HttpClients, HttpError};
use crate::network::identity::ProxyIdentity;
use crate::render::{RenderError, SessionPool};

/// 书籍级错误，对整次运行是致命的。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no site adapter for {0}")]
    Unsupported(String),
    #[error("book page not found: {0}")]
    NotFound(String),
    #[error("unexpected page structure: {0}")]
    Structure(String),
    #[error("invalid episode list: {0}")]
    InvalidEpisodes(String),
}

#[derive(Debug, Error)]
pub enum SiteError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("no media reference found: {0}")]
    MediaNotFound(String),
    #[error("challenge not solved: {0}")]
    ChallengeUnsolved(String),
    #[error("render timed out: {0}")]
    RenderTimeout(String),
    #[error("render failed: {0}")]
    Render(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("interrupted")]
    Cancelled,
}

impl SiteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SiteError::Resolution(_) => ErrorKind::Resolution,
            SiteError::MediaNotFound(_) => ErrorKind::MediaNotFound,
            SiteError::ChallengeUnsolved(_) => ErrorKind::ChallengeUnsolved,
            SiteError::RenderTimeout(_) => ErrorKind::RenderTimeout,
            SiteError::Render(_) | SiteError::Network(_) => ErrorKind::NetworkTransient,
            SiteError::Http(e) => http_kind(e),
            SiteError::RateLimited(_) => ErrorKind::RateLimited,
            SiteError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// 书页请求的 404/410 视为书不存在。
    pub fn book_page(err: HttpError) -> Self {
        match err {
            HttpError::NotFound { url, .. } => ResolutionError::NotFound(url).into(),
            other => SiteError::Http(other),
        }
    }
}

impl From<RenderError> for SiteError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Cancelled => SiteError::Cancelled,
            e if e.is_timeout() => SiteError::RenderTimeout(e.to_string()),
            e => SiteError::Render(e.to_string()),
        }
    }
}

impl From<SiteError> for EpisodeError {
    fn from(err: SiteError) -> Self {
        EpisodeError::new(err.kind(), err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    Book,
    Episode,
    Unknown,
}

/// 适配器调用时可用的共享设施。身份是派发时拿到的快照。
pub struct SiteContext<'a> {
    pub config: &'a Config,
    pub identity: Arc<ProxyIdentity>,
    pub http: &'a HttpClients,
    pub sessions: Option<&'a SessionPool>,
    pub solver: &'a SliderSolver,
    pub stop: &'a AtomicBool,
}

impl SiteContext<'_> {
    pub fn sessions(&self) -> Result<&SessionPool, SiteError> {
        self.sessions
            .ok_or_else(|| SiteError::Render("rendering is not available".into()))
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(std::sync::atomic::Ordering::Relaxed)
    }
}

pub trait SiteAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// 站点首页，用作 Referer。
    fn base_url(&self) -> &str;

    fn classify_url(&self, url: &str) -> UrlKind;

    fn resolve_book(&self, ctx: &SiteContext<'_>, url: &str) -> Result<BookMetadata, SiteError>;

    fn resolve_episode(
        &self,
        ctx: &SiteContext<'_>,
        episode: &EpisodeRef,
    ) -> Result<MediaLocator, SiteError>;

    fn solve_challenge(
        &self,
        ctx: &SiteContext<'_>,
        background: &DynamicImage,
        piece: &DynamicImage,
    ) -> Result<SliderSolution, SiteError> {
        ctx.solver.solve(background, piece).map_err(|e| match e {
            ChallengeError::Unsolvable { .. } => SiteError::ChallengeUnsolved(e.to_string()),
            other => SiteError::ChallengeUnsolved(format!("challenge assets unusable: {other}")),
        })
    }
}

pub struct SiteRegistry {
    adapters: Vec<(Regex, Arc<dyn SiteAdapter>)>,
}

impl Default for SiteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(r"(?i)ting13\.(cc|com)", Arc::new(ting13::Ting13));
        reg.register(
            r"(?i)huanting\.cc|ting22\.com",
            Arc::new(huanting::Huanting::new()),
        );
        reg
    }

    /// 注册适配器；模式非法时忽略。
    pub fn register(&mut self, pattern: &str, adapter: Arc<dyn SiteAdapter>) -> &mut Self {
        match Regex::new(pattern) {
            Ok(re) => self.adapters.push((re, adapter)),
            Err(e) => tracing::warn!(target: "site", pattern, "invalid site pattern: {e}"),
        }
        self
    }

    pub fn select(&self, url: &str) -> Result<Arc<dyn SiteAdapter>, ResolutionError> {
        self.adapters
            .iter()
            .find(|(re, _)| re.is_match(url))
            .map(|(_, a)| Arc::clone(a))
            .ok_or_else(|| ResolutionError::Unsupported(url.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|(_, a)| a.name()).collect()
    }
}

const PLAYER_PAGES: [&str; 3] = ["mtaudio.php", "ptaudio.php", "ptaudio2.php"];
const PAGE_EXTS: [&str; 4] = [".php", ".html", ".htm", ".js"];

/// 排除播放器页面和普通网页，剩下的才可能是音频地址。
pub fn is_plausible_media_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return false;
    }
    let path = lower.split(['?', '#']).next().unwrap_or("");
    if PLAYER_PAGES.iter().any(|p| path.ends_with(p)) {
        return false;
    }
    !PAGE_EXTS.iter().any(|ext| path.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_selects_by_url() {
        let reg = SiteRegistry::with_defaults();
        assert_eq!(
            reg.select("https://www.ting13.cc/youshengxiaoshuo/123/").unwrap().name(),
            "ting13"
        );
        assert_eq!(
            reg.select("https://m.ting22.com/book/55.html").unwrap().name(),
            "huanting"
        );
        assert!(matches!(
            reg.select("https://example.com/book/1"),
            Err(ResolutionError::Unsupported(_))
        ));
    }

    #[test]
    fn player_pages_are_not_media() {
        assert!(is_plausible_media_url("https://a.ysxs.top/x/001.mp3?t=1"));
        assert!(is_plausible_media_url("https://cdn.example.com/stream/abc"));
        assert!(!is_plausible_media_url("https://www.ting13.cc/PTaudio.php?id=3"));
        assert!(!is_plausible_media_url("https://www.ting13.cc/play/1_2_3.html"));
        assert!(!is_plausible_media_url("/relative/a.mp3"));
    }

    #[test]
    fn site_errors_keep_their_class() {
        assert_eq!(
            SiteError::from(RenderError::Timeout(std::time::Duration::from_secs(1))).kind(),
            ErrorKind::RenderTimeout
        );
        assert_eq!(
            SiteError::book_page(HttpError::NotFound {
                status: 404,
                url: "u".into()
            })
            .kind(),
            ErrorKind::Resolution
        );
        assert_eq!(
            SiteError::Http(HttpError::Server {
                status: 502,
                url: "u".into()
            })
            .kind(),
            ErrorKind::NetworkTransient
        );
        assert!(ErrorKind::ChallengeUnsolved.is_transient());
    }
}
