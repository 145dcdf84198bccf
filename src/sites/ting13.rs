//! ting13.cc：目录页分页抓取，播放页需要浏览器渲染后截获音频地址。

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use scraper::Html;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::html::{self, absolutize};
use super::{SiteAdapter, SiteContext, SiteError, UrlKind, is_plausible_media_url};
use crate::download::models::{BookMetadata, EpisodeRef, MediaLocator};
use crate::network::http::MOBILE_UA;
use crate::render::{RenderRequest, RenderedPage};

const BASE_URL: &str = "https://www.ting13.cc";
const DESKTOP_HOST: &str = "www.ting13.cc";
const MOBILE_HOST: &str = "m.ting13.cc";

const TRUSTED_HOSTS: [&str; 3] = ["ysxs.top", "ting13.cc", "tingchina.com"];
const BLACKLISTED_HOSTS: [&str; 13] = [
    "xmcdn.com",
    "ximalaya.com",
    "qtfm.cn",
    "lrts.me",
    "kaolafm.net",
    "kugou.com",
    "kuwo.cn",
    "163.com",
    "qqmusic.qq.com",
    "douyin.com",
    "bytedance",
    "googlesyndication",
    "googleads",
];
const AUDIO_MARKERS: [&str; 5] = [".mp3", ".m4a", ".aac", ".wav", ".ogg"];
const JSON_KEYS: [&str; 7] = ["audioUrl", "mp3", "m4a", "url", "audio_url", "src", "play_url"];
const CHALLENGE_SELECTOR: &str = ".geetest, #captcha, .slider, #slider";
const AUDIO_PROBE_JS: &str = r#"(() => {
    const a = document.querySelector('audio');
    if (a && (a.currentSrc || a.src)) return a.currentSrc || a.src;
    const s = document.querySelector('audio source');
    return s && s.src ? s.src : null;
})()"#;
const RENDER_ROUNDS: usize = 2;

fn play_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/play/(\d+)_").expect("static regex"))
}

fn page_no_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"page=(\d+)").expect("static regex"))
}

fn title_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*(有声小说|在线收听|全集).*$").expect("static regex"))
}

pub struct Ting13;

pub fn desktop_url(url: &str) -> String {
    url.replace(MOBILE_HOST, DESKTOP_HOST)
}

pub fn mobile_url(url: &str) -> String {
    url.replace(DESKTOP_HOST, MOBILE_HOST)
}

/// 播放页地址换成所属书页；书页原样返回。
pub fn book_url_for(url: &str) -> String {
    match play_id_re().captures(url).and_then(|c| c.get(1)) {
        Some(id) => format!("{BASE_URL}/youshengxiaoshuo/{}/", id.as_str()),
        None => desktop_url(url),
    }
}

pub fn clean_title(raw: &str) -> String {
    title_suffix_re().replace(raw.trim(), "").trim().to_string()
}

/// 目录页中的分页链接，统一改成升序并按页码排列。
pub fn catalog_page_urls(doc: &Html, catalog_url: &str) -> Vec<String> {
    let mut pages: Vec<String> = Vec::new();
    for (href, _) in html::links(doc, "a") {
        if !(href.contains("page=") && href.contains("sort=")) {
            continue;
        }
        let Some(full) = absolutize(catalog_url, &href) else {
            continue;
        };
        let full = full.replace("sort=desc", "sort=asc");
        if !pages.contains(&full) {
            pages.push(full);
        }
    }
    if pages.is_empty() {
        pages.push(format!("{catalog_url}?page=1&sort=asc"));
    }
    let page_no = |u: &str| -> u32 {
        page_no_re()
            .captures(u)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    pages.sort_by_key(|u| page_no(u));
    pages
}

/// 逐页收集目录。与目录地址完全相同的分页直接复用已取到的 `first`；
/// 不带排序参数的目录首页默认顺序不可靠，仍按 `sort=asc` 重新取。
pub fn collect_catalog(
    first: &str,
    catalog_url: &str,
    base: &str,
    mut fetch: impl FnMut(&str) -> Result<String, SiteError>,
) -> Result<Vec<EpisodeRef>, SiteError> {
    let pages = catalog_page_urls(&html::parse(first), catalog_url);
    info!(target: "site", pages = pages.len(), "ting13 catalog pages");
    let mut seen = HashSet::new();
    let mut episodes = Vec::new();
    for page in pages {
        if page == catalog_url {
            collect_play_links(&html::parse(first), base, &mut seen, &mut episodes);
            continue;
        }
        let body = fetch(&page)?;
        collect_play_links(&html::parse(&body), base, &mut seen, &mut episodes);
    }
    Ok(episodes)
}

/// 收集播放链接，跳过重复和“立即收听”，集号按出现顺序递增。
pub fn collect_play_links(
    doc: &Html,
    base: &str,
    seen: &mut HashSet<String>,
    out: &mut Vec<EpisodeRef>,
) {
    for (href, title) in html::links(doc, "a[href*='/play/']") {
        if !seen.insert(href.clone()) {
            continue;
        }
        if title.is_empty() || title == "立即收听" {
            continue;
        }
        let Some(full) = absolutize(base, &href) else {
            continue;
        };
        out.push(EpisodeRef {
            index: out.len() as u32 + 1,
            title,
            url: desktop_url(&full),
        });
    }
}

fn is_trusted(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    TRUSTED_HOSTS.iter().any(|h| lower.contains(h))
}

fn is_blacklisted(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    BLACKLISTED_HOSTS.iter().any(|h| lower.contains(h))
}

fn normalize_candidate(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let url = if let Some(rest) = raw.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        raw.to_string()
    };
    is_plausible_media_url(&url).then_some(url)
}

fn json_candidates(body: &str, out: &mut Vec<String>) {
    if !(body.contains("mp3") || body.contains("m4a") || body.contains("audioUrl")) {
        return;
    }
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return;
    };
    let scopes = [Some(&value), value.get("data")];
    for scope in scopes.into_iter().flatten() {
        for key in JSON_KEYS {
            if let Some(s) = scope.get(key).and_then(|v| v.as_str())
                && (s.starts_with("http") || s.starts_with("//"))
                && let Some(url) = normalize_candidate(s)
            {
                out.push(url);
            }
        }
    }
}

/// 从截获的响应和 DOM 中收集音频候选，保持发现顺序。
pub fn collect_candidates(page: &RenderedPage) -> Vec<String> {
    let mut out = Vec::new();
    for resp in &page.responses {
        if let Some(body) = &resp.body {
            json_candidates(body, &mut out);
        }
        let lower = resp.url.to_ascii_lowercase();
        if resp.url.starts_with("http")
            && AUDIO_MARKERS.iter().any(|m| lower.contains(m))
            && let Some(url) = normalize_candidate(&resp.url)
        {
            out.push(url);
        }
    }
    for v in &page.dom_values {
        if let Some(url) = normalize_candidate(v) {
            out.push(url);
        }
    }
    let mut seen = HashSet::new();
    out.retain(|u| seen.insert(u.clone()));
    out
}

/// 去掉黑名单后优先可信站点，同组内优先 mp3。
pub fn pick_best(candidates: &[String]) -> Option<String> {
    let clean: Vec<&String> = candidates.iter().filter(|u| !is_blacklisted(u)).collect();
    let trusted: Vec<&String> = clean.iter().copied().filter(|u| is_trusted(u)).collect();
    for pool in [&trusted, &clean] {
        if let Some(mp3) = pool.iter().find(|u| u.to_ascii_lowercase().contains(".mp3")) {
            return Some((*mp3).clone());
        }
        if let Some(first) = pool.first() {
            return Some((*first).clone());
        }
    }
    None
}

fn has_trusted_media(page: &RenderedPage) -> bool {
    pick_best(&collect_candidates(page)).is_some_and(|u| is_trusted(&u))
}

impl Ting13 {
    fn fetch(&self, ctx: &SiteContext<'_>, url: &str) -> Result<String, SiteError> {
        let referer = format!("{BASE_URL}/");
        ctx.http
            .get_text(&ctx.identity, url, Some(&referer))
            .map_err(SiteError::book_page)
    }

    /// 书页先试桌面站再试移动站。
    fn fetch_book_page(&self, ctx: &SiteContext<'_>, url: &str) -> Result<(String, String), SiteError> {
        let desktop = desktop_url(url);
        let mobile = mobile_url(&desktop);
        let mut last = None;
        for candidate in [desktop, mobile] {
            match self.fetch(ctx, &candidate) {
                Ok(body) => return Ok((candidate, body)),
                Err(e) => {
                    debug!(target: "site", url = %candidate, "book page fetch failed: {e}");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| SiteError::Network(format!("book page unavailable: {url}"))))
    }

    fn find_catalog_url(
        &self,
        ctx: &SiteContext<'_>,
        doc: &Html,
        page_url: &str,
    ) -> Result<Option<String>, SiteError> {
        for (href, text) in html::links(doc, "a[href*='/tingdirs/']") {
            if text.contains("章节") || text.contains("目录") {
                return Ok(absolutize(page_url, &href));
            }
        }
        let more: Vec<String> = html::links(doc, "a")
            .into_iter()
            .filter(|(_, t)| t.contains("全部章节") || t.contains("更多章节"))
            .filter_map(|(h, _)| absolutize(page_url, &h))
            .collect();
        for dir_url in more {
            let body = self.fetch(ctx, &dir_url)?;
            let dir_doc = html::parse(&body);
            for (href, text) in html::links(&dir_doc, "a[href*='/tingdirs/']") {
                if text.contains("章节") || text.contains("目录") {
                    return Ok(absolutize(page_url, &href));
                }
            }
            if html::links(&dir_doc, "a")
                .iter()
                .any(|(h, _)| h.contains("page=") && h.contains("sort="))
            {
                return Ok(Some(dir_url));
            }
        }
        Ok(None)
    }
}

impl SiteAdapter for Ting13 {
    fn name(&self) -> &'static str {
        "ting13"
    }

    fn base_url(&self) -> &str {
        BASE_URL
    }

    fn classify_url(&self, url: &str) -> UrlKind {
        if url.contains("/play/") {
            UrlKind::Episode
        } else if url.contains("/youshengxiaoshuo/") || url.contains("/book/") {
            UrlKind::Book
        } else {
            UrlKind::Unknown
        }
    }

    fn resolve_book(&self, ctx: &SiteContext<'_>, url: &str) -> Result<BookMetadata, SiteError> {
        let book_url = book_url_for(url);
        let (page_url, body) = self.fetch_book_page(ctx, &book_url)?;

        let (title, author, cover_url, catalog_or_links) = {
            let doc = html::parse(&body);
            let title = html::first_text(&doc, &["h1", ".title", "title"])
                .map(|t| clean_title(&t))
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    super::ResolutionError::Structure(format!("no title on {page_url}"))
                })?;
            let author = html::first_text(&doc, &[".author"])
                .or_else(|| html::meta_content(&doc, "og:music:artist"));
            let cover = html::first_attr(&doc, &["img.cover", ".bookcover img"], "src")
                .or_else(|| html::meta_content(&doc, "og:image"))
                .and_then(|c| absolutize(&page_url, &c));
            let catalog = self.find_catalog_url(ctx, &doc, &page_url)?;
            let mut inline = Vec::new();
            if catalog.is_none() {
                collect_play_links(&doc, &page_url, &mut HashSet::new(), &mut inline);
            }
            (title, author, cover, catalog.ok_or(inline))
        };

        let episodes = match catalog_or_links {
            Err(inline) => inline,
            Ok(catalog_url) => {
                let first = self.fetch(ctx, &catalog_url)?;
                collect_catalog(&first, &catalog_url, &page_url, |page| {
                    if ctx.stopped() {
                        return Err(SiteError::Cancelled);
                    }
                    self.fetch(ctx, page)
                })?
            }
        };

        Ok(BookMetadata {
            title,
            source_url: page_url,
            site: self.name().to_string(),
            author,
            cover_url,
            episodes,
        })
    }

    fn resolve_episode(
        &self,
        ctx: &SiteContext<'_>,
        episode: &EpisodeRef,
    ) -> Result<MediaLocator, SiteError> {
        let pool = ctx.sessions()?;
        let settle = Duration::from_secs(4);
        let media_wait = ctx
            .config
            .render_timeout()
            .saturating_sub(Duration::from_secs(10))
            .min(Duration::from_secs(45));
        let req = RenderRequest {
            user_agent: Some(MOBILE_UA.to_string()),
            viewport: Some((375, 812)),
            settle,
            media_wait,
            dom_probe: Some(AUDIO_PROBE_JS.to_string()),
            challenge_selector: Some(CHALLENGE_SELECTOR.to_string()),
            done: Some(has_trusted_media),
            ..RenderRequest::new(mobile_url(&episode.url))
        };

        let mut challenged = false;
        for round in 0..RENDER_ROUNDS {
            if ctx.stopped() {
                return Err(SiteError::Cancelled);
            }
            let page = {
                let mut lease = pool.checkout(&ctx.identity, ctx.stop)?;
                lease.render(&req)?
            };
            let candidates = collect_candidates(&page);
            if let Some(best) = pick_best(&candidates) {
                debug!(target: "site", index = episode.index, url = %best, "media located");
                return Ok(MediaLocator::direct(best).with_referer(format!("https://{MOBILE_HOST}/")));
            }
            if !page.challenge {
                break;
            }
            challenged = true;
            warn!(target: "challenge", index = episode.index, round, "interstitial detected on play page");
        }

        if challenged {
            Err(SiteError::ChallengeUnsolved(format!(
                "interstitial persisted on {}",
                episode.url
            )))
        } else {
            Err(SiteError::MediaNotFound(episode.url.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::CapturedResponse;

    #[test]
    fn urls_are_classified_and_mapped_to_book() {
        let t = Ting13;
        assert_eq!(t.classify_url("https://www.ting13.cc/play/123_4_567.html"), UrlKind::Episode);
        assert_eq!(t.classify_url("https://m.ting13.cc/youshengxiaoshuo/123/"), UrlKind::Book);
        assert_eq!(t.classify_url("https://www.ting13.cc/"), UrlKind::Unknown);
        assert_eq!(
            book_url_for("https://m.ting13.cc/play/123_4_567.html"),
            "https://www.ting13.cc/youshengxiaoshuo/123/"
        );
        assert_eq!(clean_title("凡人修仙传有声小说在线收听"), "凡人修仙传");
    }

    #[test]
    fn catalog_pages_sorted_ascending() {
        let doc = html::parse(
            r#"<a href="/tingdirs/9/?page=3&sort=desc">3</a>
               <a href="/tingdirs/9/?page=1&sort=desc">1</a>
               <a href="/tingdirs/9/?page=2&sort=asc">2</a>
               <a href="/tingdirs/9/?page=1&sort=asc">1</a>"#,
        );
        let pages = catalog_page_urls(&doc, "https://www.ting13.cc/tingdirs/9/");
        assert_eq!(
            pages,
            vec![
                "https://www.ting13.cc/tingdirs/9/?page=1&sort=asc",
                "https://www.ting13.cc/tingdirs/9/?page=2&sort=asc",
                "https://www.ting13.cc/tingdirs/9/?page=3&sort=asc",
            ]
        );
        let empty = catalog_page_urls(&html::parse("<p></p>"), "https://www.ting13.cc/tingdirs/9/");
        assert_eq!(empty, vec!["https://www.ting13.cc/tingdirs/9/?page=1&sort=asc"]);
    }

    #[test]
    fn catalog_page_already_fetched_is_reused() {
        let catalog = "https://www.ting13.cc/tingdirs/9/?page=1&sort=asc";
        let first = r#"<a href="/tingdirs/9/?page=1&sort=asc">1</a>
            <a href="/tingdirs/9/?page=2&sort=asc">2</a>
            <a href="/play/9_1_1.html">第1集</a>"#;
        let mut fetched = Vec::new();
        let eps = collect_catalog(first, catalog, "https://www.ting13.cc/youshengxiaoshuo/9/", |page| {
            fetched.push(page.to_string());
            Ok(r#"<a href="/play/9_2_1.html">第2集</a>"#.to_string())
        })
        .unwrap();
        assert_eq!(fetched, vec!["https://www.ting13.cc/tingdirs/9/?page=2&sort=asc"]);
        let titles: Vec<&str> = eps.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["第1集", "第2集"]);
        assert_eq!(eps[1].index, 2);
    }

    #[test]
    fn play_links_skip_duplicates_and_listen_buttons() {
        let doc = html::parse(
            r#"<a href="https://m.ting13.cc/play/9_1_1.html">立即收听</a>
               <a href="/play/9_1_1.html">第1集</a>
               <a href="/play/9_2_1.html">第2集</a>
               <a href="/play/9_2_1.html">第2集</a>
               <a href="/play/9_3_1.html">第3集</a>"#,
        );
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        collect_play_links(&doc, "https://www.ting13.cc/tingdirs/9/", &mut seen, &mut out);
        let got: Vec<(u32, &str)> = out.iter().map(|e| (e.index, e.title.as_str())).collect();
        assert_eq!(got, vec![(1, "第1集"), (2, "第2集"), (3, "第3集")]);
        assert!(out[0].url.starts_with("https://www.ting13.cc/play/"));
    }

    #[test]
    fn candidates_prefer_trusted_mp3_and_drop_blacklist() {
        let page = RenderedPage {
            responses: vec![
                CapturedResponse {
                    url: "https://fdfs.xmcdn.com/a.m4a".into(),
                    mime: "audio/mp4".into(),
                    status: 200,
                    body: None,
                },
                CapturedResponse {
                    url: "https://www.ting13.cc/api/play".into(),
                    mime: "application/json".into(),
                    status: 200,
                    body: Some(r#"{"audioUrl":"//a.ysxs.top/x/1.m4a"}"#.into()),
                },
                CapturedResponse {
                    url: "https://www.ting13.cc/PTaudio.php?id=1".into(),
                    mime: "text/html".into(),
                    status: 200,
                    body: None,
                },
            ],
            dom_values: vec!["https://a.ysxs.top/x/1.mp3".into()],
            ..RenderedPage::default()
        };
        let cands = collect_candidates(&page);
        assert!(!cands.iter().any(|c| c.contains("PTaudio")));
        assert_eq!(pick_best(&cands).as_deref(), Some("https://a.ysxs.top/x/1.mp3"));
        assert!(has_trusted_media(&page));
        assert_eq!(pick_best(&["https://ximalaya.com/a.mp3".to_string()]), None);
    }
}
