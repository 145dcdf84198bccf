//! huanting.cc（ting22.com）：分页目录 + `apiP2.php` 接口；
//! 接口拒绝时在播放页完成滑块验证，拿到的 cookie 与身份版本绑定。

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use image::DynamicImage;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, REFERER, USER_AGENT};
use reqwest::redirect::Policy;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::html::{self, absolutize};
use super::{ResolutionError, SiteAdapter, SiteContext, SiteError, UrlKind};
use crate::challenge::{decode_slice_map, reconstruct};
use crate::download::models::{BookMetadata, EpisodeRef, MediaLocator};
use crate::network::http::{HttpError, check_status, random_ua};

const BASE_URL: &str = "https://www.huanting.cc";
/// 同一份验证 cookie 最多使用的次数，之后主动刷新。
pub const COOKIE_REFRESH_USES: usize = 40;
const SUBMIT_OFFSETS: [i64; 5] = [0, -2, 2, -4, 4];

fn book_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/book/(\d+)").expect("static regex"))
}

fn play_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/ting/(\d+)-(\d+)\.html").expect("static regex"))
}

fn data2_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#",\s*Data2\s*=\s*"([^"]+)""#).expect("static regex"))
}

fn sign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"sign\s*:\s*"([a-f0-9]{32})""#).expect("static regex"))
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"time\s*:\s*"(\d{10})""#).expect("static regex"))
}

fn data_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bData\s*=\s*\{").expect("static regex"))
}

/// 统一成 `https://www.huanting.cc/...`；播放页换成书页。
pub fn normalize_book_url(raw: &str) -> String {
    let mut url = raw.trim().replace("ting22.com", "huanting.cc");
    if !url.starts_with("http") {
        url = format!("https://{url}");
    }
    url = url
        .replace("://m.huanting.cc", "://www.huanting.cc")
        .replace("://huanting.cc", "://www.huanting.cc");
    if let Some(c) = play_re().captures(&url)
        && let Some(id) = c.get(1)
    {
        return format!("{BASE_URL}/book/{}.html", id.as_str());
    }
    url
}

pub fn book_id(url: &str) -> Option<String> {
    book_id_re()
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `/ting/<book>-<n>.html` 中的 `(book, n)`。
pub fn play_ids(url: &str) -> Option<(String, u32)> {
    let c = play_re().captures(url)?;
    let n = c.get(2)?.as_str().parse().ok()?;
    Some((c.get(1)?.as_str().to_string(), n))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiReply {
    Media(String),
    RateLimited,
    /// `state != success`：需要先过滑块验证。
    ChallengeRequired,
    /// 成功但 `playlist.src` 无法使用。
    Unusable,
}

pub fn parse_api_response(text: &str) -> ApiReply {
    let text = text.trim();
    if text.starts_with('<') || text.contains("频繁") || text.contains("受限") {
        return ApiReply::RateLimited;
    }
    let Ok(data) = serde_json::from_str::<Value>(text) else {
        return ApiReply::ChallengeRequired;
    };
    let state_ok = data.get("state").and_then(|v| v.as_str()) == Some("success");
    let status_ok = match data.get("status") {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "1",
        _ => false,
    };
    if !state_ok || !status_ok {
        return ApiReply::ChallengeRequired;
    }
    let src = data
        .get("playlist")
        .and_then(|p| p.get("src"))
        .and_then(|s| s.as_str())
        .unwrap_or("");
    let decoded = B64
        .decode(src.trim())
        .ok()
        .and_then(|b| String::from_utf8(b).ok());
    match decoded {
        Some(url) if url.starts_with("http") || url.contains('$') => ApiReply::Media(url),
        _ => ApiReply::Unusable,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePage {
    pub bg_url: String,
    pub piece_url: String,
    pub slice_map: Option<String>,
    pub sign: String,
    pub time: String,
}

/// 从 `start` 处的 `{` 开始按括号配对截出 JSON 对象。
fn balanced_object(src: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    for (i, b) in src.bytes().enumerate().skip(start).take(3000) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return src.get(start..=i);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn parse_challenge_page(page: &str) -> Option<ChallengePage> {
    let m = data_re().find(page)?;
    let raw = balanced_object(page, m.end() - 1)?;
    let data: Value = serde_json::from_str(&raw.replace("\\/", "/")).ok()?;
    let bg = data.get("bg_pic")?.as_str()?;
    let piece = data.get("ico_pic")?.get("url")?.as_str()?;
    if bg.is_empty() || piece.is_empty() {
        return None;
    }
    let cap = |re: &Regex| {
        re.captures(page)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };
    Some(ChallengePage {
        bg_url: absolutize(BASE_URL, bg)?,
        piece_url: absolutize(BASE_URL, piece)?,
        slice_map: cap(data2_re()),
        sign: cap(sign_re())?,
        time: cap(time_re())?,
    })
}

#[derive(Debug, Clone)]
struct CookieGrant {
    version: u64,
    header: String,
    uses: usize,
    play_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum GrantCheck {
    Absent,
    /// 身份轮换后作废。
    Stale,
    /// 使用次数到达上限，需要刷新。
    Exhausted(String),
    Usable(String),
}

fn check_grant(grant: Option<&CookieGrant>, version: u64) -> GrantCheck {
    match grant {
        None => GrantCheck::Absent,
        Some(g) if g.version != version => GrantCheck::Stale,
        Some(g) if g.uses >= COOKIE_REFRESH_USES => GrantCheck::Exhausted(g.play_url.clone()),
        Some(g) => GrantCheck::Usable(g.header.clone()),
    }
}

enum Attempt {
    Passed(String),
    Failed(String),
}

pub struct Huanting {
    grant: Mutex<Option<CookieGrant>>,
    /// 同一时间只有一个 worker 在过验证。
    solving: Mutex<()>,
}

impl Default for Huanting {
    fn default() -> Self {
        Self::new()
    }
}

impl Huanting {
    pub fn new() -> Self {
        Self {
            grant: Mutex::new(None),
            solving: Mutex::new(()),
        }
    }

    fn grant(&self) -> MutexGuard<'_, Option<CookieGrant>> {
        match self.grant.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current_cookie(&self, version: u64) -> GrantCheck {
        let mut guard = self.grant();
        let check = check_grant(guard.as_ref(), version);
        if check == GrantCheck::Stale {
            info!(target: "challenge", "identity changed, discarding verification cookie");
            *guard = None;
        }
        check
    }

    fn store_grant(&self, version: u64, header: String, play_url: &str) {
        *self.grant() = Some(CookieGrant {
            version,
            header,
            uses: 0,
            play_url: play_url.to_string(),
        });
    }

    fn count_use(&self, version: u64) {
        if let Some(g) = self.grant().as_mut()
            && g.version == version
        {
            g.uses += 1;
        }
    }

    fn call_api(
        &self,
        ctx: &SiteContext<'_>,
        book: &str,
        pid: u32,
        cookie: Option<&str>,
    ) -> Result<ApiReply, SiteError> {
        let url = format!("{BASE_URL}/apiP2.php?id={book}&pid={pid}");
        let client = ctx.http.client(&ctx.identity)?;
        let mut req = client
            .get(&url)
            .header(USER_AGENT, random_ua())
            .header(REFERER, format!("{BASE_URL}/"));
        if let Some(c) = cookie.filter(|c| !c.is_empty()) {
            req = req.header(COOKIE, c);
        }
        let resp = check_status(req.send().map_err(HttpError::from)?)?;
        let body = resp.text().map_err(HttpError::from)?;
        Ok(parse_api_response(&body))
    }

    /// 反复尝试过验证，成功后返回 Cookie 头。
    fn solve_for(&self, ctx: &SiteContext<'_>, play_url: &str) -> Result<String, SiteError> {
        let attempts = ctx.config.challenge_attempts.max(1);
        let mut last = String::from("no attempt made");
        for attempt in 1..=attempts {
            if ctx.stop.load(Ordering::Relaxed) {
                return Err(SiteError::Cancelled);
            }
            match self.solve_once(ctx, play_url)? {
                Attempt::Passed(header) => {
                    info!(target: "challenge", attempt, identity = %ctx.identity.label(), "slider verification passed");
                    return Ok(header);
                }
                Attempt::Failed(reason) => {
                    debug!(target: "challenge", attempt, attempts, "verification attempt failed: {reason}");
                    last = reason;
                }
            }
        }
        Err(SiteError::ChallengeUnsolved(format!(
            "{attempts} attempts failed, last: {last}"
        )))
    }

    fn captcha_client(&self, ctx: &SiteContext<'_>, jar: &Arc<Jar>) -> Result<Client, SiteError> {
        let mut headers = HeaderMap::new();
        for (k, v) in [
            ("upgrade-insecure-requests", "1"),
            ("sec-fetch-dest", "document"),
            ("sec-fetch-mode", "navigate"),
            ("sec-fetch-site", "same-origin"),
            ("sec-fetch-user", "?1"),
        ] {
            headers.insert(k, HeaderValue::from_static(v));
        }
        ctx.http
            .builder(&ctx.identity, random_ua())?
            .default_headers(headers)
            .cookie_provider(Arc::clone(jar))
            .redirect(Policy::none())
            .build()
            .map_err(|e| SiteError::Http(HttpError::Build(e.to_string())))
    }

    fn solve_once(&self, ctx: &SiteContext<'_>, play_url: &str) -> Result<Attempt, SiteError> {
        let jar = Arc::new(Jar::default());
        let client = self.captcha_client(ctx, &jar)?;
        let cookie_header = || -> String {
            Url::parse(BASE_URL)
                .ok()
                .and_then(|u| jar.cookies(&u))
                .and_then(|h| h.to_str().ok().map(str::to_string))
                .unwrap_or_default()
        };

        // 先访问书页建立会话 cookie
        let book_url = normalize_book_url(play_url);
        let referer = match client.get(&book_url).send() {
            Ok(r) if r.status().is_success() => book_url,
            _ => format!("{BASE_URL}/"),
        };

        let resp = match client.get(play_url).header(REFERER, referer).send() {
            Ok(r) => r,
            Err(e) => return Ok(Attempt::Failed(format!("play page: {e}"))),
        };
        if resp.status().is_redirection() {
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Ok(Attempt::Failed(format!("redirected to {location}")));
        }
        if !resp.status().is_success() {
            return Ok(Attempt::Failed(format!("play page status {}", resp.status())));
        }
        let page = resp.text().map_err(HttpError::from)?;
        if page.contains("频繁") || page.contains("受限") {
            return Err(SiteError::RateLimited(play_url.to_string()));
        }
        if page.contains("PTingJplayer") && !page.contains("bg_pic") {
            return Ok(Attempt::Passed(cookie_header()));
        }
        let Some(challenge) = parse_challenge_page(&page) else {
            return Ok(Attempt::Failed("challenge data missing from page".into()));
        };

        let load = |url: &str| -> Result<DynamicImage, String> {
            let bytes = client
                .get(url)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes())
                .map_err(|e| e.to_string())?;
            image::load_from_memory(&bytes).map_err(|e| e.to_string())
        };
        let (bg, piece) = match (load(&challenge.bg_url), load(&challenge.piece_url)) {
            (Ok(b), Ok(p)) => (b, p),
            (Err(e), _) | (_, Err(e)) => return Ok(Attempt::Failed(format!("image: {e}"))),
        };
        let bg = match challenge.slice_map.as_deref().map(decode_slice_map) {
            Some(Ok(map)) => DynamicImage::ImageRgba8(reconstruct(&bg, &map)),
            Some(Err(e)) => return Ok(Attempt::Failed(e.to_string())),
            None => bg,
        };
        let solution = match self.solve_challenge(ctx, &bg, &piece) {
            Ok(s) => s,
            Err(e) => return Ok(Attempt::Failed(e.to_string())),
        };

        for off in SUBMIT_OFFSETS {
            let x = (i64::from(solution.x) + off).max(0);
            let form = [
                ("point", x.to_string()),
                ("sign", challenge.sign.clone()),
                ("time", challenge.time.clone()),
            ];
            let reply = client
                .post(play_url)
                .form(&form)
                .send()
                .and_then(|r| r.json::<Value>());
            let state = match reply {
                Ok(v) => v.get("state").and_then(|s| s.as_i64()),
                Err(e) => {
                    debug!(target: "challenge", x, "submit failed: {e}");
                    continue;
                }
            };
            match state {
                Some(0) => return Ok(Attempt::Passed(cookie_header())),
                Some(4602) | Some(4603) => {
                    return Ok(Attempt::Failed(format!("verification session expired ({state:?})")));
                }
                _ => {}
            }
        }
        Ok(Attempt::Failed(format!("offset {} rejected", solution.x)))
    }

    /// 过一次验证换取新 cookie。`rejected` 是接口刚拒绝过的 cookie。
    fn refresh_cookie(
        &self,
        ctx: &SiteContext<'_>,
        play_url: &str,
        rejected: Option<&str>,
    ) -> Result<String, SiteError> {
        let _solving = match self.solving.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        // 等锁期间可能已有别的 worker 刷新过
        if let GrantCheck::Usable(header) = self.current_cookie(ctx.identity.version)
            && rejected != Some(header.as_str())
        {
            return Ok(header);
        }
        let header = self.solve_for(ctx, play_url)?;
        self.store_grant(ctx.identity.version, header.clone(), play_url);
        Ok(header)
    }

    fn media_from(&self, ctx: &SiteContext<'_>, url: String) -> MediaLocator {
        self.count_use(ctx.identity.version);
        MediaLocator::direct(url).with_referer(format!("{BASE_URL}/"))
    }
}

impl SiteAdapter for Huanting {
    fn name(&self) -> &'static str {
        "huanting"
    }

    fn base_url(&self) -> &str {
        BASE_URL
    }

    fn classify_url(&self, url: &str) -> UrlKind {
        let path = Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        if path.contains("/book/") {
            UrlKind::Book
        } else if path.contains("/ting/") {
            UrlKind::Episode
        } else {
            UrlKind::Unknown
        }
    }

    fn resolve_book(&self, ctx: &SiteContext<'_>, url: &str) -> Result<BookMetadata, SiteError> {
        let book_url = normalize_book_url(url);
        let id = book_id(&book_url)
            .ok_or_else(|| ResolutionError::Structure(format!("no book id in {book_url}")))?;
        let referer = format!("{BASE_URL}/");
        let first = ctx
            .http
            .get_text(&ctx.identity, &book_url, Some(&referer))
            .map_err(SiteError::book_page)?;

        let (title, author, cover_url, total_pages, mut raw) = {
            let doc = html::parse(&first);
            let title = html::first_text(&doc, &["h1"])
                .map(|t| t.replace("有声小说", "").trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| format!("book_{id}"));
            let author = html::first_text(&doc, &["span.author"])
                .map(|a| a.replace("作者：", "").trim().to_string())
                .filter(|a| !a.is_empty());
            let cover = html::first_attr(&doc, &["div.img img"], "src")
                .and_then(|c| absolutize(&book_url, &c));
            let pages = html::count(&doc, "div.play_navs a").max(1);
            (title, author, cover, pages, html::links(&doc, "ul#vlink li a"))
        };

        for p in 2..=total_pages {
            if ctx.stopped() {
                return Err(SiteError::Cancelled);
            }
            let page_url = format!("{BASE_URL}/book/{id}.html?p={p}");
            let body = ctx
                .http
                .get_text(&ctx.identity, &page_url, Some(&referer))
                .map_err(SiteError::book_page)?;
            raw.extend(html::links(&html::parse(&body), "ul#vlink li a"));
        }
        info!(target: "site", pages = total_pages, links = raw.len(), "huanting catalog parsed");

        let episodes = number_entries(raw);

        Ok(BookMetadata {
            title,
            source_url: book_url,
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
        let play_url = normalize_play_url(&episode.url);
        let (book, pid) = play_ids(&play_url)
            .ok_or_else(|| SiteError::MediaNotFound(format!("not a play page: {play_url}")))?;
        let version = ctx.identity.version;

        let mut cookie = match self.current_cookie(version) {
            GrantCheck::Usable(h) => Some(h),
            GrantCheck::Exhausted(last_url) => {
                info!(target: "challenge", uses = COOKIE_REFRESH_USES, "refreshing verification cookie");
                match self.refresh_cookie(ctx, &last_url, None) {
                    Ok(h) => Some(h),
                    Err(SiteError::Cancelled) => return Err(SiteError::Cancelled),
                    Err(e) => {
                        warn!(target: "challenge", "proactive refresh failed, keeping old cookie: {e}");
                        self.grant()
                            .as_ref()
                            .filter(|g| g.version == version)
                            .map(|g| g.header.clone())
                    }
                }
            }
            GrantCheck::Absent | GrantCheck::Stale => None,
        };

        for round in 0..2 {
            match self.call_api(ctx, &book, pid, cookie.as_deref())? {
                ApiReply::Media(url) => return Ok(self.media_from(ctx, url)),
                ApiReply::RateLimited => return Err(SiteError::RateLimited(play_url)),
                ApiReply::Unusable => {
                    return Err(SiteError::MediaNotFound(format!(
                        "undecodable playlist for episode {}",
                        episode.index
                    )));
                }
                ApiReply::ChallengeRequired if round == 0 => {
                    info!(target: "challenge", index = episode.index, "episode requires slider verification");
                    cookie = Some(self.refresh_cookie(ctx, &play_url, cookie.as_deref())?);
                }
                ApiReply::ChallengeRequired => {}
            }
        }
        Err(SiteError::ChallengeUnsolved(format!(
            "verification passed but api still refuses episode {}",
            episode.index
        )))
    }
}

/// 目录链接转为集列表：去掉空标题与重复链接，链接里的集号互不相同时用它
/// （保留站点缺号），否则按列表顺序编号。
pub fn number_entries(raw: Vec<(String, String)>) -> Vec<EpisodeRef> {
    let mut seen = HashSet::new();
    let entries: Vec<(String, String)> = raw
        .into_iter()
        .filter(|(_, t)| !t.is_empty())
        .filter_map(|(h, t)| Some((absolutize(BASE_URL, &h)?, t)))
        .filter(|(u, _)| seen.insert(u.clone()))
        .collect();
    let numbered: Option<Vec<u32>> = entries
        .iter()
        .map(|(u, _)| play_ids(u).map(|(_, n)| n))
        .collect();
    let numbered = numbered.filter(|n| {
        let mut uniq = HashSet::new();
        n.iter().all(|i| uniq.insert(*i))
    });
    entries
        .into_iter()
        .enumerate()
        .map(|(i, (url, title))| EpisodeRef {
            index: numbered.as_ref().map(|n| n[i]).unwrap_or(i as u32 + 1),
            title,
            url,
        })
        .collect()
}

pub fn normalize_play_url(raw: &str) -> String {
    let mut url = raw.trim().replace("ting22.com", "huanting.cc");
    if !url.starts_with("http") {
        url = format!("https://{url}");
    }
    url.replace("://m.huanting.cc", "://www.huanting.cc")
        .replace("://huanting.cc", "://www.huanting.cc")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        B64.encode(s)
    }

    #[test]
    fn api_replies_are_classified() {
        let ok = format!(
            r#"{{"state":"success","status":1,"playlist":{{"src":"{}"}}}}"#,
            b64("https://audio.test/1.mp3")
        );
        assert_eq!(parse_api_response(&ok), ApiReply::Media("https://audio.test/1.mp3".into()));
        let ok_str_status = format!(
            r#"{{"state":"success","status":"1","playlist":{{"src":"{}"}}}}"#,
            b64("https://audio.test/2.m4a")
        );
        assert!(matches!(parse_api_response(&ok_str_status), ApiReply::Media(_)));
        assert_eq!(parse_api_response("<html>访问频繁</html>"), ApiReply::RateLimited);
        assert_eq!(parse_api_response("操作受限"), ApiReply::RateLimited);
        assert_eq!(parse_api_response(r#"{"state":"fail","status":0}"#), ApiReply::ChallengeRequired);
        assert_eq!(
            parse_api_response(r#"{"state":"success","status":1,"playlist":{"src":"@@"}}"#),
            ApiReply::Unusable
        );
    }

    #[test]
    fn urls_normalize_to_desktop_book() {
        assert_eq!(
            normalize_book_url("m.ting22.com/book/2274.html"),
            "https://www.huanting.cc/book/2274.html"
        );
        assert_eq!(
            normalize_book_url("https://huanting.cc/ting/2274-151.html"),
            "https://www.huanting.cc/book/2274.html"
        );
        assert_eq!(play_ids("https://www.huanting.cc/ting/2274-151.html"), Some(("2274".into(), 151)));
        let h = Huanting::new();
        assert_eq!(h.classify_url("https://www.huanting.cc/ting/1-2.html"), UrlKind::Episode);
        assert_eq!(h.classify_url("https://www.huanting.cc/book/1.html"), UrlKind::Book);
    }

    #[test]
    fn catalog_links_are_deduplicated_before_numbering() {
        let raw = vec![
            ("/ting/2274-1.html".to_string(), "第1集".to_string()),
            ("/ting/2274-2.html".to_string(), "第2集".to_string()),
            ("/ting/2274-2.html".to_string(), "第2集".to_string()),
            ("/ting/2274-5.html".to_string(), "第5集".to_string()),
            ("/ting/2274-6.html".to_string(), String::new()),
        ];
        let eps = number_entries(raw);
        let indices: Vec<u32> = eps.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2, 5]);
        assert_eq!(eps[2].url, "https://www.huanting.cc/ting/2274-5.html");

        // 不同链接带相同集号时退回按顺序编号
        let raw = vec![
            ("/ting/2274-3.html".to_string(), "上".to_string()),
            ("/ting/9999-3.html".to_string(), "下".to_string()),
        ];
        let indices: Vec<u32> = number_entries(raw).iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn challenge_page_fields_are_extracted() {
        let page = r#"<script>var a = 1, Data = {"bg_pic":"\/cap\/bg.jpg","ico_pic":{"url":"\/cap\/ico.png","w":50}}, Data2 = "^^^`";
            var cfg = {sign: "0123456789abcdef0123456789abcdef", time: "1700000000"};</script>"#;
        let c = parse_challenge_page(page).unwrap();
        assert_eq!(c.bg_url, "https://www.huanting.cc/cap/bg.jpg");
        assert_eq!(c.piece_url, "https://www.huanting.cc/cap/ico.png");
        assert_eq!(c.slice_map.as_deref(), Some("^^^`"));
        assert_eq!(c.sign.len(), 32);
        assert_eq!(c.time, "1700000000");
        assert!(parse_challenge_page("<html>PTingJplayer</html>").is_none());
    }

    #[test]
    fn cookie_grant_follows_identity_and_use_count() {
        let grant = CookieGrant {
            version: 2,
            header: "PHPATSSD=x".into(),
            uses: 0,
            play_url: "https://www.huanting.cc/ting/1-151.html".into(),
        };
        assert_eq!(check_grant(None, 2), GrantCheck::Absent);
        assert_eq!(check_grant(Some(&grant), 3), GrantCheck::Stale);
        assert_eq!(check_grant(Some(&grant), 2), GrantCheck::Usable("PHPATSSD=x".into()));
        let used = CookieGrant {
            uses: COOKIE_REFRESH_USES,
            ..grant
        };
        assert!(matches!(check_grant(Some(&used), 2), GrantCheck::Exhausted(_)));

        let h = Huanting::new();
        h.store_grant(5, "a=b".into(), "u");
        assert_eq!(h.current_cookie(6), GrantCheck::Stale);
        assert_eq!(h.current_cookie(5), GrantCheck::Absent);
    }
}
