//! 基于身份快照的 HTTP 客户端缓存与状态码归类。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, ClientBuilder, Response};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, REFERER};
use thiserror::Error;

use super::identity::ProxyIdentity;
use crate::base_system::context::Config;

pub const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const MOBILE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Mobile/15E148 Safari/604.1";

const UA_POOL: [&str; 6] = [
    DESKTOP_UA,
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

pub fn random_ua() -> &'static str {
    use rand::seq::SliceRandom;
    UA_POOL
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(DESKTOP_UA)
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("not found ({status}): {url}")]
    NotFound { status: u16, url: String },
    #[error("rate limited: {url}")]
    RateLimited { url: String },
    #[error("server error {status}: {url}")]
    Server { status: u16, url: String },
    #[error("client error {status}: {url}")]
    Client { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("client build failed: {0}")]
    Build(String),
}

impl HttpError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HttpError::RateLimited { .. } | HttpError::Server { .. } | HttpError::Transport(_)
        )
    }
}

/// 把非 2xx 状态码归类；2xx 返回 `None`。
pub fn classify_status(status: StatusCode, url: &str) -> Option<HttpError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    let url = url.to_string();
    Some(match code {
        404 | 410 => HttpError::NotFound { status: code, url },
        429 => HttpError::RateLimited { url },
        408 => HttpError::Server { status: code, url },
        500..=599 => HttpError::Server { status: code, url },
        _ => HttpError::Client { status: code, url },
    })
}

pub fn check_status(resp: Response) -> Result<Response, HttpError> {
    match classify_status(resp.status(), resp.url().as_str()) {
        Some(err) => Err(err),
        None => Ok(resp),
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status()
            && let Some(mapped) = classify_status(status, err.url().map(|u| u.as_str()).unwrap_or(""))
        {
            return mapped;
        }
        HttpError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Route {
    Identity,
    Direct,
}

/// 每个身份版本缓存一个客户端；身份变化后旧客户端被丢弃。
pub struct HttpClients {
    request_timeout: Duration,
    connect_timeout: Duration,
    cdn_direct: bool,
    config: Config,
    cache: Mutex<HashMap<(u64, Route), Client>>,
}

impl HttpClients {
    pub fn new(cfg: &Config) -> Self {
        Self {
            request_timeout: cfg.request_timeout(),
            connect_timeout: cfg.connect_timeout(),
            cdn_direct: cfg.cdn_direct,
            config: cfg.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// 带身份代理与通用请求头的 builder，调用方可以继续定制（cookie、重定向等）。
    pub fn builder(&self, identity: &ProxyIdentity, user_agent: &str) -> Result<ClientBuilder, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        let mut builder = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(self.request_timeout)
            .connect_timeout(self.connect_timeout);
        builder = match identity.proxy_url() {
            Some(p) => builder.proxy(
                reqwest::Proxy::all(p).map_err(|e| HttpError::Build(e.to_string()))?,
            ),
            None => builder.no_proxy(),
        };
        Ok(builder)
    }

    pub fn client(&self, identity: &ProxyIdentity) -> Result<Client, HttpError> {
        self.cached(identity, Route::Identity)
    }

    /// 下载媒体用：CDN 地址在 `cdn_direct` 打开时绕过代理。
    pub fn client_for_media(&self, identity: &ProxyIdentity, url: &str) -> Result<Client, HttpError> {
        if self.cdn_direct && identity.proxy_url().is_some() && self.config.is_cdn_url(url) {
            self.cached(identity, Route::Direct)
        } else {
            self.cached(identity, Route::Identity)
        }
    }

    fn cached(&self, identity: &ProxyIdentity, route: Route) -> Result<Client, HttpError> {
        let key = (identity.version, route);
        let mut cache = match self.cache.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(c) = cache.get(&key) {
            return Ok(c.clone());
        }
        let client = match route {
            Route::Identity => self.builder(identity, DESKTOP_UA)?,
            Route::Direct => self.builder(&ProxyIdentity::direct(), DESKTOP_UA)?,
        }
        .build()
        .map_err(|e| HttpError::Build(e.to_string()))?;
        // 旧版本身份的客户端不再需要
        cache.retain(|(v, _), _| *v >= identity.version);
        cache.insert(key, client.clone());
        Ok(client)
    }

    /// GET 文本页面，带 Referer。
    pub fn get_text(
        &self,
        identity: &ProxyIdentity,
        url: &str,
        referer: Option<&str>,
    ) -> Result<String, HttpError> {
        let client = self.client(identity)?;
        let mut req = client.get(url);
        if let Some(r) = referer {
            req = req.header(REFERER, r);
        }
        let resp = check_status(req.send()?)?;
        Ok(resp.text()?)
    }

    pub fn get_bytes(
        &self,
        identity: &ProxyIdentity,
        url: &str,
        referer: Option<&str>,
    ) -> Result<Vec<u8>, HttpError> {
        let client = self.client_for_media(identity, url)?;
        let mut req = client.get(url);
        if let Some(r) = referer {
            req = req.header(REFERER, r);
        }
        let resp = check_status(req.send()?)?;
        Ok(resp.bytes()?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let u = "https://example.test/x";
        assert!(classify_status(StatusCode::OK, u).is_none());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, u),
            Some(HttpError::NotFound { status: 404, .. })
        ));
        assert!(matches!(
            classify_status(StatusCode::GONE, u),
            Some(HttpError::NotFound { status: 410, .. })
        ));
        let rl = classify_status(StatusCode::TOO_MANY_REQUESTS, u).unwrap();
        assert!(rl.is_transient());
        let server = classify_status(StatusCode::BAD_GATEWAY, u).unwrap();
        assert!(server.is_transient());
        let timeout = classify_status(StatusCode::REQUEST_TIMEOUT, u).unwrap();
        assert!(timeout.is_transient());
        let forbidden = classify_status(StatusCode::FORBIDDEN, u).unwrap();
        assert!(!forbidden.is_transient());
    }

    #[test]
    fn clients_are_cached_per_version() {
        let clients = HttpClients::new(&Config::default());
        let v0 = ProxyIdentity::direct();
        clients.client(&v0).unwrap();
        clients.client(&v0).unwrap();
        let v1 = ProxyIdentity {
            version: 1,
            ..ProxyIdentity::direct()
        };
        clients.client(&v1).unwrap();
        let cache = clients.cache.lock().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(&(1, Route::Identity)));
    }
}
