//! 基于 chromiumoxide 的渲染会话。
//!
//! 引擎本身是同步线程模型；工厂持有一个 tokio 运行时，会话在其上 `block_on`。

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CapturedResponse, RenderError, RenderRequest, RenderSession, RenderedPage, SessionFactory};
use crate::base_system::context::Config;
use crate::network::identity::ProxyIdentity;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// 单个响应正文上限，超过的不保存。
const MAX_BODY_BYTES: usize = 512 * 1024;

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

fn page_err(err: impl std::fmt::Display) -> RenderError {
    RenderError::Page(err.to_string())
}

pub struct ChromeFactory {
    runtime: Arc<Runtime>,
    headless: bool,
}

impl ChromeFactory {
    pub fn new(cfg: &Config) -> Result<Self, RenderError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("render-rt")
            .enable_all()
            .build()
            .map_err(|e| RenderError::Launch(format!("tokio runtime: {e}")))?;
        Ok(Self {
            runtime: Arc::new(runtime),
            headless: cfg.headless,
        })
    }
}

impl SessionFactory for ChromeFactory {
    fn launch(&self, identity: &ProxyIdentity) -> Result<Box<dyn RenderSession>, RenderError> {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        // 每个浏览器独立的用户目录，并发实例之间互不锁定
        let profile = std::env::temp_dir().join(format!("ting-mirror-{}-{seq}", std::process::id()));

        let mut builder = BrowserConfig::builder()
            .user_data_dir(&profile)
            .window_size(375, 812)
            .arg("--mute-audio")
            .arg("--autoplay-policy=no-user-gesture-required")
            .arg("--disable-blink-features=AutomationControlled");
        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(proxy) = identity.proxy_url() {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        let config = builder.build().map_err(RenderError::Launch)?;

        let (browser, handler) = self.runtime.block_on(async {
            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| RenderError::Launch(e.to_string()))?;
            let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });
            Ok::<_, RenderError>((browser, handler))
        })?;

        info!(target: "render", identity = %identity.label(), headless = self.headless, "browser session launched");
        Ok(Box::new(ChromeSession {
            runtime: Arc::clone(&self.runtime),
            browser: Some(browser),
            handler: Some(handler),
            profile,
        }))
    }
}

pub struct ChromeSession {
    runtime: Arc<Runtime>,
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    profile: PathBuf,
}

impl RenderSession for ChromeSession {
    fn render(
        &mut self,
        req: &RenderRequest,
        timeout: Duration,
    ) -> Result<RenderedPage, RenderError> {
        let Some(browser) = self.browser.as_ref() else {
            return Err(RenderError::Page("session already closed".into()));
        };
        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, render_page(browser, req)).await {
                Ok(out) => out,
                Err(_) => Err(RenderError::Timeout(timeout)),
            }
        })
    }

    fn close(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            self.runtime.block_on(async {
                if let Err(e) = browser.close().await {
                    debug!(target: "render", "browser close: {e}");
                }
                let _ = tokio::time::timeout(Duration::from_secs(5), browser.wait()).await;
            });
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        if let Err(e) = std::fs::remove_dir_all(&self.profile) {
            debug!(target: "render", profile = %self.profile.display(), "profile cleanup: {e}");
        }
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn wants_body(mime: &str) -> bool {
    let mime = mime.to_ascii_lowercase();
    mime.contains("json") || mime.starts_with("text/plain") || mime.contains("javascript")
}

async fn render_page(browser: &Browser, req: &RenderRequest) -> Result<RenderedPage, RenderError> {
    let page = browser.new_page("about:blank").await.map_err(page_err)?;
    let out = drive_page(&page, req).await;
    if let Err(e) = page.close().await {
        debug!(target: "render", "page close: {e}");
    }
    out
}

async fn drive_page(page: &Page, req: &RenderRequest) -> Result<RenderedPage, RenderError> {
    if let Some(ua) = &req.user_agent {
        page.execute(SetUserAgentOverrideParams::new(ua.clone()))
            .await
            .map_err(page_err)?;
    }
    if let Some((w, h)) = req.viewport {
        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(w),
            i64::from(h),
            2.0,
            true,
        ))
        .await
        .map_err(page_err)?;
    }
    page.execute(EnableParams::default()).await.map_err(page_err)?;
    let mut events = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(page_err)?;

    let captured: Arc<Mutex<Vec<CapturedResponse>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let body_page = page.clone();
    let collector = tokio::spawn(async move {
        while let Some(ev) = events.next().await {
            let res = &ev.response;
            let mut item = CapturedResponse {
                url: res.url.clone(),
                mime: res.mime_type.clone(),
                status: u16::try_from(res.status).unwrap_or(0),
                body: None,
            };
            if wants_body(&item.mime) {
                match body_page
                    .execute(GetResponseBodyParams::new(ev.request_id.clone()))
                    .await
                {
                    Ok(resp) if !resp.result.base64_encoded && resp.result.body.len() <= MAX_BODY_BYTES => {
                        item.body = Some(resp.result.body.clone());
                    }
                    Ok(_) => {}
                    Err(e) => debug!(target: "render", url = %item.url, "response body unavailable: {e}"),
                }
            }
            if let Ok(mut list) = sink.lock() {
                list.push(item);
            }
        }
    });

    let nav = NavigateParams::builder()
        .url(req.url.clone())
        .build()
        .map_err(RenderError::Page)?;
    if let Err(e) = page.goto(nav).await {
        // 导航报错时页面往往已经加载了一部分，继续轮询
        warn!(target: "render", url = %req.url, "navigation error: {e}");
    }
    tokio::time::sleep(req.settle).await;

    let started = Instant::now();
    let mut snapshot = RenderedPage::default();
    loop {
        if let Some(js) = &req.dom_probe {
            match page.evaluate(js.as_str()).await {
                Ok(v) => {
                    if let Some(s) = v.value().and_then(|v| v.as_str())
                        && !s.is_empty()
                        && !snapshot.dom_values.iter().any(|x| x == s)
                    {
                        snapshot.dom_values.push(s.to_string());
                    }
                }
                Err(e) => debug!(target: "render", "dom probe failed: {e}"),
            }
        }
        if let Some(sel) = &req.challenge_selector {
            let js = format!("!!document.querySelector({})", serde_json::Value::from(sel.as_str()));
            if let Ok(v) = page.evaluate(js).await {
                snapshot.challenge = v.value().and_then(|v| v.as_bool()).unwrap_or(false);
            }
        }
        if let Ok(list) = captured.lock() {
            snapshot.responses = list.clone();
        }
        if req.done.is_some_and(|done| done(&snapshot)) || started.elapsed() >= req.media_wait {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    snapshot.html = page.content().await.unwrap_or_default();
    snapshot.final_url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| req.url.clone());
    collector.abort();
    if let Ok(list) = captured.lock() {
        snapshot.responses = list.clone();
    }
    debug!(
        target: "render",
        url = %req.url,
        responses = snapshot.responses.len(),
        dom = snapshot.dom_values.len(),
        challenge = snapshot.challenge,
        "page rendered"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_capture_is_limited_to_text_types() {
        assert!(wants_body("application/json"));
        assert!(wants_body("text/plain; charset=utf-8"));
        assert!(!wants_body("audio/mpeg"));
        assert!(!wants_body("image/png"));
    }
}
