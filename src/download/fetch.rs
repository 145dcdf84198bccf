//! 媒体字节流下载：把 `MediaLocator` 指向的内容写入 `.part` 文件。

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE, RANGE, REFERER};
use tracing::debug;

use super::errors::{EpisodeError, ErrorKind};
use super::models::{MediaLocator, MediaSegment, MediaSource};
use crate::network::http::{HttpClients, check_status};
use crate::network::identity::ProxyIdentity;

const CHUNK: usize = 64 * 1024;

pub trait MediaFetcher: Send + Sync {
    /// 写入 `dest`（覆盖），返回写入的字节数。`stop` 置位时尽快返回 `Cancelled`。
    fn fetch(
        &self,
        locator: &MediaLocator,
        identity: &ProxyIdentity,
        dest: &Path,
        stop: &AtomicBool,
    ) -> Result<u64, EpisodeError>;
}

pub struct HttpMediaFetcher {
    http: Arc<HttpClients>,
}

impl HttpMediaFetcher {
    pub fn new(http: Arc<HttpClients>) -> Self {
        Self { http }
    }

    fn stream(
        &self,
        locator: &MediaLocator,
        identity: &ProxyIdentity,
        segment: &MediaSegment,
        out: &mut impl Write,
        stop: &AtomicBool,
    ) -> Result<u64, EpisodeError> {
        let client = self.http.client_for_media(identity, &segment.url)?;
        let mut req = client.get(&segment.url).header(ACCEPT, "*/*");
        if let Some(r) = &locator.referer {
            req = req.header(REFERER, r);
        }
        if let Some(c) = locator.cookies.as_deref().filter(|c| !c.is_empty()) {
            req = req.header(COOKIE, c);
        }
        if let Some((start, end)) = segment.range {
            req = req.header(RANGE, format!("bytes={start}-{end}"));
        }
        let mut resp = check_status(req.send().map_err(crate::network::http::HttpError::from)?)?;

        let html = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));
        if html {
            return Err(EpisodeError::verification(format!(
                "server returned a web page instead of audio: {}",
                segment.url
            )));
        }

        let mut buf = vec![0u8; CHUNK];
        let mut total = 0u64;
        loop {
            if stop.load(Ordering::Relaxed) {
                return Err(EpisodeError::cancelled());
            }
            let n = resp
                .read(&mut buf)
                .map_err(|e| EpisodeError::new(ErrorKind::NetworkTransient, format!("read body: {e}")))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
        debug!(target: "download", url = %segment.url, bytes = total, "segment received");
        Ok(total)
    }
}

impl MediaFetcher for HttpMediaFetcher {
    fn fetch(
        &self,
        locator: &MediaLocator,
        identity: &ProxyIdentity,
        dest: &Path,
        stop: &AtomicBool,
    ) -> Result<u64, EpisodeError> {
        let segments = match &locator.source {
            MediaSource::Direct(url) => vec![MediaSegment {
                url: url.clone(),
                range: None,
            }],
            MediaSource::Segments(segs) => segs.clone(),
        };
        if segments.is_empty() {
            return Err(EpisodeError::new(ErrorKind::MediaNotFound, "locator has no segments"));
        }
        let mut out = BufWriter::new(File::create(dest)?);
        let mut total = 0u64;
        for seg in &segments {
            total += self.stream(locator, identity, seg, &mut out, stop)?;
        }
        out.flush()?;
        out.into_inner()
            .map_err(|e| EpisodeError::from(e.into_error()))?
            .sync_all()?;
        Ok(total)
    }
}
