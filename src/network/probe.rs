//! 代理候选探测。

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use url::Url;

use crate::base_system::context::Config;

pub const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

const LOCAL_PORTS: [(u16, &str); 4] = [
    (7890, "http"),
    (7891, "http"),
    (7897, "http"),
    (1080, "socks5"),
];

/// 判断代理地址是否可达。
pub trait ProxyProbe: Send + Sync {
    fn reachable(&self, proxy: &str) -> bool;
}

/// TCP 建连探测：500ms 内能连上即视为可用。
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            timeout: CONNECT_PROBE_TIMEOUT,
        }
    }
}

impl ProxyProbe for TcpProbe {
    fn reachable(&self, proxy: &str) -> bool {
        let Some(addr) = proxy_socket_addr(proxy) else {
            return false;
        };
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}

/// 把代理地址补全为带协议的形式，例如 `127.0.0.1:7890` → `http://127.0.0.1:7890`。
pub fn normalize_proxy(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    url.host_str()?;
    Some(with_scheme.trim_end_matches('/').to_string())
}

fn proxy_socket_addr(proxy: &str) -> Option<SocketAddr> {
    let normalized = normalize_proxy(proxy)?;
    let url = Url::parse(&normalized).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default().or(match url.scheme() {
        "socks5" | "socks5h" => Some(1080),
        _ => None,
    })?;
    (host, port).to_socket_addrs().ok()?.next()
}

/// auto 模式的候选顺序：配置项 → 环境变量 → 本机常见端口。
pub fn discover_candidates(cfg: &Config) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        if let Some(p) = normalize_proxy(raw)
            && !out.contains(&p)
        {
            out.push(p);
        }
    };

    for c in &cfg.proxy_candidates {
        push(c);
    }
    if !cfg.proxy_address.trim().is_empty() {
        push(&cfg.proxy_address);
    }
    for var in ["HTTPS_PROXY", "HTTP_PROXY", "https_proxy", "http_proxy"] {
        if let Ok(val) = std::env::var(var) {
            push(&val);
        }
    }
    for (port, scheme) in LOCAL_PORTS {
        push(&format!("{scheme}://127.0.0.1:{port}"));
    }
    out
}

/// 按顺序返回第一个可达的候选。
pub fn first_reachable<'a>(
    probe: &dyn ProxyProbe,
    candidates: &'a [String],
) -> Option<&'a String> {
    candidates.iter().find(|c| probe.reachable(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn normalize_adds_scheme() {
        assert_eq!(
            normalize_proxy("127.0.0.1:7890").as_deref(),
            Some("http://127.0.0.1:7890")
        );
        assert_eq!(
            normalize_proxy("socks5://127.0.0.1:1080/").as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
        assert!(normalize_proxy("   ").is_none());
    }

    #[test]
    fn configured_candidates_come_first() {
        let cfg = Config {
            proxy_candidates: vec!["10.0.0.2:3128".to_string()],
            ..Config::default()
        };
        let list = discover_candidates(&cfg);
        assert_eq!(list[0], "http://10.0.0.2:3128");
        assert!(list.contains(&"socks5://127.0.0.1:1080".to_string()));
    }

    #[test]
    fn tcp_probe_sees_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::default();
        assert!(probe.reachable(&format!("http://127.0.0.1:{port}")));
        drop(listener);
        assert!(!probe.reachable("not a proxy"));
    }
}
