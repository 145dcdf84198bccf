//! Clash 风格的外部控制接口：查询状态、列出节点、切换节点。

use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::base_system::context::Config;

const COMMON_PORTS: [u16; 3] = [9090, 9097, 36925];
const PING_TIMEOUT: Duration = Duration::from_secs(2);
const SPECIAL_NODES: [&str; 4] = ["DIRECT", "REJECT", "GLOBAL", "COMPATIBLE"];
const GROUP_TYPES: [&str; 5] = ["Selector", "URLTest", "Fallback", "LoadBalance", "Relay"];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("controller request failed: {0}")]
    Request(String),
    #[error("controller returned status {0}")]
    Status(u16),
    #[error("controller reply malformed: {0}")]
    Malformed(String),
    #[error("no switchable node group")]
    NoGroup,
}

/// 控制接口里可切换的节点组。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroup {
    pub name: String,
    pub nodes: Vec<String>,
    pub current: Option<String>,
}

impl NodeGroup {
    /// 轮转到当前节点的下一个。
    pub fn next_after_current(&self) -> Option<&str> {
        if self.nodes.is_empty() {
            return None;
        }
        let idx = self
            .current
            .as_ref()
            .and_then(|c| self.nodes.iter().position(|n| n == c))
            .map(|i| (i + 1) % self.nodes.len())
            .unwrap_or(0);
        self.nodes.get(idx).map(|s| s.as_str())
    }
}

pub trait ProxyController: Send + Sync {
    fn status(&self) -> Result<String, ProxyError>;
    fn node_group(&self) -> Result<NodeGroup, ProxyError>;
    fn switch_node(&self, group: &str, node: &str) -> Result<(), ProxyError>;
}

pub struct ClashController {
    base: String,
    secret: String,
    client: Client,
}

impl ClashController {
    pub fn new(base: &str, secret: &str, timeout: Duration) -> Result<Self, ProxyError> {
        // 控制接口在本机，不能走代理
        let client = Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Request(e.to_string()))?;
        let base = if base.contains("://") {
            base.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", base.trim_end_matches('/'))
        };
        Ok(Self {
            base,
            secret: secret.trim().to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn get(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        let req = self.client.get(format!("{}{}", self.base, path));
        self.authorize(req)
    }

    fn authorize(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        if self.secret.is_empty() {
            req
        } else {
            req.bearer_auth(&self.secret)
        }
    }
}

impl ProxyController for ClashController {
    fn status(&self) -> Result<String, ProxyError> {
        let resp = self
            .get("/version")
            .send()
            .map_err(|e| ProxyError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ProxyError::Status(resp.status().as_u16()));
        }
        let body: Value = resp
            .json()
            .map_err(|e| ProxyError::Malformed(e.to_string()))?;
        Ok(body
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    fn node_group(&self) -> Result<NodeGroup, ProxyError> {
        let resp = self
            .get("/proxies")
            .send()
            .map_err(|e| ProxyError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ProxyError::Status(resp.status().as_u16()));
        }
        let body: Value = resp
            .json()
            .map_err(|e| ProxyError::Malformed(e.to_string()))?;
        pick_node_group(&body).ok_or(ProxyError::NoGroup)
    }

    fn switch_node(&self, group: &str, node: &str) -> Result<(), ProxyError> {
        let encoded: String = url::form_urlencoded::byte_serialize(group.as_bytes()).collect();
        // form 编码把空格写成 '+'，路径里需要 %20
        let encoded = encoded.replace('+', "%20");
        let req = self
            .client
            .put(format!("{}/proxies/{}", self.base, encoded))
            .json(&serde_json::json!({ "name": node }));
        let resp = self
            .authorize(req)
            .send()
            .map_err(|e| ProxyError::Request(e.to_string()))?;
        let status = resp.status().as_u16();
        if status == 200 || status == 204 {
            Ok(())
        } else {
            Err(ProxyError::Status(status))
        }
    }
}

/// 选择成员最多的 Selector 组，剔除内置出口和嵌套组。
pub fn pick_node_group(body: &Value) -> Option<NodeGroup> {
    let proxies = body.get("proxies")?.as_object()?;

    let mut selectors: Vec<(&String, &Value)> = proxies
        .iter()
        .filter(|(name, info)| {
            info.get("type").and_then(|t| t.as_str()) == Some("Selector")
                && !SPECIAL_NODES.contains(&name.as_str())
        })
        .collect();
    selectors.sort_by_key(|(name, info)| {
        let members = info
            .get("all")
            .and_then(|a| a.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        (std::cmp::Reverse(members), (*name).clone())
    });
    let (name, info) = selectors.first()?;

    let nodes: Vec<String> = info
        .get("all")
        .and_then(|a| a.as_array())
        .map(|all| {
            all.iter()
                .filter_map(|n| n.as_str())
                .filter(|n| !SPECIAL_NODES.contains(n))
                .filter(|n| {
                    let kind = proxies
                        .get(*n)
                        .and_then(|p| p.get("type"))
                        .and_then(|t| t.as_str())
                        .unwrap_or("");
                    !GROUP_TYPES.contains(&kind)
                })
                .map(|n| n.to_string())
                .collect()
        })
        .unwrap_or_default();
    if nodes.is_empty() {
        return None;
    }

    let current = info
        .get("now")
        .and_then(|n| n.as_str())
        .filter(|n| nodes.iter().any(|x| x == n))
        .map(|n| n.to_string());

    Some(NodeGroup {
        name: (*name).clone(),
        nodes,
        current,
    })
}

/// 定位控制接口：配置项 → Clash Verge 配置文件 → 常见端口。
pub fn detect_controller(cfg: &Config) -> Option<ClashController> {
    let timeout = cfg.rotation_timeout();
    let mut secret = cfg.controller_secret.trim().to_string();

    let mut candidates: Vec<String> = Vec::new();
    if !cfg.controller_url.trim().is_empty() {
        candidates.push(cfg.controller_url.trim().to_string());
    }
    if let Some((addr, file_secret)) = read_clash_verge_config() {
        candidates.push(addr);
        if secret.is_empty() {
            secret = file_secret.unwrap_or_default();
        }
    }
    for port in COMMON_PORTS {
        candidates.push(format!("http://127.0.0.1:{port}"));
    }

    for base in candidates {
        let Ok(ping) = ClashController::new(&base, &secret, PING_TIMEOUT) else {
            continue;
        };
        match ping.status() {
            Ok(version) => {
                info!(target: "proxy", controller = %ping.base_url(), %version, "proxy controller detected");
                return ClashController::new(&base, &secret, timeout).ok();
            }
            Err(err) => debug!(target: "proxy", controller = %base, "controller probe failed: {err}"),
        }
    }
    None
}

fn clash_verge_config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(appdata) = std::env::var_os("APPDATA") {
        out.push(
            PathBuf::from(appdata)
                .join("io.github.clash-verge-rev.clash-verge-rev")
                .join("config.yaml"),
        );
    }
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        let home = PathBuf::from(home);
        for dir in [
            "io.github.clash-verge-rev.clash-verge-rev",
            "clash-verge-rev",
            "clash-verge",
        ] {
            out.push(home.join(".config").join(dir).join("config.yaml"));
        }
    }
    out
}

fn read_clash_verge_config() -> Option<(String, Option<String>)> {
    clash_verge_config_paths()
        .into_iter()
        .filter(|p| p.is_file())
        .find_map(|p| {
            let raw = std::fs::read_to_string(&p).ok()?;
            parse_clash_config(&raw)
        })
}

/// 从 Clash 配置中读出 `external-controller` 与 `secret`。
pub fn parse_clash_config(raw: &str) -> Option<(String, Option<String>)> {
    let doc: serde_yaml::Value = serde_yaml::from_str(raw).ok()?;
    let addr = doc.get("external-controller")?.as_str()?.trim();
    if addr.is_empty() {
        return None;
    }
    let addr = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    let secret = doc
        .get("secret")
        .and_then(|s| s.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Some((addr, secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn largest_selector_group_wins() {
        let body = json!({
            "proxies": {
                "GLOBAL": {"type": "Selector", "all": ["DIRECT", "a", "b", "c", "d", "e"]},
                "Auto": {"type": "URLTest", "all": ["a", "b"]},
                "Small": {"type": "Selector", "all": ["a"]},
                "Main": {"type": "Selector", "all": ["DIRECT", "Auto", "a", "b", "c"], "now": "b"},
                "a": {"type": "Shadowsocks"},
                "b": {"type": "Vmess"},
                "c": {"type": "Trojan"}
            }
        });
        let group = pick_node_group(&body).unwrap();
        assert_eq!(group.name, "Main");
        assert_eq!(group.nodes, vec!["a", "b", "c"]);
        assert_eq!(group.current.as_deref(), Some("b"));
        assert_eq!(group.next_after_current(), Some("c"));
    }

    #[test]
    fn rotation_wraps_around() {
        let group = NodeGroup {
            name: "g".into(),
            nodes: vec!["x".into(), "y".into()],
            current: Some("y".into()),
        };
        assert_eq!(group.next_after_current(), Some("x"));
    }

    #[test]
    fn reads_verge_controller_and_secret() {
        let raw = "mixed-port: 7897\nexternal-controller: 127.0.0.1:9097\nsecret: abc\n";
        let (addr, secret) = parse_clash_config(raw).unwrap();
        assert_eq!(addr, "http://127.0.0.1:9097");
        assert_eq!(secret.as_deref(), Some("abc"));
        assert!(parse_clash_config("mixed-port: 7897\n").is_none());
    }
}
