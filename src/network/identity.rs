//! 出口身份（代理）管理与定时轮换。
//!
//! 当前身份是一个带版本号的不可变值，worker 在派发时拿到快照后一直使用它；
//! 轮换只替换共享值，不影响正在执行的任务。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{info, warn};

use super::controller::{ProxyController, detect_controller};
use super::probe::{ProxyProbe, TcpProbe, discover_candidates, first_reachable, normalize_proxy};
use crate::base_system::context::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Direct,
    Fixed,
    Auto,
}

impl ProxyMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "direct" | "none" | "" => Some(Self::Direct),
            "fixed" | "manual" => Some(Self::Fixed),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Egress {
    Direct,
    Proxy(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyIdentity {
    /// 每次成功轮换 +1；会话与 cookie 以此判断是否过期。
    pub version: u64,
    pub egress: Egress,
    /// 控制接口中当前选中的节点名。
    pub node: Option<String>,
}

impl ProxyIdentity {
    pub fn direct() -> Self {
        Self {
            version: 0,
            egress: Egress::Direct,
            node: None,
        }
    }

    pub fn proxy_url(&self) -> Option<&str> {
        match &self.egress {
            Egress::Direct => None,
            Egress::Proxy(p) => Some(p.as_str()),
        }
    }

    pub fn label(&self) -> String {
        let base = self.proxy_url().unwrap_or("direct");
        match &self.node {
            Some(node) => format!("{base} [{node}] v{}", self.version),
            None => format!("{base} v{}", self.version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    Rotated { version: u64, node: Option<String> },
    /// 当前模式下没有可轮换的东西（direct，或 fixed 且无控制接口）。
    Unsupported,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("rotation degraded, keeping previous identity: {reason}")]
pub struct RotationDegraded {
    pub reason: String,
}

pub struct IdentityManager {
    mode: ProxyMode,
    current: RwLock<Arc<ProxyIdentity>>,
    rotate_lock: Mutex<()>,
    candidates: Vec<String>,
    controller: Option<Box<dyn ProxyController>>,
    probe: Box<dyn ProxyProbe>,
    probe_attempts: usize,
    rotations: AtomicU64,
}

impl IdentityManager {
    pub fn new(
        mode: ProxyMode,
        initial: Egress,
        candidates: Vec<String>,
        controller: Option<Box<dyn ProxyController>>,
        probe: Box<dyn ProxyProbe>,
        probe_attempts: usize,
    ) -> Self {
        Self {
            mode,
            current: RwLock::new(Arc::new(ProxyIdentity {
                version: 0,
                egress: initial,
                node: None,
            })),
            rotate_lock: Mutex::new(()),
            candidates,
            controller,
            probe,
            probe_attempts: probe_attempts.max(1),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn direct() -> Self {
        Self::new(
            ProxyMode::Direct,
            Egress::Direct,
            Vec::new(),
            None,
            Box::new(TcpProbe::default()),
            1,
        )
    }

    /// 按配置构建；auto 模式下会探测候选代理与控制接口。
    pub fn from_config(cfg: &Config) -> Self {
        let mode = ProxyMode::parse(&cfg.proxy_mode).unwrap_or(ProxyMode::Direct);
        let probe: Box<dyn ProxyProbe> = Box::new(TcpProbe::default());
        match mode {
            ProxyMode::Direct => Self::new(
                mode,
                Egress::Direct,
                Vec::new(),
                None,
                probe,
                cfg.rotation_probe_attempts,
            ),
            ProxyMode::Fixed => {
                let addr = normalize_proxy(&cfg.proxy_address)
                    .unwrap_or_else(|| cfg.proxy_address.trim().to_string());
                // fixed 模式只有显式配置了控制接口才允许轮换
                let controller = if cfg.controller_url.trim().is_empty() {
                    None
                } else {
                    detect_controller(cfg).map(|c| Box::new(c) as Box<dyn ProxyController>)
                };
                info!(target: "proxy", proxy = %addr, "using fixed proxy");
                Self::new(
                    mode,
                    Egress::Proxy(addr.clone()),
                    vec![addr],
                    controller,
                    probe,
                    cfg.rotation_probe_attempts,
                )
            }
            ProxyMode::Auto => {
                let candidates = discover_candidates(cfg);
                let initial = match first_reachable(probe.as_ref(), &candidates) {
                    Some(p) => {
                        info!(target: "proxy", proxy = %p, "auto proxy selected");
                        Egress::Proxy(p.clone())
                    }
                    None => {
                        warn!(target: "proxy", "no reachable proxy candidate, falling back to direct");
                        Egress::Direct
                    }
                };
                let controller =
                    detect_controller(cfg).map(|c| Box::new(c) as Box<dyn ProxyController>);
                Self::new(
                    mode,
                    initial,
                    candidates,
                    controller,
                    probe,
                    cfg.rotation_probe_attempts,
                )
            }
        }
    }

    pub fn mode(&self) -> ProxyMode {
        self.mode
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_some()
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::SeqCst)
    }

    /// 派发时调用：拿到当前身份的快照。
    pub fn snapshot(&self) -> Arc<ProxyIdentity> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// 唯一的修改入口。持锁执行，保证同一时刻最多一个轮换。
    pub fn rotate(&self) -> Result<RotationOutcome, RotationDegraded> {
        let _guard = match self.rotate_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = self.snapshot();

        let (egress, node) = match (self.mode, self.controller.as_deref()) {
            (ProxyMode::Direct, _) | (ProxyMode::Fixed, None) => {
                return Ok(RotationOutcome::Unsupported);
            }
            (_, Some(controller)) => self.rotate_via_controller(controller, &previous)?,
            (ProxyMode::Auto, None) => (self.reprobe_candidates(&previous)?, None),
        };

        let next = Arc::new(ProxyIdentity {
            version: previous.version + 1,
            egress,
            node: node.clone(),
        });
        info!(target: "proxy", from = %previous.label(), to = %next.label(), "identity rotated");
        let version = next.version;
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        self.rotations.fetch_add(1, Ordering::SeqCst);
        Ok(RotationOutcome::Rotated { version, node })
    }

    fn rotate_via_controller(
        &self,
        controller: &dyn ProxyController,
        previous: &ProxyIdentity,
    ) -> Result<(Egress, Option<String>), RotationDegraded> {
        let degraded = |reason: String| RotationDegraded { reason };

        let group = controller
            .node_group()
            .map_err(|e| degraded(e.to_string()))?;
        let node = group
            .next_after_current()
            .ok_or_else(|| degraded(format!("group {} has no nodes", group.name)))?
            .to_string();
        controller
            .switch_node(&group.name, &node)
            .map_err(|e| degraded(e.to_string()))?;

        // 切换后确认出口仍可达；控制接口切的是代理内部节点，本地地址不变
        let egress = match &previous.egress {
            Egress::Direct => match self.probe_any() {
                Some(p) => Egress::Proxy(p),
                None => Egress::Direct,
            },
            Egress::Proxy(addr) => {
                if self.probe_with_retries(addr) {
                    Egress::Proxy(addr.clone())
                } else if let Some(p) = self.probe_any() {
                    Egress::Proxy(p)
                } else {
                    return Err(degraded(format!(
                        "proxy unreachable after switching to {node}"
                    )));
                }
            }
        };
        Ok((egress, Some(node)))
    }

    /// 无控制接口时的 auto 轮换：优先换到另一个可达候选。
    fn reprobe_candidates(&self, previous: &ProxyIdentity) -> Result<Egress, RotationDegraded> {
        let current = previous.proxy_url();
        let start = current
            .and_then(|c| self.candidates.iter().position(|x| x == c))
            .map(|i| i + 1)
            .unwrap_or(0);
        let n = self.candidates.len();
        for _ in 0..self.probe_attempts {
            for offset in 0..n {
                let cand = &self.candidates[(start + offset) % n];
                if self.probe.reachable(cand) {
                    return Ok(Egress::Proxy(cand.clone()));
                }
            }
        }
        Err(RotationDegraded {
            reason: format!("none of {n} proxy candidates reachable"),
        })
    }

    fn probe_with_retries(&self, addr: &str) -> bool {
        (0..self.probe_attempts).any(|_| self.probe.reachable(addr))
    }

    fn probe_any(&self) -> Option<String> {
        for _ in 0..self.probe_attempts {
            if let Some(p) = first_reachable(self.probe.as_ref(), &self.candidates) {
                return Some(p.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::controller::{NodeGroup, ProxyError};
    use std::collections::HashSet;

    struct SetProbe(HashSet<String>);

    impl ProxyProbe for SetProbe {
        fn reachable(&self, proxy: &str) -> bool {
            self.0.contains(proxy)
        }
    }

    struct FakeClash {
        current: Mutex<String>,
    }

    impl ProxyController for FakeClash {
        fn status(&self) -> Result<String, ProxyError> {
            Ok("fake".into())
        }

        fn node_group(&self) -> Result<NodeGroup, ProxyError> {
            Ok(NodeGroup {
                name: "Proxy".into(),
                nodes: vec!["hk".into(), "jp".into(), "sg".into()],
                current: Some(self.current.lock().unwrap().clone()),
            })
        }

        fn switch_node(&self, _group: &str, node: &str) -> Result<(), ProxyError> {
            *self.current.lock().unwrap() = node.to_string();
            Ok(())
        }
    }

    fn probe(of: &[&str]) -> Box<dyn ProxyProbe> {
        Box::new(SetProbe(of.iter().map(|s| s.to_string()).collect()))
    }

    #[test]
    fn direct_mode_never_rotates() {
        let mgr = IdentityManager::direct();
        assert_eq!(mgr.rotate(), Ok(RotationOutcome::Unsupported));
        assert_eq!(mgr.snapshot().version, 0);
    }

    #[test]
    fn auto_without_reachable_candidate_keeps_identity() {
        let mgr = IdentityManager::new(
            ProxyMode::Auto,
            Egress::Proxy("http://a:1".into()),
            vec!["http://a:1".into(), "http://b:2".into()],
            None,
            probe(&[]),
            3,
        );
        let before = mgr.snapshot();
        let err = mgr.rotate().unwrap_err();
        assert!(err.reason.contains("reachable"));
        assert_eq!(mgr.snapshot(), before);
        assert_eq!(mgr.rotations(), 0);
    }

    #[test]
    fn auto_rotation_moves_to_next_reachable_candidate() {
        let mgr = IdentityManager::new(
            ProxyMode::Auto,
            Egress::Proxy("http://a:1".into()),
            vec!["http://a:1".into(), "http://b:2".into()],
            None,
            probe(&["http://a:1", "http://b:2"]),
            1,
        );
        let old = mgr.snapshot();
        mgr.rotate().unwrap();
        let new = mgr.snapshot();
        assert_eq!(new.version, 1);
        assert_eq!(new.proxy_url(), Some("http://b:2"));
        // 旧快照不受影响
        assert_eq!(old.proxy_url(), Some("http://a:1"));
    }

    #[test]
    fn controller_rotation_switches_node() {
        let mgr = IdentityManager::new(
            ProxyMode::Auto,
            Egress::Proxy("http://127.0.0.1:7890".into()),
            vec!["http://127.0.0.1:7890".into()],
            Some(Box::new(FakeClash {
                current: Mutex::new("sg".into()),
            })),
            probe(&["http://127.0.0.1:7890"]),
            2,
        );
        let out = mgr.rotate().unwrap();
        assert_eq!(
            out,
            RotationOutcome::Rotated {
                version: 1,
                node: Some("hk".into())
            }
        );
        assert_eq!(mgr.snapshot().node.as_deref(), Some("hk"));
    }
}
