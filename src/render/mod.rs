//! 渲染会话：用无头浏览器执行页面脚本并截获网络响应。
//!
//! `SessionPool` 管理有限个会话的借出与归还；会话与创建时的身份版本绑定，
//! 身份轮换后借出的旧会话会被关闭并按新身份重建。

pub mod chrome;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::base_system::context::Config;
use crate::network::identity::ProxyIdentity;

const WAIT_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render timed out after {0:?}")]
    Timeout(Duration),
    #[error("session held past idle timeout ({0:?})")]
    IdleExpired(Duration),
    #[error("no render session available within {0:?}")]
    Unavailable(Duration),
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("page error: {0}")]
    Page(String),
    #[error("interrupted")]
    Cancelled,
}

impl RenderError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RenderError::Timeout(_) | RenderError::IdleExpired(_) | RenderError::Unavailable(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    pub user_agent: Option<String>,
    pub viewport: Option<(u32, u32)>,
    /// 导航完成后的固定等待。
    pub settle: Duration,
    /// 轮询页面的最长时间。
    pub media_wait: Duration,
    /// 每轮执行的脚本，返回字符串时收集进 `dom_values`。
    pub dom_probe: Option<String>,
    /// 出现即视为拦截页的 CSS 选择器。
    pub challenge_selector: Option<String>,
    /// 判断是否可以提前结束轮询。
    pub done: Option<fn(&RenderedPage) -> bool>,
}

impl RenderRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: None,
            viewport: None,
            settle: Duration::from_secs(2),
            media_wait: Duration::from_secs(30),
            dom_probe: None,
            challenge_selector: None,
            done: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub url: String,
    pub mime: String,
    pub status: u16,
    /// 仅对 json / text 类响应抓取正文。
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedPage {
    pub final_url: String,
    pub html: String,
    pub responses: Vec<CapturedResponse>,
    pub dom_values: Vec<String>,
    pub challenge: bool,
}

pub trait RenderSession: Send {
    fn render(&mut self, req: &RenderRequest, timeout: Duration)
    -> Result<RenderedPage, RenderError>;
    fn close(&mut self);
}

pub trait SessionFactory: Send + Sync {
    fn launch(&self, identity: &ProxyIdentity) -> Result<Box<dyn RenderSession>, RenderError>;
}

struct Slot {
    session: Box<dyn RenderSession>,
    version: u64,
}

struct PoolState {
    idle: Vec<Slot>,
    checked_out: usize,
    closed: bool,
}

pub struct SessionPool {
    factory: Box<dyn SessionFactory>,
    capacity: usize,
    render_timeout: Duration,
    idle_timeout: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl SessionPool {
    pub fn new(
        factory: Box<dyn SessionFactory>,
        capacity: usize,
        render_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            capacity: capacity.max(1),
            render_timeout,
            idle_timeout,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                checked_out: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn from_config(factory: Box<dyn SessionFactory>, cfg: &Config) -> Self {
        Self::new(
            factory,
            cfg.render_sessions,
            cfg.render_timeout(),
            cfg.session_idle_timeout(),
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 借出一个与 `identity` 版本一致的会话；池满时阻塞等待。
    pub fn checkout(
        &self,
        identity: &ProxyIdentity,
        stop: &AtomicBool,
    ) -> Result<SessionLease<'_>, RenderError> {
        let deadline = Instant::now() + self.render_timeout;
        let mut state = self.lock();
        loop {
            if stop.load(Ordering::Relaxed) || state.closed {
                return Err(RenderError::Cancelled);
            }

            if let Some(pos) = state.idle.iter().position(|s| s.version == identity.version) {
                let slot = state.idle.swap_remove(pos);
                state.checked_out += 1;
                return Ok(SessionLease::new(self, slot));
            }

            // 空闲会话属于旧身份：关闭后腾出名额
            let stale: Vec<Slot> = std::mem::take(&mut state.idle);
            if !stale.is_empty() {
                drop(state);
                for mut slot in stale {
                    debug!(target: "render", version = slot.version, "closing session of previous identity");
                    slot.session.close();
                }
                state = self.lock();
                continue;
            }

            if state.checked_out < self.capacity {
                state.checked_out += 1;
                drop(state);
                return match self.factory.launch(identity) {
                    Ok(session) => Ok(SessionLease::new(
                        self,
                        Slot {
                            session,
                            version: identity.version,
                        },
                    )),
                    Err(err) => {
                        self.release_slot();
                        Err(err)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RenderError::Unavailable(self.render_timeout));
            }
            let wait = WAIT_SLICE.min(deadline - now);
            state = match self.available.wait_timeout(state, wait) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn release_slot(&self) {
        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn checkin(&self, mut slot: Slot, reusable: bool) {
        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        if reusable && !state.closed {
            state.idle.push(slot);
            drop(state);
        } else {
            drop(state);
            slot.session.close();
        }
        self.available.notify_one();
    }

    /// 关闭所有空闲会话并拒绝后续借出。
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        for mut slot in idle {
            slot.session.close();
        }
        self.available.notify_all();
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn checked_out(&self) -> usize {
        self.lock().checked_out
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 借出的会话；drop 时自动归还。
pub struct SessionLease<'a> {
    pool: &'a SessionPool,
    slot: Option<Slot>,
    since: Instant,
    poisoned: bool,
}

impl<'a> SessionLease<'a> {
    fn new(pool: &'a SessionPool, slot: Slot) -> Self {
        Self {
            pool,
            slot: Some(slot),
            since: Instant::now(),
            poisoned: false,
        }
    }

    pub fn identity_version(&self) -> Option<u64> {
        self.slot.as_ref().map(|s| s.version)
    }

    /// 占用超过空闲上限的会话被强制关闭并报告超时。
    pub fn render(&mut self, req: &RenderRequest) -> Result<RenderedPage, RenderError> {
        let held = self.since.elapsed();
        if held >= self.pool.idle_timeout {
            warn!(target: "render", ?held, "session exceeded idle timeout, force closing");
            self.poisoned = true;
            return Err(RenderError::IdleExpired(self.pool.idle_timeout));
        }
        let budget = self.pool.render_timeout.min(self.pool.idle_timeout - held);
        let Some(slot) = self.slot.as_mut() else {
            return Err(RenderError::Cancelled);
        };
        let out = slot.session.render(req, budget);
        if let Err(err) = &out {
            // 超时或页面异常后会话状态不可信
            debug!(target: "render", "discarding session after error: {err}");
            self.poisoned = true;
        }
        out
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let reusable = !self.poisoned && self.since.elapsed() < self.pool.idle_timeout;
            self.pool.checkin(slot, reusable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        launched: AtomicUsize,
        closed: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    struct FakeSession {
        counters: Arc<Counters>,
        delay: Duration,
        open: bool,
    }

    impl RenderSession for FakeSession {
        fn render(
            &mut self,
            req: &RenderRequest,
            timeout: Duration,
        ) -> Result<RenderedPage, RenderError> {
            if self.delay > timeout {
                return Err(RenderError::Timeout(timeout));
            }
            std::thread::sleep(self.delay);
            Ok(RenderedPage {
                final_url: req.url.clone(),
                ..RenderedPage::default()
            })
        }

        fn close(&mut self) {
            if self.open {
                self.open = false;
                self.counters.closed.fetch_add(1, Ordering::SeqCst);
                self.counters.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    struct FakeFactory {
        counters: Arc<Counters>,
        delay: Duration,
    }

    impl SessionFactory for FakeFactory {
        fn launch(&self, _identity: &ProxyIdentity) -> Result<Box<dyn RenderSession>, RenderError> {
            self.counters.launched.fetch_add(1, Ordering::SeqCst);
            let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                counters: Arc::clone(&self.counters),
                delay: self.delay,
                open: true,
            }))
        }
    }

    fn pool(delay: Duration, cap: usize, render: Duration, idle: Duration) -> (SessionPool, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let factory = FakeFactory {
            counters: Arc::clone(&counters),
            delay,
        };
        (SessionPool::new(Box::new(factory), cap, render, idle), counters)
    }

    #[test]
    fn sessions_are_reused_for_same_identity() {
        let (pool, counters) = pool(Duration::ZERO, 1, Duration::from_secs(5), Duration::from_secs(60));
        let stop = AtomicBool::new(false);
        let id = ProxyIdentity::direct();
        for _ in 0..3 {
            let mut lease = pool.checkout(&id, &stop).unwrap();
            lease.render(&RenderRequest::new("https://a.test")).unwrap();
        }
        assert_eq!(counters.launched.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn new_identity_relaunches_session() {
        let (pool, counters) = pool(Duration::ZERO, 1, Duration::from_secs(5), Duration::from_secs(60));
        let stop = AtomicBool::new(false);
        let v0 = ProxyIdentity::direct();
        drop(pool.checkout(&v0, &stop).unwrap());
        let v1 = ProxyIdentity {
            version: 1,
            ..ProxyIdentity::direct()
        };
        let lease = pool.checkout(&v1, &stop).unwrap();
        assert_eq!(lease.identity_version(), Some(1));
        assert_eq!(counters.launched.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrency_is_capped_by_capacity() {
        let (pool, counters) = pool(
            Duration::from_millis(30),
            2,
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        let pool = Arc::new(pool);
        let stop = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let id = ProxyIdentity::direct();
                    let mut lease = pool.checkout(&id, &stop).unwrap();
                    lease.render(&RenderRequest::new("https://a.test")).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(counters.max_live.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.checked_out(), 0);
    }

    #[test]
    fn timed_out_session_is_discarded() {
        let (pool, counters) = pool(
            Duration::from_millis(50),
            1,
            Duration::from_millis(10),
            Duration::from_secs(60),
        );
        let stop = AtomicBool::new(false);
        let id = ProxyIdentity::direct();
        let mut lease = pool.checkout(&id, &stop).unwrap();
        let err = lease.render(&RenderRequest::new("https://slow.test")).unwrap_err();
        assert!(err.is_timeout());
        drop(lease);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn session_held_past_idle_timeout_is_force_closed() {
        let (pool, counters) = pool(
            Duration::ZERO,
            1,
            Duration::from_secs(5),
            Duration::from_millis(30),
        );
        let stop = AtomicBool::new(false);
        let id = ProxyIdentity::direct();
        let mut lease = pool.checkout(&id, &stop).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let err = lease.render(&RenderRequest::new("https://a.test")).unwrap_err();
        assert!(matches!(err, RenderError::IdleExpired(_)));
        assert!(err.is_timeout());
        drop(lease);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        // 名额已释放，下一次借出重新启动会话
        let _lease = pool.checkout(&id, &stop).unwrap();
        assert_eq!(counters.launched.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_flag_cancels_waiting_checkout() {
        let (pool, _) = pool(Duration::ZERO, 1, Duration::from_secs(5), Duration::from_secs(60));
        let stop = AtomicBool::new(false);
        let id = ProxyIdentity::direct();
        let _held = pool.checkout(&id, &stop).unwrap();
        stop.store(true, Ordering::SeqCst);
        assert!(matches!(pool.checkout(&id, &stop), Err(RenderError::Cancelled)));
    }
}
