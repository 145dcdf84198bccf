//! 重试退避：指数增长、封顶、随机抖动，以及可被中断的等待。
//! 另有派发节奏 `Pacer`：两集之间的随机间隔与批次休息，遇到限流后转为保守档。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use super::context::Config;

const SLEEP_SLICE_MS: u64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    pub fn from_config(cfg: &Config) -> Self {
        let min_ms = cfg.min_wait_time.max(1);
        Self {
            min_ms,
            max_ms: cfg.max_wait_time.max(min_ms),
        }
    }

    /// 第 `attempt` 次失败后的基础等待（不含抖动），`attempt` 从 1 开始。
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let wait = self.min_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(wait)
    }

    /// 基础等待 + 最多 50% 的随机抖动。
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_cap = (base.as_millis() as u64) / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }
}

/// 快速档的间隔参数，单位 ms。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min_ms: u64,
    pub max_ms: u64,
    pub batch_every: usize,
    pub batch_min_ms: u64,
    pub batch_max_ms: u64,
}

impl Pacing {
    /// 保守档：间隔翻倍，批次变密，休息更长，再乘以限流倍率。
    fn conservative(self, rate_limits: u32) -> Self {
        // 倍率 1.0 / 1.5 / 2.0 / 2.5，以 0.5 为单位计
        let halves = 2 + u64::from(rate_limits.min(3));
        let scale = |ms: u64| ms.saturating_mul(2).saturating_mul(halves) / 2;
        Self {
            min_ms: scale(self.min_ms),
            max_ms: scale(self.max_ms),
            batch_every: match self.batch_every {
                0 => 0,
                n => (n * 2 / 3).max(1),
            },
            batch_min_ms: scale(self.batch_min_ms),
            batch_max_ms: scale(self.batch_max_ms.saturating_add(self.batch_max_ms / 5)),
        }
    }
}

/// 派发节奏。未遇到限流时用快速档，记录过限流后一直用保守档。
#[derive(Debug, Clone)]
pub struct Pacer {
    fast: Option<Pacing>,
    rate_limits: u32,
}

impl Pacer {
    pub fn from_config(cfg: &Config) -> Self {
        if !cfg.pacing {
            return Self::disabled();
        }
        Self::new(Pacing {
            min_ms: cfg.pace_min_ms,
            max_ms: cfg.pace_max_ms.max(cfg.pace_min_ms),
            batch_every: cfg.pace_batch_every,
            batch_min_ms: cfg.pace_batch_min_ms,
            batch_max_ms: cfg.pace_batch_max_ms.max(cfg.pace_batch_min_ms),
        })
    }

    pub fn new(fast: Pacing) -> Self {
        Self {
            fast: Some(fast),
            rate_limits: 0,
        }
    }

    pub fn disabled() -> Self {
        Self {
            fast: None,
            rate_limits: 0,
        }
    }

    pub fn record_rate_limit(&mut self) {
        self.rate_limits = self.rate_limits.saturating_add(1);
    }

    pub fn is_conservative(&self) -> bool {
        self.rate_limits > 0
    }

    /// 当前生效的参数；关闭时为 None。
    pub fn current(&self) -> Option<Pacing> {
        let fast = self.fast?;
        Some(if self.rate_limits == 0 {
            fast
        } else {
            fast.conservative(self.rate_limits)
        })
    }

    /// 第 `dispatched` 集派发之后、下一集派发之前的等待。
    pub fn gap(&self, dispatched: usize) -> Duration {
        let Some(p) = self.current() else {
            return Duration::ZERO;
        };
        let (lo, hi) = if p.batch_every > 0 && dispatched > 0 && dispatched % p.batch_every == 0 {
            (p.batch_min_ms, p.batch_max_ms)
        } else {
            (p.min_ms, p.max_ms)
        };
        if hi <= lo {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// 分片睡眠，`stop` 置位后尽快返回。返回 `false` 表示被中断。
pub fn sleep_interruptible(total: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let left = deadline - now;
        std::thread::sleep(left.min(Duration::from_millis(SLEEP_SLICE_MS)));
    }
}
