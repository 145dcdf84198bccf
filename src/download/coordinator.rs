//! 下载协调：按缺失优先顺序派发任务、定时轮换身份、处理中止。
//!
//! 所有调度决定都在调用线程上做出；worker 只负责执行单集并回报事件。
//! 每处理一条完成消息就检查是否跨过轮换检查点，轮换在调用线程上同步完成，
//! 所以不会与自身并发，也不会和下一次派发交错。
//! 派发之间按 `Pacer` 留出间隔，收到限流错误后转为保守节奏。

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::models::{
    DownloadResult, EpisodeRef, EpisodeReport, EventSink, TaskEvent, TaskState,
};
use super::errors::ErrorKind;
use super::record::DownloadRecord;
use super::worker::{EpisodePool, Job, WorkerMsg, WorkerShared};
use crate::base_system::context::Config;
use crate::base_system::cooldown_retry::Pacer;
use crate::network::identity::{IdentityManager, ProxyMode, RotationOutcome};

const POLL: Duration = Duration::from_millis(200);
/// 超过该值的节奏等待记一条 info 日志。
const LONG_PAUSE: Duration = Duration::from_secs(10);

/// auto 模式 + 控制接口且未配置轮换间隔时的默认值。
pub const AUTO_ROTATE_EVERY: usize = 15;

/// 每多少个终态任务轮换一次；0 表示不轮换。
pub fn effective_rotate_every(cfg: &Config, identity: &IdentityManager) -> usize {
    if cfg.rotate_every > 0 {
        return cfg.rotate_every;
    }
    if identity.mode() == ProxyMode::Auto && identity.has_controller() {
        AUTO_ROTATE_EVERY
    } else {
        0
    }
}

#[derive(Debug, Default)]
pub struct CoordinatorOutcome {
    pub reports: Vec<EpisodeReport>,
    pub not_started: Vec<u32>,
    pub rotations: usize,
    pub rotation_degraded: usize,
    pub aborted: bool,
    pub abort_recommended: bool,
}

/// 轮换节奏：每跨过一个 `every` 的整数倍检查点就欠一次轮换。
#[derive(Debug, Clone, Copy)]
struct RotationSchedule {
    every: usize,
    done: usize,
}

impl RotationSchedule {
    fn new(every: usize) -> Self {
        Self { every, done: 0 }
    }

    /// 已跨过但尚未执行的轮换次数。
    fn owed(&self, terminal: usize) -> usize {
        if self.every == 0 {
            return 0;
        }
        (terminal / self.every).saturating_sub(self.done)
    }

    fn mark_done(&mut self) {
        self.done += 1;
    }
}

pub struct Coordinator<'a> {
    pub shared: Arc<WorkerShared>,
    pub identity: &'a IdentityManager,
    pub workers: usize,
    pub rotate_every: usize,
    /// 操作者中止：停止派发。
    pub abort: Arc<AtomicBool>,
    pub grace: Duration,
    pub env_error_threshold: usize,
    pub abort_on_env_errors: bool,
}

struct RunState {
    sink: Option<EventSink>,
    record: DownloadRecord,
    reports: Vec<EpisodeReport>,
    /// 尚未派发的任务数。
    queued: usize,
    in_flight: usize,
    terminal: usize,
    env_errors: usize,
    abort_recommended: bool,
    schedule: RotationSchedule,
    rotations: usize,
    degraded: usize,
    pacer: Pacer,
    dispatched: usize,
    next_dispatch: Instant,
}

impl RunState {
    fn emit(&mut self, ev: &TaskEvent) {
        if let Some(sink) = self.sink.as_mut() {
            sink(ev);
        }
    }
}

impl Coordinator<'_> {
    pub fn run(
        &self,
        tasks: &[EpisodeRef],
        record: DownloadRecord,
        sink: Option<EventSink>,
    ) -> CoordinatorOutcome {
        let mut queue: VecDeque<EpisodeRef> = tasks.iter().cloned().collect();
        let mut st = RunState {
            sink,
            record,
            reports: Vec::with_capacity(tasks.len()),
            queued: queue.len(),
            in_flight: 0,
            terminal: 0,
            env_errors: 0,
            abort_recommended: false,
            schedule: RotationSchedule::new(self.rotate_every),
            rotations: 0,
            degraded: 0,
            pacer: Pacer::from_config(&self.shared.config),
            dispatched: 0,
            next_dispatch: Instant::now(),
        };
        for ep in &queue {
            st.emit(&TaskEvent {
                index: ep.index,
                state: TaskState::Pending,
                attempt: 0,
                reason: None,
                message: None,
            });
        }

        let mut pool = EpisodePool::new(Arc::clone(&self.shared), self.workers);
        let slots = pool.worker_count().max(1);

        info!(
            target: "download",
            tasks = queue.len(),
            workers = slots,
            rotate_every = self.rotate_every,
            pacing = st.pacer.current().is_some(),
            "dispatch started"
        );

        while !queue.is_empty() {
            self.drain(&pool, &mut st, None);
            if self.aborted() {
                break;
            }
            if st.in_flight >= slots {
                if !pool.alive() {
                    warn!(target: "download", "all workers stopped, dispatch halted");
                    break;
                }
                self.drain(&pool, &mut st, Some(POLL));
                continue;
            }
            let now = Instant::now();
            if now < st.next_dispatch {
                // 节奏等待期间照常处理回报，中止在下一轮生效
                let wait = POLL.min(st.next_dispatch - now);
                self.drain(&pool, &mut st, Some(wait));
                continue;
            }
            let Some(episode) = queue.pop_front() else {
                break;
            };
            let job = Job {
                episode: episode.clone(),
                identity: self.identity.snapshot(),
            };
            if pool.submit(job) {
                st.queued = queue.len();
                st.in_flight += 1;
                st.dispatched += 1;
                let gap = st.pacer.gap(st.dispatched);
                if gap >= LONG_PAUSE {
                    info!(target: "download", dispatched = st.dispatched, ?gap, "pausing dispatch against rate limiting");
                }
                st.next_dispatch = Instant::now() + gap;
            } else {
                warn!(target: "download", index = episode.index, "worker pool closed, task not dispatched");
                queue.push_front(episode);
                break;
            }
        }

        let aborted = self.aborted();
        let not_started: Vec<u32> = queue.iter().map(|e| e.index).collect();
        st.queued = 0;
        if aborted && !not_started.is_empty() {
            info!(target: "download", remaining = not_started.len(), "dispatch stopped by abort");
        }

        if aborted {
            // 宽限期内让在途任务自然结束，超时后打断
            let deadline = Instant::now() + self.grace;
            loop {
                let now = Instant::now();
                if st.in_flight == 0 || now >= deadline {
                    break;
                }
                self.drain(&pool, &mut st, Some(POLL.min(deadline - now)));
            }
            if st.in_flight > 0 {
                warn!(target: "download", in_flight = st.in_flight, "grace period over, interrupting workers");
            }
            self.shared.interrupt.store(true, Ordering::SeqCst);
        }
        while st.in_flight > 0 && pool.alive() {
            self.drain(&pool, &mut st, Some(POLL));
        }
        for msg in pool.shutdown() {
            self.handle(msg, &mut st);
        }
        st.reports.sort_by_key(|r| r.index);
        CoordinatorOutcome {
            reports: st.reports,
            not_started,
            rotations: st.rotations,
            rotation_degraded: st.degraded,
            aborted,
            abort_recommended: st.abort_recommended,
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// `wait` 为 None 时只取已到达的消息。每条消息处理完立即补上欠下的轮换。
    fn drain(&self, pool: &EpisodePool, st: &mut RunState, wait: Option<Duration>) {
        if let Some(timeout) = wait {
            match pool.recv_timeout(timeout) {
                Some(msg) => {
                    self.handle(msg, st);
                    self.rotate_if_owed(st);
                }
                None => return,
            }
        }
        for msg in pool.try_iter() {
            self.handle(msg, st);
            self.rotate_if_owed(st);
        }
    }

    /// 还有任务在跑或待派发时才轮换；最后一集结束后不再轮换。
    fn rotate_if_owed(&self, st: &mut RunState) {
        while st.schedule.owed(st.terminal) > 0 {
            if self.aborted() || (st.in_flight == 0 && st.queued == 0) {
                return;
            }
            st.schedule.mark_done();
            match self.identity.rotate() {
                Ok(RotationOutcome::Rotated { version, .. }) => {
                    st.rotations += 1;
                    info!(target: "proxy", version, terminal = st.terminal, "rotation before further dispatch");
                }
                Ok(RotationOutcome::Unsupported) => {
                    debug!(target: "proxy", "rotation not supported in current mode");
                }
                Err(e) => {
                    st.degraded += 1;
                    warn!(target: "proxy", "{e}");
                }
            }
        }
    }

    fn handle(&self, msg: WorkerMsg, st: &mut RunState) {
        match msg {
            WorkerMsg::Event(ev) => {
                if ev.reason == Some(ErrorKind::RateLimited) {
                    if !st.pacer.is_conservative() {
                        warn!(target: "download", index = ev.index, "rate limited, switching to conservative pacing");
                    }
                    st.pacer.record_rate_limit();
                }
                st.emit(&ev);
            }
            WorkerMsg::Done { report, record } => {
                st.in_flight = st.in_flight.saturating_sub(1);
                match &report.result {
                    DownloadResult::Completed { .. } => st.terminal += 1,
                    DownloadResult::Failed { reason, .. } => {
                        st.terminal += 1;
                        if reason.is_environment() {
                            st.env_errors += 1;
                            self.note_env_error(st, report.index);
                        }
                    }
                    DownloadResult::Cancelled => {}
                }
                if let Some(entry) = record {
                    st.record.upsert(entry);
                    save_record(&st.record, &self.shared.book_dir);
                }
                st.reports.push(report);
            }
        }
    }

    fn note_env_error(&self, st: &mut RunState, index: u32) {
        if self.env_error_threshold == 0 || st.env_errors < self.env_error_threshold {
            return;
        }
        if !st.abort_recommended {
            warn!(
                target: "download",
                index,
                count = st.env_errors,
                "repeated disk/permission failures, aborting is recommended"
            );
        }
        st.abort_recommended = true;
        if self.abort_on_env_errors && !self.aborted() {
            warn!(target: "download", "aborting run after environment errors");
            self.abort.store(true, Ordering::SeqCst);
        }
    }
}

fn save_record(record: &DownloadRecord, book_dir: &Path) {
    if let Err(e) = record.save(book_dir) {
        warn!(target: "download", "failed to update download record: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_schedule(s: &mut RotationSchedule, terminal: usize) -> usize {
        let mut n = 0;
        while s.owed(terminal) > 0 {
            s.mark_done();
            n += 1;
        }
        n
    }

    #[test]
    fn schedule_owes_one_rotation_per_checkpoint() {
        let mut s = RotationSchedule::new(3);
        let fired: Vec<usize> = (0..=7).filter(|&t| run_schedule(&mut s, t) > 0).collect();
        assert_eq!(fired, vec![3, 6]);
    }

    #[test]
    fn crossed_checkpoints_are_not_merged() {
        let mut s = RotationSchedule::new(2);
        assert_eq!(s.owed(1), 0);
        // 一次跨过两个检查点，两次轮换都要补上
        assert_eq!(s.owed(5), 2);
        assert_eq!(run_schedule(&mut s, 5), 2);
        assert_eq!(s.owed(5), 0);
        assert_eq!(s.owed(6), 1);
    }

    #[test]
    fn disabled_schedule_never_fires() {
        let s = RotationSchedule::new(0);
        assert!((0..20).all(|t| s.owed(t) == 0));
    }

    #[test]
    fn auto_mode_with_controller_defaults_to_fifteen() {
        let cfg = Config::default();
        let direct = IdentityManager::direct();
        assert_eq!(effective_rotate_every(&cfg, &direct), 0);
        let cfg = Config {
            rotate_every: 4,
            ..Config::default()
        };
        assert_eq!(effective_rotate_every(&cfg, &direct), 4);
    }
}
