//! 单集下载状态机与工作线程池。
//!
//! 每集：Resolving → Downloading → Verifying → Completed / Failed，
//! 瞬时错误回到 Resolving 重试（受最大尝试次数限制，指数退避 + 抖动）。

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as channel;
use tracing::{debug, info, warn};

use super::errors::{EpisodeError, ErrorKind};
use super::fetch::MediaFetcher;
use super::layout::{check_signature, remove_other_episode_files};
use super::models::{DownloadResult, EpisodeRef, EpisodeReport, TaskEvent, TaskState};
use super::record::{RecordEntry, sha256_file};
use crate::base_system::book_paths::{episode_file_name, ext_from_media_url, part_path};
use crate::base_system::context::Config;
use crate::base_system::cooldown_retry::{Backoff, sleep_interruptible};
use crate::challenge::SliderSolver;
use crate::network::http::HttpClients;
use crate::network::identity::ProxyIdentity;
use crate::render::SessionPool;
use crate::sites::{SiteAdapter, SiteContext};

/// 派发给 worker 的任务，附带派发时刻的身份快照。
#[derive(Debug, Clone)]
pub struct Job {
    pub episode: EpisodeRef,
    pub identity: Arc<ProxyIdentity>,
}

#[derive(Debug)]
pub enum WorkerMsg {
    Event(TaskEvent),
    Done {
        report: EpisodeReport,
        record: Option<RecordEntry>,
    },
}

/// 所有 worker 共享的只读设施。
pub struct WorkerShared {
    pub config: Arc<Config>,
    pub adapter: Arc<dyn SiteAdapter>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub http: Arc<HttpClients>,
    pub sessions: Option<Arc<SessionPool>>,
    pub solver: SliderSolver,
    pub book_dir: PathBuf,
    pub backoff: Backoff,
    /// 置位后进行中的任务尽快以 Cancelled 结束。
    pub interrupt: Arc<AtomicBool>,
}

struct Emitter<'a> {
    tx: &'a channel::Sender<WorkerMsg>,
    index: u32,
}

impl Emitter<'_> {
    fn emit(&self, state: TaskState, attempt: u32, err: Option<&EpisodeError>) {
        let _ = self.tx.send(WorkerMsg::Event(TaskEvent {
            index: self.index,
            state,
            attempt,
            reason: err.map(|e| e.kind),
            message: err.map(|e| e.message.clone()),
        }));
    }
}

struct Finished {
    path: PathBuf,
    bytes: u64,
    sha256: String,
}

fn attempt_once(
    shared: &WorkerShared,
    job: &Job,
    attempt: u32,
    em: &Emitter<'_>,
) -> Result<Finished, EpisodeError> {
    let stop = shared.interrupt.as_ref();
    if stop.load(Ordering::Relaxed) {
        return Err(EpisodeError::cancelled());
    }
    let ep = &job.episode;
    em.emit(TaskState::Resolving, attempt, None);
    let ctx = SiteContext {
        config: &shared.config,
        identity: Arc::clone(&job.identity),
        http: &shared.http,
        sessions: shared.sessions.as_deref(),
        solver: &shared.solver,
        stop,
    };
    let locator = shared.adapter.resolve_episode(&ctx, ep)?;

    let ext = ext_from_media_url(locator.primary_url());
    let final_path = shared
        .book_dir
        .join(episode_file_name(ep.index, &ep.title, ext));
    let part = part_path(&final_path);

    em.emit(TaskState::Downloading, attempt, None);
    let bytes = match shared.fetcher.fetch(&locator, &job.identity, &part, stop) {
        Ok(b) => b,
        Err(e) => {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
    };

    em.emit(TaskState::Verifying, attempt, None);
    if let Err(e) = verify_part(&part, bytes, locator.size_hint, shared.config.min_audio_bytes) {
        let _ = fs::remove_file(&part);
        return Err(e);
    }
    let sha256 = sha256_file(&part)?;
    if final_path.exists() {
        fs::remove_file(&final_path)?;
    }
    fs::rename(&part, &final_path)?;
    if let Err(e) = remove_other_episode_files(&shared.book_dir, ep.index, &final_path) {
        warn!(target: "download", index = ep.index, "could not remove stale episode files: {e}");
    }
    Ok(Finished {
        path: final_path,
        bytes,
        sha256,
    })
}

fn verify_part(
    part: &Path,
    bytes: u64,
    size_hint: Option<u64>,
    min_bytes: u64,
) -> Result<(), EpisodeError> {
    if let Some(expected) = size_hint
        && expected != bytes
    {
        return Err(EpisodeError::verification(format!(
            "size mismatch: expected {expected}, got {bytes}"
        )));
    }
    check_signature(part, min_bytes)
        .map(|_| ())
        .map_err(|reason| EpisodeError::verification(format!("downloaded file rejected: {reason:?}")))
}

/// 跑完一集的全部尝试，返回最终报告与（成功时的）记录项。
pub fn run_episode(
    shared: &WorkerShared,
    job: &Job,
    tx: &channel::Sender<WorkerMsg>,
) -> (EpisodeReport, Option<RecordEntry>) {
    let ep = &job.episode;
    let em = Emitter { tx, index: ep.index };
    let max_attempts = shared.config.max_attempts.max(1);
    let mut attempt = 0u32;

    let (result, record) = loop {
        attempt += 1;
        match attempt_once(shared, job, attempt, &em) {
            Ok(done) => {
                info!(target: "download", index = ep.index, attempt, bytes = done.bytes, "episode completed");
                em.emit(TaskState::Completed, attempt, None);
                let record = RecordEntry {
                    index: ep.index,
                    title: ep.title.clone(),
                    file: done
                        .path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default()
                        .to_string(),
                    bytes: done.bytes,
                    sha256: done.sha256,
                };
                break (
                    DownloadResult::Completed {
                        path: done.path,
                        bytes: done.bytes,
                    },
                    Some(record),
                );
            }
            Err(e) if e.kind == ErrorKind::Cancelled => {
                em.emit(TaskState::Cancelled, attempt, Some(&e));
                break (DownloadResult::Cancelled, None);
            }
            Err(e) if e.kind.is_transient() && attempt < max_attempts => {
                let delay = shared.backoff.delay(attempt);
                warn!(
                    target: "download",
                    index = ep.index,
                    attempt,
                    reason = %e.kind,
                    ?delay,
                    "transient failure, retrying: {}",
                    e.message
                );
                em.emit(TaskState::Retrying, attempt, Some(&e));
                if !sleep_interruptible(delay, &shared.interrupt) {
                    let cancelled = EpisodeError::cancelled();
                    em.emit(TaskState::Cancelled, attempt, Some(&cancelled));
                    break (DownloadResult::Cancelled, None);
                }
            }
            Err(e) => {
                let exhausted = e.kind.is_transient();
                warn!(
                    target: "download",
                    index = ep.index,
                    attempt,
                    reason = %e.kind,
                    exhausted,
                    "episode failed: {}",
                    e.message
                );
                em.emit(TaskState::Failed, attempt, Some(&e));
                break (
                    DownloadResult::Failed {
                        reason: e.kind,
                        message: e.message,
                        attempts_exhausted: exhausted,
                    },
                    None,
                );
            }
        }
    };

    (
        EpisodeReport {
            index: ep.index,
            title: ep.title.clone(),
            attempts: attempt,
            result,
        },
        record,
    )
}

fn panicked_report(ep: &EpisodeRef) -> EpisodeReport {
    warn!(target: "download", index = ep.index, "worker panicked while running episode");
    EpisodeReport {
        index: ep.index,
        title: ep.title.clone(),
        attempts: 0,
        result: DownloadResult::Failed {
            reason: ErrorKind::Io,
            message: "worker panicked".into(),
            attempts_exhausted: false,
        },
    }
}

/// 固定数量的工作线程，从任务通道取 `Job`，结果经消息通道回传。
pub struct EpisodePool {
    tx: Option<channel::Sender<Job>>,
    rx_msg: channel::Receiver<WorkerMsg>,
    handles: Vec<JoinHandle<()>>,
}

impl EpisodePool {
    pub fn new(shared: Arc<WorkerShared>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = channel::unbounded::<Job>();
        let (tx_msg, rx_msg) = channel::unbounded::<WorkerMsg>();

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let rx = rx.clone();
            let tx_msg = tx_msg.clone();
            let shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("episode-worker-{n}"))
                .spawn(move || {
                    loop {
                        let job = match rx.recv_timeout(Duration::from_millis(200)) {
                            Ok(job) => job,
                            Err(channel::RecvTimeoutError::Timeout) => continue,
                            Err(channel::RecvTimeoutError::Disconnected) => return,
                        };
                        debug!(target: "download", index = job.episode.index, identity = %job.identity.label(), "job picked up");
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            run_episode(&shared, &job, &tx_msg)
                        }));
                        let (report, record) = match outcome {
                            Ok(done) => done,
                            Err(_) => (panicked_report(&job.episode), None),
                        };
                        let _ = tx_msg.send(WorkerMsg::Done { report, record });
                    }
                });
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => warn!(target: "download", "failed to spawn worker {n}: {e}"),
            }
        }

        Self {
            tx: Some(tx),
            rx_msg,
            handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// 还有未退出的 worker。
    pub fn alive(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    pub fn submit(&self, job: Job) -> bool {
        match &self.tx {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerMsg> {
        self.rx_msg.recv_timeout(timeout).ok()
    }

    pub fn try_iter(&self) -> impl Iterator<Item = WorkerMsg> + '_ {
        self.rx_msg.try_iter()
    }

    /// 关闭任务通道并等待所有 worker 退出，返回剩余消息。
    pub fn shutdown(&mut self) -> Vec<WorkerMsg> {
        self.tx.take();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
        self.rx_msg.try_iter().collect()
    }
}

impl Drop for EpisodePool {
    fn drop(&mut self) {
        self.tx.take();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}
