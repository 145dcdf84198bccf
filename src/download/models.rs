//! 下载相关的数据模型定义。
//!
//! 包含书籍元数据、单集引用、媒体定位、任务状态事件、下载计划与运行摘要。

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRef {
    /// 从 1 开始，跨运行稳定。
    pub index: u32,
    pub title: String,
    pub url: String,
}

impl PartialEq for EpisodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for EpisodeRef {}

impl PartialOrd for EpisodeRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EpisodeRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    pub source_url: String,
    pub site: String,
    pub author: Option<String>,
    pub cover_url: Option<String>,
    pub episodes: Vec<EpisodeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSegment {
    pub url: String,
    /// 闭区间字节范围，`None` 表示整段。
    pub range: Option<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Direct(String),
    Segments(Vec<MediaSegment>),
}

/// `resolve_episode` 的结果：媒体地址以及下载时需要附带的信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLocator {
    pub source: MediaSource,
    pub size_hint: Option<u64>,
    pub referer: Option<String>,
    /// 预先拼好的 `Cookie` 头。
    pub cookies: Option<String>,
}

impl MediaLocator {
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            source: MediaSource::Direct(url.into()),
            size_hint: None,
            referer: None,
            cookies: None,
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// 用于推断扩展名的主地址。
    pub fn primary_url(&self) -> &str {
        match &self.source {
            MediaSource::Direct(u) => u,
            MediaSource::Segments(segs) => segs.first().map(|s| s.url.as_str()).unwrap_or(""),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Resolving,
    Downloading,
    Verifying,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskState::Pending => "等待",
            TaskState::Resolving => "解析",
            TaskState::Downloading => "下载",
            TaskState::Verifying => "校验",
            TaskState::Retrying => "重试",
            TaskState::Completed => "完成",
            TaskState::Failed => "失败",
            TaskState::Cancelled => "取消",
        }
    }
}

/// 单集状态迁移事件，供进度显示使用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub index: u32,
    pub state: TaskState,
    pub attempt: u32,
    pub reason: Option<ErrorKind>,
    pub message: Option<String>,
}

pub type EventSink = Box<dyn FnMut(&TaskEvent) + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadResult {
    Completed {
        path: PathBuf,
        bytes: u64,
    },
    Failed {
        reason: ErrorKind,
        message: String,
        attempts_exhausted: bool,
    },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeReport {
    pub index: u32,
    pub title: String,
    pub attempts: u32,
    pub result: DownloadResult,
}

impl EpisodeReport {
    pub fn final_state(&self) -> TaskState {
        match self.result {
            DownloadResult::Completed { .. } => TaskState::Completed,
            DownloadResult::Failed { .. } => TaskState::Failed,
            DownloadResult::Cancelled => TaskState::Cancelled,
        }
    }
}

/// 闭区间的集数过滤，缺省端表示不限。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpisodeRange {
    pub start: Option<u32>,
    pub end: Option<u32>,
}

impl EpisodeRange {
    pub fn new(start: Option<u32>, end: Option<u32>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.start.is_none_or(|s| index >= s) && self.end.is_none_or(|e| index <= e)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub book: BookMetadata,
    pub book_dir: PathBuf,
    /// 待下载（缺失优先、按索引升序）。
    pub tasks: Vec<EpisodeRef>,
    /// 已存在且通过校验的集，不会被调度。
    pub present: Vec<u32>,
    /// 站点缺失的集号。
    pub omitted: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub book_title: String,
    pub episodes: Vec<EpisodeReport>,
    pub skipped: Vec<u32>,
    pub omitted: Vec<u32>,
    pub not_started: Vec<u32>,
    pub rotations: usize,
    pub rotation_degraded: usize,
    pub aborted: bool,
    pub abort_recommended: bool,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.count(TaskState::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskState::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(TaskState::Cancelled)
    }

    fn count(&self, state: TaskState) -> usize {
        self.episodes
            .iter()
            .filter(|e| e.final_state() == state)
            .count()
    }

    pub fn failed_indices(&self) -> Vec<u32> {
        self.episodes
            .iter()
            .filter(|e| e.final_state() == TaskState::Failed)
            .map(|e| e.index)
            .collect()
    }

    pub fn failure_reasons(&self) -> BTreeMap<ErrorKind, usize> {
        let mut out = BTreeMap::new();
        for e in &self.episodes {
            if let DownloadResult::Failed { reason, .. } = e.result {
                *out.entry(reason).or_insert(0) += 1;
            }
        }
        out
    }

    pub fn report(&self, index: u32) -> Option<&EpisodeReport> {
        self.episodes.iter().find(|e| e.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episodes_compare_by_index_only() {
        let a = EpisodeRef {
            index: 2,
            title: "b".into(),
            url: "u1".into(),
        };
        let b = EpisodeRef {
            index: 2,
            title: "other".into(),
            url: "u2".into(),
        };
        let c = EpisodeRef {
            index: 1,
            title: "z".into(),
            url: "u3".into(),
        };
        assert_eq!(a, b);
        let mut v = vec![a, c];
        v.sort();
        assert_eq!(v[0].index, 1);
    }

    #[test]
    fn range_is_inclusive() {
        let r = EpisodeRange::new(Some(3), Some(5));
        assert!(!r.contains(2));
        assert!(r.contains(3));
        assert!(r.contains(5));
        assert!(!r.contains(6));
        assert!(EpisodeRange::default().contains(999));
    }

    #[test]
    fn summary_groups_failures_by_reason() {
        let fail = |index, reason| EpisodeReport {
            index,
            title: String::new(),
            attempts: 3,
            result: DownloadResult::Failed {
                reason,
                message: String::new(),
                attempts_exhausted: true,
            },
        };
        let summary = RunSummary {
            episodes: vec![
                fail(4, ErrorKind::RenderTimeout),
                fail(6, ErrorKind::RenderTimeout),
                fail(9, ErrorKind::HttpClient),
                EpisodeReport {
                    index: 5,
                    title: String::new(),
                    attempts: 1,
                    result: DownloadResult::Completed {
                        path: PathBuf::from("x"),
                        bytes: 1,
                    },
                },
            ],
            ..RunSummary::default()
        };
        assert_eq!(summary.completed(), 1);
        assert_eq!(summary.failed_indices(), vec![4, 6, 9]);
        assert_eq!(summary.failure_reasons()[&ErrorKind::RenderTimeout], 2);
    }
}
