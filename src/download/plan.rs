//! 下载计划：解析书籍目录、校验集号序列、按磁盘现状生成缺失优先的任务表。

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info};

use crate::sites::{ResolutionError, SiteAdapter, SiteContext, SiteError};

use super::layout::{IntegrityCheck, MissingReason, Presence};
use super::models::{BookMetadata, EpisodeRange, EpisodeRef};

/// 单次解析书籍（不在此层重试）并校验集号。返回元数据与站点缺失的集号。
pub fn resolve_book(
    adapter: &dyn SiteAdapter,
    ctx: &SiteContext<'_>,
    url: &str,
) -> Result<(BookMetadata, Vec<u32>), SiteError> {
    info!(target: "plan", site = adapter.name(), url, "resolving book");
    let mut book = adapter.resolve_book(ctx, url)?;
    if book.site.is_empty() {
        book.site = adapter.name().to_string();
    }
    let omitted = validate_episodes(&mut book.episodes)?;
    info!(
        target: "plan",
        title = %book.title,
        episodes = book.episodes.len(),
        omitted = omitted.len(),
        "book resolved"
    );
    Ok((book, omitted))
}

/// 集号必须从 1 开始且唯一；中间缺号记为站点缺失，不重新编号。
pub fn validate_episodes(episodes: &mut [EpisodeRef]) -> Result<Vec<u32>, ResolutionError> {
    if episodes.is_empty() {
        return Err(ResolutionError::InvalidEpisodes("episode list is empty".into()));
    }
    episodes.sort();
    let mut seen = BTreeSet::new();
    for ep in episodes.iter() {
        if ep.index == 0 {
            return Err(ResolutionError::InvalidEpisodes(format!(
                "episode index 0 ({})",
                ep.title
            )));
        }
        if !seen.insert(ep.index) {
            return Err(ResolutionError::InvalidEpisodes(format!(
                "duplicate episode index {}",
                ep.index
            )));
        }
    }
    let max = episodes.last().map(|e| e.index).unwrap_or(0);
    Ok((1..=max).filter(|i| !seen.contains(i)).collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub tasks: Vec<EpisodeRef>,
    pub present: Vec<u32>,
}

/// 按磁盘现状分类：已存在的集只记入 `present`，缺失或损坏的集按升序进入任务表。
/// `force` 时范围内全部重新下载。
pub fn plan_resume(
    book: &BookMetadata,
    book_dir: &Path,
    range: EpisodeRange,
    force: bool,
    check: &IntegrityCheck<'_>,
) -> ResumePlan {
    let mut in_range: Vec<&EpisodeRef> = book
        .episodes
        .iter()
        .filter(|e| range.contains(e.index))
        .collect();
    in_range.sort();

    let mut tasks = Vec::new();
    let mut present = Vec::new();
    for ep in in_range {
        if force {
            tasks.push(ep.clone());
            continue;
        }
        match check.classify(book_dir, ep) {
            Presence::Present(_) => present.push(ep.index),
            Presence::Missing(reason) => {
                if reason != MissingReason::NoFile {
                    debug!(target: "plan", index = ep.index, ?reason, "existing file rejected");
                }
                tasks.push(ep.clone());
            }
        }
    }
    info!(
        target: "plan",
        missing = tasks.len(),
        present = present.len(),
        force,
        "resume plan ready"
    );
    ResumePlan { tasks, present }
}
