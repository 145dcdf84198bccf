//! CLI 进度条：把任务事件流渲染成一条 indicatif 进度条。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::models::{EventSink, TaskEvent, TaskState};

/// 进度条计数：终态数 / 任务数，消息为最近一次状态变化。
#[derive(Debug, Default)]
pub(crate) struct ProgressTally {
    states: BTreeMap<u32, TaskState>,
    done: u64,
}

impl ProgressTally {
    /// 记录一次状态变化；返回该任务是否刚进入终态。
    pub(crate) fn apply(&mut self, ev: &TaskEvent) -> bool {
        let prev = self.states.insert(ev.index, ev.state);
        let was_terminal = prev.is_some_and(TaskState::is_terminal);
        if ev.state.is_terminal() && !was_terminal {
            self.done += 1;
            return true;
        }
        false
    }

    pub(crate) fn done(&self) -> u64 {
        self.done
    }
}

fn describe(ev: &TaskEvent) -> String {
    match (ev.state, ev.reason) {
        (TaskState::Retrying | TaskState::Failed, Some(reason)) => {
            format!("#{:04} {} ({reason}, 第 {} 次)", ev.index, ev.state.label(), ev.attempt)
        }
        (TaskState::Pending, _) => format!("#{:04} {}", ev.index, ev.state.label()),
        _ => format!("#{:04} {} (第 {} 次)", ev.index, ev.state.label(), ev.attempt),
    }
}

/// 进度条句柄；`sink()` 交给引擎，运行结束后调用 `finish()`。
pub struct ProgressDisplay {
    bar: ProgressBar,
    tally: Arc<Mutex<ProgressTally>>,
}

impl ProgressDisplay {
    pub fn new(total: usize) -> Self {
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        bar.set_style(style);
        bar.set_prefix("下载");
        Self {
            bar,
            tally: Arc::new(Mutex::new(ProgressTally::default())),
        }
    }

    pub fn sink(&self) -> EventSink {
        let bar = self.bar.clone();
        let tally = Arc::clone(&self.tally);
        Box::new(move |ev: &TaskEvent| {
            let mut t = match tally.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if t.apply(ev) {
                bar.set_position(t.done());
            }
            if ev.state != TaskState::Pending {
                bar.set_message(describe(ev));
            }
        })
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
