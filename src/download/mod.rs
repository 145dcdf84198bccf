//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`       — 数据模型（EpisodeRef / DownloadPlan / RunSummary 等）
//! - `errors`       — 单集错误分类
//! - `layout`       — 输出目录布局与完整性检查
//! - `record`       — 下载记录与原子写入
//! - `plan`         — 书籍解析与缺失优先的任务表
//! - `fetch`        — 媒体字节流下载
//! - `worker`       — 单集状态机与工作线程池
//! - `coordinator`  — 派发、身份轮换、中止
//! - `progress`     — CLI 进度条
//! - `downloader`   — 引擎入口

pub mod coordinator;
pub mod downloader;
pub mod errors;
pub mod fetch;
pub mod layout;
pub mod models;
pub mod plan;
pub mod progress;
pub mod record;
pub mod worker;

pub use downloader::{AbortHandle, Engine};
