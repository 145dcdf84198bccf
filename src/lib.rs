//! ting-mirror：有声书站点的整书下载引擎。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/重试/路径等基础设施
//! - `network`：出口身份与轮换、代理探测、HTTP 客户端
//! - `render`：无头浏览器渲染会话池
//! - `challenge`：滑块验证码求解
//! - `sites`：站点适配器（ting13 / huanting）
//! - `download`：计划、工作池、协调器与引擎入口

pub mod base_system;
pub mod challenge;
pub mod download;
pub mod network;
pub mod render;
pub mod sites;

pub use base_system::context::Config;
pub use download::errors::{EpisodeError, ErrorKind};
pub use download::models::{
    BookMetadata, DownloadPlan, DownloadResult, EpisodeRange, EpisodeRef, EpisodeReport,
    EventSink, MediaLocator, RunSummary, TaskEvent, TaskState,
};
pub use download::{AbortHandle, Engine};
pub use network::identity::{IdentityManager, ProxyIdentity, RotationDegraded};
pub use sites::{SiteAdapter, SiteContext, SiteError, SiteRegistry};
