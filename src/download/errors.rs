//! 单集任务的错误分类。

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::http::HttpError;

/// 写入运行摘要的失败原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Resolution,
    RenderTimeout,
    MediaNotFound,
    ChallengeUnsolved,
    NetworkTransient,
    HttpClient,
    RateLimited,
    Verification,
    Permission,
    DiskFull,
    Io,
    Cancelled,
}

impl ErrorKind {
    /// 可重试（仍受最大尝试次数限制）。
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::RenderTimeout
                | ErrorKind::MediaNotFound
                | ErrorKind::ChallengeUnsolved
                | ErrorKind::NetworkTransient
                | ErrorKind::RateLimited
                | ErrorKind::Verification
        )
    }

    /// 环境问题而非单集问题，多次出现时建议中止。
    pub fn is_environment(self) -> bool {
        matches!(self, ErrorKind::Permission | ErrorKind::DiskFull)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Resolution => "resolution",
            ErrorKind::RenderTimeout => "render_timeout",
            ErrorKind::MediaNotFound => "media_not_found",
            ErrorKind::ChallengeUnsolved => "challenge_unsolved",
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::HttpClient => "http_client",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Verification => "verification",
            ErrorKind::Permission => "permission",
            ErrorKind::DiskFull => "disk_full",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EpisodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EpisodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "interrupted")
    }

    pub fn verification(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Verification, message)
    }
}

/// 磁盘错误按 `io::ErrorKind` 与常见 errno 归类。
pub fn classify_io(err: &io::Error) -> ErrorKind {
    if err.kind() == io::ErrorKind::PermissionDenied
        || err.kind() == io::ErrorKind::ReadOnlyFilesystem
    {
        return ErrorKind::Permission;
    }
    // ENOSPC / EDQUOT / ERROR_DISK_FULL 都会映射到这两类
    if err.kind() == io::ErrorKind::StorageFull || err.kind() == io::ErrorKind::QuotaExceeded {
        return ErrorKind::DiskFull;
    }
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe => ErrorKind::NetworkTransient,
        _ => ErrorKind::Io,
    }
}

impl From<io::Error> for EpisodeError {
    fn from(err: io::Error) -> Self {
        Self::new(classify_io(&err), err.to_string())
    }
}

pub fn http_kind(err: &HttpError) -> ErrorKind {
    match err {
        HttpError::RateLimited { .. } => ErrorKind::RateLimited,
        HttpError::Server { .. } | HttpError::Transport(_) => ErrorKind::NetworkTransient,
        HttpError::NotFound { .. } | HttpError::Client { .. } => ErrorKind::HttpClient,
        HttpError::Build(_) => ErrorKind::Io,
    }
}

impl From<HttpError> for EpisodeError {
    fn from(err: HttpError) -> Self {
        Self::new(http_kind(&err), err.to_string())
    }
}
