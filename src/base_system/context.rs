//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 保存配置
    #[serde(default)]
    pub save_path: String,
    #[serde(default = "default_true")]
    pub download_cover: bool,
    #[serde(default = "default_integrity")]
    pub integrity: String,
    #[serde(default = "default_min_audio_bytes")]
    pub min_audio_bytes: u64,

    // 调度配置
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_wait_time")]
    pub min_wait_time: u64,
    #[serde(default = "default_max_wait_time")]
    pub max_wait_time: u64,
    #[serde(default = "default_abort_grace")]
    pub abort_grace: u64,
    #[serde(default = "default_env_error_threshold")]
    pub env_error_threshold: usize,
    #[serde(default)]
    pub abort_on_env_errors: bool,
    #[serde(default = "default_true")]
    pub pacing: bool,
    #[serde(default = "default_pace_min_ms")]
    pub pace_min_ms: u64,
    #[serde(default = "default_pace_max_ms")]
    pub pace_max_ms: u64,
    #[serde(default = "default_pace_batch_every")]
    pub pace_batch_every: usize,
    #[serde(default = "default_pace_batch_min_ms")]
    pub pace_batch_min_ms: u64,
    #[serde(default = "default_pace_batch_max_ms")]
    pub pace_batch_max_ms: u64,

    // 网络配置
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_true")]
    pub cdn_direct: bool,
    #[serde(default = "default_cdn_domains")]
    pub cdn_domains: Vec<String>,

    // 代理配置
    #[serde(default = "default_proxy_mode")]
    pub proxy_mode: String,
    #[serde(default)]
    pub proxy_address: String,
    #[serde(default)]
    pub proxy_candidates: Vec<String>,
    #[serde(default)]
    pub controller_url: String,
    #[serde(default)]
    pub controller_secret: String,
    #[serde(default)]
    pub rotate_every: usize,
    #[serde(default = "default_rotation_probe_attempts")]
    pub rotation_probe_attempts: usize,
    #[serde(default = "default_rotation_timeout")]
    pub rotation_timeout: u64,

    // 渲染配置
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_render_sessions")]
    pub render_sessions: usize,
    #[serde(default = "default_render_timeout")]
    pub render_timeout: u64,
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout: u64,

    // 验证码配置
    #[serde(default = "default_challenge_attempts")]
    pub challenge_attempts: usize,
    #[serde(default = "default_challenge_threshold")]
    pub challenge_threshold: f32,

    #[serde(skip)]
    pub force: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            download_cover: default_true(),
            integrity: default_integrity(),
            min_audio_bytes: default_min_audio_bytes(),
            max_workers: default_max_workers(),
            max_attempts: default_max_attempts(),
            min_wait_time: default_min_wait_time(),
            max_wait_time: default_max_wait_time(),
            abort_grace: default_abort_grace(),
            env_error_threshold: default_env_error_threshold(),
            abort_on_env_errors: false,
            pacing: default_true(),
            pace_min_ms: default_pace_min_ms(),
            pace_max_ms: default_pace_max_ms(),
            pace_batch_every: default_pace_batch_every(),
            pace_batch_min_ms: default_pace_batch_min_ms(),
            pace_batch_max_ms: default_pace_batch_max_ms(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            cdn_direct: default_true(),
            cdn_domains: default_cdn_domains(),
            proxy_mode: default_proxy_mode(),
            proxy_address: String::new(),
            proxy_candidates: Vec::new(),
            controller_url: String::new(),
            controller_secret: String::new(),
            rotate_every: 0,
            rotation_probe_attempts: default_rotation_probe_attempts(),
            rotation_timeout: default_rotation_timeout(),
            headless: default_true(),
            render_sessions: default_render_sessions(),
            render_timeout: default_render_timeout(),
            session_idle_timeout: default_session_idle_timeout(),
            challenge_attempts: default_challenge_attempts(),
            challenge_threshold: default_challenge_threshold(),
            force: false,
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 35] = [
            FieldMeta {
                name: "save_path",
                description: "保存目录（留空为当前目录）",
            },
            FieldMeta {
                name: "download_cover",
                description: "是否下载封面图片",
            },
            FieldMeta {
                name: "integrity",
                description: "已下载文件的校验强度, 可选: [signature, hash]\nsignature: 大小 + 文件头; hash: 与 download_record.json 中的 sha256 比对",
            },
            FieldMeta {
                name: "min_audio_bytes",
                description: "音频文件最小字节数（更小的视为错误页面）",
            },
            FieldMeta {
                name: "max_workers",
                description: "最大并发下载数",
            },
            FieldMeta {
                name: "max_attempts",
                description: "单集最大尝试次数",
            },
            FieldMeta {
                name: "min_wait_time",
                description: "重试最小退避时间, 单位ms",
            },
            FieldMeta {
                name: "max_wait_time",
                description: "重试最大退避时间, 单位ms",
            },
            FieldMeta {
                name: "abort_grace",
                description: "中止后等待进行中任务收尾的时间（秒）",
            },
            FieldMeta {
                name: "env_error_threshold",
                description: "权限/磁盘类错误累计达到该数量时建议中止",
            },
            FieldMeta {
                name: "abort_on_env_errors",
                description: "权限/磁盘类错误达到阈值时自动中止",
            },
            FieldMeta {
                name: "pacing",
                description: "两集派发之间随机等待以防限流（遇到限流后自动转为保守节奏）",
            },
            FieldMeta {
                name: "pace_min_ms",
                description: "派发间隔下限, 单位ms",
            },
            FieldMeta {
                name: "pace_max_ms",
                description: "派发间隔上限, 单位ms",
            },
            FieldMeta {
                name: "pace_batch_every",
                description: "每派发多少集休息一次（0 为不休息）",
            },
            FieldMeta {
                name: "pace_batch_min_ms",
                description: "批次休息时间下限, 单位ms",
            },
            FieldMeta {
                name: "pace_batch_max_ms",
                description: "批次休息时间上限, 单位ms",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "connect_timeout",
                description: "连接超时时间（秒）",
            },
            FieldMeta {
                name: "cdn_direct",
                description: "CDN 地址跳过代理直连",
            },
            FieldMeta {
                name: "cdn_domains",
                description: "视为 CDN 的域名片段",
            },
            FieldMeta {
                name: "proxy_mode",
                description: "代理模式, 可选: [direct, fixed, auto]",
            },
            FieldMeta {
                name: "proxy_address",
                description: "fixed 模式下的代理地址, 例如 http://127.0.0.1:7890",
            },
            FieldMeta {
                name: "proxy_candidates",
                description: "auto 模式下优先探测的代理地址",
            },
            FieldMeta {
                name: "controller_url",
                description: "Clash 控制接口地址（留空自动探测）",
            },
            FieldMeta {
                name: "controller_secret",
                description: "Clash 控制接口密钥",
            },
            FieldMeta {
                name: "rotate_every",
                description: "每完成多少集切换一次出口节点（0 为关闭; auto 模式探测到控制接口时默认 15）",
            },
            FieldMeta {
                name: "rotation_probe_attempts",
                description: "切换节点后的连通性探测次数",
            },
            FieldMeta {
                name: "rotation_timeout",
                description: "单次切换节点的超时时间（秒）",
            },
            FieldMeta {
                name: "headless",
                description: "浏览器是否以无头模式运行",
            },
            FieldMeta {
                name: "render_sessions",
                description: "同时打开的浏览器会话数",
            },
            FieldMeta {
                name: "render_timeout",
                description: "单次页面渲染超时时间（秒）",
            },
            FieldMeta {
                name: "session_idle_timeout",
                description: "浏览器会话被占用超过该时间（秒）将被强制关闭",
            },
            FieldMeta {
                name: "challenge_attempts",
                description: "单次解析中滑块验证码的最大尝试次数",
            },
            FieldMeta {
                name: "challenge_threshold",
                description: "滑块匹配的最低相似度（0~1）",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers 必须 >= 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts 必须 >= 1".to_string());
        }
        if self.render_sessions == 0 {
            return Err("render_sessions 必须 >= 1".to_string());
        }
        if self.min_wait_time > self.max_wait_time {
            return Err("min_wait_time 不能大于 max_wait_time".to_string());
        }
        if self.pace_min_ms > self.pace_max_ms || self.pace_batch_min_ms > self.pace_batch_max_ms {
            return Err("派发间隔的下限不能大于上限".to_string());
        }
        match self.proxy_mode.trim().to_ascii_lowercase().as_str() {
            "direct" | "auto" => {}
            "fixed" if self.proxy_address.trim().is_empty() => {
                return Err("proxy_mode=fixed 时 proxy_address 不能为空".to_string());
            }
            "fixed" => {}
            other => return Err(format!("未知的 proxy_mode: {other}")),
        }
        match self.integrity.trim().to_ascii_lowercase().as_str() {
            "signature" | "hash" => {}
            other => return Err(format!("未知的 integrity: {other}")),
        }
        if !(0.0..=1.0).contains(&self.challenge_threshold) {
            return Err("challenge_threshold 必须在 0~1 之间".to_string());
        }
        Ok(())
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        let trimmed = self.save_path.trim();
        if trimmed.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(trimmed)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.max(1))
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout.max(1))
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout.max(1))
    }

    pub fn rotation_timeout(&self) -> Duration {
        Duration::from_secs(self.rotation_timeout.max(1))
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace)
    }

    pub fn is_cdn_url(&self, url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        self.cdn_domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .any(|d| lower.contains(&d.to_ascii_lowercase()))
    }
}

/// 清理文件名中的非法字符，保证跨平台可用。
pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let rep = replacement.chars().next().unwrap_or('_');
    let mut cleaned: String = name
        .trim()
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => rep,
            c if (c as u32) < 32 => rep,
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }
    while cleaned.starts_with(' ') || cleaned.starts_with('.') {
        cleaned.remove(0);
    }

    if cleaned.is_empty() {
        cleaned.push_str("untitled");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if RESERVED.contains(&cleaned.to_uppercase().as_str()) {
        cleaned.insert(0, '_');
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符（如中文）中间截断导致 panic
        let mut end = max_len;
        while end > 0 && !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        cleaned.truncate(end);
    }

    cleaned
}

fn default_true() -> bool {
    true
}

fn default_integrity() -> String {
    "signature".to_string()
}

fn default_min_audio_bytes() -> u64 {
    50 * 1024
}

fn default_max_workers() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_wait_time() -> u64 {
    1000
}

fn default_max_wait_time() -> u64 {
    30_000
}

fn default_abort_grace() -> u64 {
    30
}

fn default_env_error_threshold() -> usize {
    3
}

fn default_pace_min_ms() -> u64 {
    2000
}

fn default_pace_max_ms() -> u64 {
    4000
}

fn default_pace_batch_every() -> usize {
    15
}

fn default_pace_batch_min_ms() -> u64 {
    15_000
}

fn default_pace_batch_max_ms() -> u64 {
    25_000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_cdn_domains() -> Vec<String> {
    ["xmcdn.com", "cos.tx.", "cdn.", "clouddn.com"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_proxy_mode() -> String {
    "direct".to_string()
}

fn default_rotation_probe_attempts() -> usize {
    3
}

fn default_rotation_timeout() -> u64 {
    20
}

fn default_render_sessions() -> usize {
    1
}

fn default_render_timeout() -> u64 {
    60
}

fn default_session_idle_timeout() -> u64 {
    300
}

fn default_challenge_attempts() -> usize {
    6
}

fn default_challenge_threshold() -> f32 {
    0.25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_cover_every_serialized_key() {
        let value = serde_yaml::to_value(Config::default()).unwrap();
        let serde_yaml::Value::Mapping(map) = value else {
            panic!("config must be a mapping");
        };
        assert_eq!(map.len(), Config::fields().len());
        for field in Config::fields() {
            assert!(
                map.contains_key(serde_yaml::Value::String(field.name.to_string())),
                "missing {}",
                field.name
            );
        }
    }

    #[test]
    fn fixed_mode_requires_address() {
        let cfg = Config {
            proxy_mode: "fixed".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            proxy_mode: "fixed".to_string(),
            proxy_address: "http://127.0.0.1:7890".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn safe_fs_name_strips_forbidden_chars() {
        assert_eq!(safe_fs_name("第1集: 开始?", "_", 120), "第1集_ 开始_");
        assert_eq!(safe_fs_name("  ..  ", "_", 120), "untitled");
        assert_eq!(safe_fs_name("con", "_", 120), "_con");
        // 截断不会切开多字节字符
        let long = "有声".repeat(50);
        let out = safe_fs_name(&long, "_", 10);
        assert!(out.len() <= 10);
        assert!(long.starts_with(&out));
    }

    #[test]
    fn cdn_detection_is_case_insensitive() {
        let cfg = Config::default();
        assert!(cfg.is_cdn_url("https://AUDIO.XMCDN.com/a.m4a"));
        assert!(!cfg.is_cdn_url("https://www.ting13.cc/play/1.html"));
    }
}
