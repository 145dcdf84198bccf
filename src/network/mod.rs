//! 网络层：出口身份、代理探测、控制接口与 HTTP 客户端。
//!
//! 子模块：
//! - `identity`   — 带版本号的出口身份与轮换
//! - `probe`      — 代理候选发现与可达性探测
//! - `controller` — Clash 风格控制接口
//! - `http`       — 按身份缓存的 reqwest 客户端与状态码归类

pub mod controller;
pub mod http;
pub mod identity;
pub mod probe;
