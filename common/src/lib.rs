//! 数据库管理微服务公共模块
//!
//! 提供各服务共享的配置、错误类型、响应封装、数据模型与中间件。

pub mod config;
pub mod errors;
pub mod middleware;
pub mod models;
pub mod response;
pub mod utils;
