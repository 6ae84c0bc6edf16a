//! 数据库连接管理服务
//!
//! - 连接缓存：按资源与子资源（库名 / 库号）缓存连接，同一 key 并发只建立一次
//! - 凭据解析：读取资源记录、解密密码、校验允许操作的库
//! - SQL 导出：按表输出结构、数据与索引，流式写出
//! - 命令审批：需要审批的 redis 写命令提交审批流程，流程完成后执行

pub mod cipher;
pub mod conn_cache;
pub mod db_app;
pub mod dbm;
pub mod dump;
pub mod flow;
pub mod handlers;
pub mod rdm;
pub mod redis_app;
pub mod routes;
pub mod state;
pub mod store;
