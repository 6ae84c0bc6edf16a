//! Shared data models for all microservices.

pub mod command;
pub mod db;
pub mod flow;
pub mod instance;
pub mod redis;
pub mod tag;

// Re-export commonly used types
pub use command::{CmdKind, CmdOutcome, RunCmdParam, RunCmdRequest};
pub use db::{Db, DbSql, DumpDbQuery};
pub use flow::{BizHandleParam, ProcinstStatus, StartProcParam};
pub use instance::{DbInstance, DbType};
pub use redis::Redis;
pub use tag::TagResourceType;
