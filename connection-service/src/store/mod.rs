//! Metadata store: instance, database, redis and tag records.
//!
//! Reads are plain lookups. Writes are expressed as a list of [`StoreOp`]
//! applied atomically, so a resource and its tag relation change together or
//! not at all.

mod memory;
mod mysql;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;

use async_trait::async_trait;
use common::errors::AppResult;
use common::models::{Db, DbInstance, Redis, TagResourceType};

/// One write of an atomic batch.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Inserts a database record; an id of 0 is assigned by the store.
    InsertDb(Db),
    UpdateDb(Db),
    DeleteDb(u64),
    /// Deletes saved SQL of a database resource, optionally of one database name only.
    DeleteDbSql { db_id: u64, db: Option<String> },
    InsertRedis(Redis),
    UpdateRedis(Redis),
    DeleteRedis(u64),
    /// Replaces the tags related to a resource code. Empty `tag_ids` removes the relation.
    RelateTags {
        resource_type: TagResourceType,
        code: String,
        tag_ids: Vec<u64>,
    },
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get_instance(&self, id: u64) -> AppResult<Option<DbInstance>>;

    async fn get_db(&self, id: u64) -> AppResult<Option<Db>>;

    async fn find_db_by_name(&self, instance_id: u64, name: &str) -> AppResult<Option<Db>>;

    /// Databases configured on an instance, in id order.
    async fn list_dbs_by_instance(&self, instance_id: u64) -> AppResult<Vec<Db>>;

    async fn get_redis(&self, id: u64) -> AppResult<Option<Redis>>;

    async fn find_redis_by_host(&self, host: &str) -> AppResult<Option<Redis>>;

    async fn find_redis_by_code(&self, code: &str) -> AppResult<Option<Redis>>;

    /// Tag paths a resource is related to, sorted.
    async fn list_tag_paths(
        &self,
        resource_type: TagResourceType,
        code: &str,
    ) -> AppResult<Vec<String>>;

    /// Applies all ops or none.
    async fn apply(&self, ops: Vec<StoreOp>) -> AppResult<()>;
}
