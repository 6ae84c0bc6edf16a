//! In-memory metadata store.
//!
//! Used when no `DATABASE_URL` is configured and by tests. A batch is applied
//! to a copy of the state which replaces the live state only on success.

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::errors::{AppError, AppResult};
use common::models::{Db, DbInstance, DbSql, Redis, TagResourceType};
use tokio::sync::RwLock;

use super::{MetaStore, StoreOp};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    instances: BTreeMap<u64, DbInstance>,
    dbs: BTreeMap<u64, Db>,
    db_sqls: BTreeMap<u64, DbSql>,
    redis: BTreeMap<u64, Redis>,
    /// tag id -> code path
    tags: BTreeMap<u64, String>,
    /// (resource type code, resource code) -> tag ids
    tag_resources: BTreeMap<(i32, String), Vec<u64>>,
    next_id: u64,
}

impl MemoryState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn apply_op(&mut self, op: StoreOp) -> AppResult<()> {
        match op {
            StoreOp::InsertDb(mut db) => {
                if db.id == 0 {
                    db.id = self.next_id();
                }
                self.dbs.insert(db.id, db);
            }
            StoreOp::UpdateDb(db) => {
                let slot = self
                    .dbs
                    .get_mut(&db.id)
                    .ok_or_else(|| AppError::NotFound("数据库信息不存在".into()))?;
                *slot = db;
            }
            StoreOp::DeleteDb(id) => {
                self.dbs.remove(&id);
            }
            StoreOp::DeleteDbSql { db_id, db } => {
                self.db_sqls.retain(|_, sql| {
                    sql.db_id != db_id || db.as_deref().is_some_and(|name| name != sql.db)
                });
            }
            StoreOp::InsertRedis(mut redis) => {
                if redis.id == 0 {
                    redis.id = self.next_id();
                }
                self.redis.insert(redis.id, redis);
            }
            StoreOp::UpdateRedis(redis) => {
                let slot = self
                    .redis
                    .get_mut(&redis.id)
                    .ok_or_else(|| AppError::NotFound("redis信息不存在".into()))?;
                *slot = redis;
            }
            StoreOp::DeleteRedis(id) => {
                self.redis.remove(&id);
            }
            StoreOp::RelateTags {
                resource_type,
                code,
                tag_ids,
            } => {
                if let Some(missing) = tag_ids.iter().find(|id| !self.tags.contains_key(id)) {
                    return Err(AppError::NotFound(format!("标签不存在: {}", missing)));
                }
                let key = (resource_type.code(), code);
                if tag_ids.is_empty() {
                    self.tag_resources.remove(&key);
                } else {
                    self.tag_resources.insert(key, tag_ids);
                }
            }
        }
        Ok(())
    }
}

/// Metadata store kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_instance(&self, instance: DbInstance) {
        let mut state = self.state.write().await;
        state.next_id = state.next_id.max(instance.id);
        state.instances.insert(instance.id, instance);
    }

    pub async fn insert_tag(&self, id: u64, code_path: &str) {
        let mut state = self.state.write().await;
        state.next_id = state.next_id.max(id);
        state.tags.insert(id, code_path.to_string());
    }

    /// Saves a SQL snippet and returns its id.
    pub async fn insert_db_sql(&self, db_id: u64, db: &str, name: &str, sql: &str) -> u64 {
        let mut state = self.state.write().await;
        let id = state.next_id();
        state.db_sqls.insert(
            id,
            DbSql {
                id,
                db_id,
                db: db.to_string(),
                name: name.to_string(),
                sql: sql.to_string(),
            },
        );
        id
    }

    pub async fn db_sql_count(&self, db_id: u64) -> usize {
        self.state
            .read()
            .await
            .db_sqls
            .values()
            .filter(|sql| sql.db_id == db_id)
            .count()
    }

    pub async fn tag_ids(&self, resource_type: TagResourceType, code: &str) -> Vec<u64> {
        self.state
            .read()
            .await
            .tag_resources
            .get(&(resource_type.code(), code.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn get_instance(&self, id: u64) -> AppResult<Option<DbInstance>> {
        Ok(self.state.read().await.instances.get(&id).cloned())
    }

    async fn get_db(&self, id: u64) -> AppResult<Option<Db>> {
        Ok(self.state.read().await.dbs.get(&id).cloned())
    }

    async fn find_db_by_name(&self, instance_id: u64, name: &str) -> AppResult<Option<Db>> {
        Ok(self
            .state
            .read()
            .await
            .dbs
            .values()
            .find(|db| db.instance_id == instance_id && db.name == name)
            .cloned())
    }

    async fn list_dbs_by_instance(&self, instance_id: u64) -> AppResult<Vec<Db>> {
        Ok(self
            .state
            .read()
            .await
            .dbs
            .values()
            .filter(|db| db.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn get_redis(&self, id: u64) -> AppResult<Option<Redis>> {
        Ok(self.state.read().await.redis.get(&id).cloned())
    }

    async fn find_redis_by_host(&self, host: &str) -> AppResult<Option<Redis>> {
        Ok(self
            .state
            .read()
            .await
            .redis
            .values()
            .find(|r| r.host == host)
            .cloned())
    }

    async fn find_redis_by_code(&self, code: &str) -> AppResult<Option<Redis>> {
        Ok(self
            .state
            .read()
            .await
            .redis
            .values()
            .find(|r| r.code == code)
            .cloned())
    }

    async fn list_tag_paths(
        &self,
        resource_type: TagResourceType,
        code: &str,
    ) -> AppResult<Vec<String>> {
        let state = self.state.read().await;
        let mut paths: Vec<String> = state
            .tag_resources
            .get(&(resource_type.code(), code.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| state.tags.get(id).cloned())
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> AppResult<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        for op in ops {
            next.apply_op(op)?;
        }
        *state = next;
        Ok(())
    }
}
