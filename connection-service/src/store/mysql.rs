//! MySQL-backed metadata store.

use async_trait::async_trait;
use common::errors::{AppError, AppResult};
use common::models::{Db, DbInstance, DbType, Redis, TagResourceType};
use sqlx::{MySql, MySqlPool, Transaction};

use super::{MetaStore, StoreOp};

/// Row from the `t_db_instance` table.
#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: u64,
    name: String,
    db_type: String,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    file_path: Option<String>,
    params: Option<String>,
}

impl InstanceRow {
    fn into_instance(self) -> AppResult<DbInstance> {
        Ok(DbInstance {
            id: self.id,
            name: self.name,
            db_type: DbType::parse(&self.db_type)?,
            host: self.host,
            port: self.port,
            username: self.username,
            password: self.password,
            file_path: self.file_path,
            params: self.params,
        })
    }
}

/// Row from the `t_db` table.
#[derive(sqlx::FromRow)]
struct DbRow {
    id: u64,
    instance_id: u64,
    name: String,
    code: String,
    database: String,
    flow_procdef_key: Option<String>,
}

impl From<DbRow> for Db {
    fn from(row: DbRow) -> Self {
        Db {
            id: row.id,
            instance_id: row.instance_id,
            name: row.name,
            code: row.code,
            database: row.database,
            flow_procdef_key: row.flow_procdef_key.filter(|k| !k.is_empty()),
        }
    }
}

/// Row from the `t_redis` table.
#[derive(sqlx::FromRow)]
struct RedisRow {
    id: u64,
    code: String,
    name: String,
    host: String,
    password: Option<String>,
    db: String,
    flow_procdef_key: Option<String>,
}

impl From<RedisRow> for Redis {
    fn from(row: RedisRow) -> Self {
        Redis {
            id: row.id,
            code: row.code,
            name: row.name,
            host: row.host,
            password: row.password,
            db: row.db,
            flow_procdef_key: row.flow_procdef_key.filter(|k| !k.is_empty()),
        }
    }
}

const DB_COLUMNS: &str =
    "`id`, `instance_id`, `name`, `code`, `database`, `flow_procdef_key`";
const REDIS_COLUMNS: &str =
    "`id`, `code`, `name`, `host`, `password`, `db`, `flow_procdef_key`";

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS `t_db_instance` (
        `id`        BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        `name`      VARCHAR(100)  NOT NULL,
        `db_type`   VARCHAR(32)   NOT NULL,
        `host`      VARCHAR(255)  DEFAULT NULL,
        `port`      SMALLINT UNSIGNED DEFAULT NULL,
        `username`  VARCHAR(128)  DEFAULT NULL,
        `password`  VARCHAR(512)  DEFAULT NULL,
        `file_path` VARCHAR(512)  DEFAULT NULL,
        `params`    VARCHAR(255)  DEFAULT NULL,
        PRIMARY KEY (`id`)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
    "CREATE TABLE IF NOT EXISTS `t_db` (
        `id`               BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        `instance_id`      BIGINT UNSIGNED NOT NULL,
        `name`             VARCHAR(100)  NOT NULL,
        `code`             VARCHAR(32)   NOT NULL,
        `database`         VARCHAR(2000) NOT NULL DEFAULT '',
        `flow_procdef_key` VARCHAR(100)  DEFAULT NULL,
        PRIMARY KEY (`id`),
        UNIQUE KEY `uk_instance_name` (`instance_id`, `name`)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
    "CREATE TABLE IF NOT EXISTS `t_db_sql` (
        `id`    BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        `db_id` BIGINT UNSIGNED NOT NULL,
        `db`    VARCHAR(100)  NOT NULL,
        `name`  VARCHAR(100)  NOT NULL,
        `sql`   TEXT          NOT NULL,
        PRIMARY KEY (`id`),
        KEY `idx_db_id` (`db_id`)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
    "CREATE TABLE IF NOT EXISTS `t_redis` (
        `id`               BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        `code`             VARCHAR(32)   NOT NULL,
        `name`             VARCHAR(100)  NOT NULL,
        `host`             VARCHAR(255)  NOT NULL,
        `password`         VARCHAR(512)  DEFAULT NULL,
        `db`               VARCHAR(255)  NOT NULL DEFAULT '',
        `flow_procdef_key` VARCHAR(100)  DEFAULT NULL,
        PRIMARY KEY (`id`),
        UNIQUE KEY `uk_code` (`code`)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
    "CREATE TABLE IF NOT EXISTS `t_tag_tree` (
        `id`        BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        `code_path` VARCHAR(512)  NOT NULL,
        PRIMARY KEY (`id`)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
    "CREATE TABLE IF NOT EXISTS `t_tag_resource` (
        `id`            BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
        `tag_id`        BIGINT UNSIGNED NOT NULL,
        `resource_code` VARCHAR(32)   NOT NULL,
        `resource_type` INT           NOT NULL,
        PRIMARY KEY (`id`),
        KEY `idx_resource` (`resource_type`, `resource_code`)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
];

fn query_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseQuery(e.to_string())
}

/// Metadata store persisted in a MySQL database.
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// Wraps the pool and creates the metadata tables if missing.
    pub async fn new(pool: MySqlPool) -> AppResult<Self> {
        let store = Self { pool };
        store.ensure_tables().await?;
        Ok(store)
    }

    async fn ensure_tables(&self) -> AppResult<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseQuery(format!("Failed to create metadata table: {}", e)))?;
        }
        tracing::info!(count = SCHEMA.len(), "Metadata tables ensured");
        Ok(())
    }

    async fn apply_op(tx: &mut Transaction<'_, MySql>, op: StoreOp) -> AppResult<()> {
        match op {
            StoreOp::InsertDb(db) => {
                sqlx::query(
                    "INSERT INTO `t_db` (`instance_id`, `name`, `code`, `database`, `flow_procdef_key`)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(db.instance_id)
                .bind(&db.name)
                .bind(&db.code)
                .bind(&db.database)
                .bind(&db.flow_procdef_key)
                .execute(&mut **tx)
                .await
                .map_err(query_err)?;
            }
            StoreOp::UpdateDb(db) => {
                sqlx::query(
                    "UPDATE `t_db` SET `name` = ?, `database` = ?, `flow_procdef_key` = ? WHERE `id` = ?",
                )
                .bind(&db.name)
                .bind(&db.database)
                .bind(&db.flow_procdef_key)
                .bind(db.id)
                .execute(&mut **tx)
                .await
                .map_err(query_err)?;
            }
            StoreOp::DeleteDb(id) => {
                sqlx::query("DELETE FROM `t_db` WHERE `id` = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await
                    .map_err(query_err)?;
            }
            StoreOp::DeleteDbSql { db_id, db: Some(name) } => {
                sqlx::query("DELETE FROM `t_db_sql` WHERE `db_id` = ? AND `db` = ?")
                    .bind(db_id)
                    .bind(name)
                    .execute(&mut **tx)
                    .await
                    .map_err(query_err)?;
            }
            StoreOp::DeleteDbSql { db_id, db: None } => {
                sqlx::query("DELETE FROM `t_db_sql` WHERE `db_id` = ?")
                    .bind(db_id)
                    .execute(&mut **tx)
                    .await
                    .map_err(query_err)?;
            }
            StoreOp::InsertRedis(redis) => {
                sqlx::query(
                    "INSERT INTO `t_redis` (`code`, `name`, `host`, `password`, `db`, `flow_procdef_key`)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&redis.code)
                .bind(&redis.name)
                .bind(&redis.host)
                .bind(&redis.password)
                .bind(&redis.db)
                .bind(&redis.flow_procdef_key)
                .execute(&mut **tx)
                .await
                .map_err(query_err)?;
            }
            StoreOp::UpdateRedis(redis) => {
                sqlx::query(
                    "UPDATE `t_redis` SET `name` = ?, `host` = ?, `password` = ?, `db` = ?, `flow_procdef_key` = ?
                     WHERE `id` = ?",
                )
                .bind(&redis.name)
                .bind(&redis.host)
                .bind(&redis.password)
                .bind(&redis.db)
                .bind(&redis.flow_procdef_key)
                .bind(redis.id)
                .execute(&mut **tx)
                .await
                .map_err(query_err)?;
            }
            StoreOp::DeleteRedis(id) => {
                sqlx::query("DELETE FROM `t_redis` WHERE `id` = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await
                    .map_err(query_err)?;
            }
            StoreOp::RelateTags {
                resource_type,
                code,
                tag_ids,
            } => {
                for tag_id in &tag_ids {
                    let exists: Option<(u64,)> =
                        sqlx::query_as("SELECT `id` FROM `t_tag_tree` WHERE `id` = ?")
                            .bind(tag_id)
                            .fetch_optional(&mut **tx)
                            .await
                            .map_err(query_err)?;
                    if exists.is_none() {
                        return Err(AppError::NotFound(format!("标签不存在: {}", tag_id)));
                    }
                }

                sqlx::query(
                    "DELETE FROM `t_tag_resource` WHERE `resource_type` = ? AND `resource_code` = ?",
                )
                .bind(resource_type.code())
                .bind(&code)
                .execute(&mut **tx)
                .await
                .map_err(query_err)?;

                for tag_id in tag_ids {
                    sqlx::query(
                        "INSERT INTO `t_tag_resource` (`tag_id`, `resource_code`, `resource_type`) VALUES (?, ?, ?)",
                    )
                    .bind(tag_id)
                    .bind(&code)
                    .bind(resource_type.code())
                    .execute(&mut **tx)
                    .await
                    .map_err(query_err)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MetaStore for MySqlStore {
    async fn get_instance(&self, id: u64) -> AppResult<Option<DbInstance>> {
        sqlx::query_as::<_, InstanceRow>(
            "SELECT `id`, `name`, `db_type`, `host`, `port`, `username`, `password`, `file_path`, `params`
             FROM `t_db_instance` WHERE `id` = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?
        .map(InstanceRow::into_instance)
        .transpose()
    }

    async fn get_db(&self, id: u64) -> AppResult<Option<Db>> {
        let row = sqlx::query_as::<_, DbRow>(&format!(
            "SELECT {} FROM `t_db` WHERE `id` = ?",
            DB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.map(Db::from))
    }

    async fn find_db_by_name(&self, instance_id: u64, name: &str) -> AppResult<Option<Db>> {
        let row = sqlx::query_as::<_, DbRow>(&format!(
            "SELECT {} FROM `t_db` WHERE `instance_id` = ? AND `name` = ?",
            DB_COLUMNS
        ))
        .bind(instance_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.map(Db::from))
    }

    async fn list_dbs_by_instance(&self, instance_id: u64) -> AppResult<Vec<Db>> {
        let rows = sqlx::query_as::<_, DbRow>(&format!(
            "SELECT {} FROM `t_db` WHERE `instance_id` = ? ORDER BY `id`",
            DB_COLUMNS
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(rows.into_iter().map(Db::from).collect())
    }

    async fn get_redis(&self, id: u64) -> AppResult<Option<Redis>> {
        let row = sqlx::query_as::<_, RedisRow>(&format!(
            "SELECT {} FROM `t_redis` WHERE `id` = ?",
            REDIS_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.map(Redis::from))
    }

    async fn find_redis_by_host(&self, host: &str) -> AppResult<Option<Redis>> {
        let row = sqlx::query_as::<_, RedisRow>(&format!(
            "SELECT {} FROM `t_redis` WHERE `host` = ? LIMIT 1",
            REDIS_COLUMNS
        ))
        .bind(host)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.map(Redis::from))
    }

    async fn find_redis_by_code(&self, code: &str) -> AppResult<Option<Redis>> {
        let row = sqlx::query_as::<_, RedisRow>(&format!(
            "SELECT {} FROM `t_redis` WHERE `code` = ?",
            REDIS_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.map(Redis::from))
    }

    async fn list_tag_paths(
        &self,
        resource_type: TagResourceType,
        code: &str,
    ) -> AppResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT t.`code_path` FROM `t_tag_resource` r
             JOIN `t_tag_tree` t ON t.`id` = r.`tag_id`
             WHERE r.`resource_type` = ? AND r.`resource_code` = ?
             ORDER BY t.`code_path`",
        )
        .bind(resource_type.code())
        .bind(code)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(rows.into_iter().map(|(path,)| path).collect())
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> AppResult<()> {
        let count = ops.len();
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        for op in ops {
            // Dropping `tx` on error rolls the batch back.
            Self::apply_op(&mut tx, op).await?;
        }
        tx.commit().await.map_err(query_err)?;
        tracing::debug!(ops = count, "Metadata batch committed");
        Ok(())
    }
}
