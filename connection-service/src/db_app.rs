//! Database resources: connection resolution, record maintenance and dumps.

use std::sync::Arc;
use std::time::Duration;

use common::config::AppConfig;
use common::errors::{AppError, AppResult};
use common::models::{Db, TagResourceType};
use common::utils::{AllowList, IdGenerator};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::cipher::PasswordCipher;
use crate::conn_cache::{ConnCache, ResourceKey};
use crate::dbm::{DbConn, DbConnector, DbInfo};
use crate::dump::{dump_tables, write_header, DumpOptions, DumpStats, SqlWriter};
use crate::store::{MetaStore, StoreOp};

/// A dump of one database of a resource.
#[derive(Debug, Clone)]
pub struct DumpRequest {
    pub db_id: u64,
    pub db_name: String,
    pub options: DumpOptions,
}

pub struct DbApp {
    store: Arc<dyn MetaStore>,
    cipher: Arc<dyn PasswordCipher>,
    connector: Arc<dyn DbConnector>,
    cache: ConnCache<String, DbConn>,
    connect_timeout: Duration,
    dump_flush_bytes: usize,
    platform_name: String,
    shutdown: CancellationToken,
}

impl DbApp {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn MetaStore>,
        cipher: Arc<dyn PasswordCipher>,
        connector: Arc<dyn DbConnector>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            cipher,
            connector,
            cache: ConnCache::new("db"),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            dump_flush_bytes: config.dump_flush_bytes,
            platform_name: config.dump_platform_name.clone(),
            shutdown,
        }
    }

    pub fn cache(&self) -> &ConnCache<String, DbConn> {
        &self.cache
    }

    /// Connection to database `db_name` of resource `db_id`, opened on first use.
    pub async fn get_db_conn(&self, db_id: u64, db_name: &str) -> AppResult<Arc<DbConn>> {
        self.get_db_conn_until(db_id, db_name, &self.shutdown).await
    }

    /// Like [`DbApp::get_db_conn`], giving up once `cancel` fires.
    pub async fn get_db_conn_until(
        &self,
        db_id: u64,
        db_name: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Arc<DbConn>> {
        let key = ResourceKey::new(db_id, db_name.to_string());
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(AppError::Cancelled),
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            conn = self.cache.get_or_create(key, || self.open_db_conn(db_id, db_name)) => conn,
        }
    }

    async fn open_db_conn(&self, db_id: u64, db_name: &str) -> AppResult<DbConn> {
        let info = self.resolve_db_info(db_id, db_name).await?;
        tokio::time::timeout(self.connect_timeout, self.connector.connect(info))
            .await
            .map_err(|_| {
                AppError::ConnectionFailed(format!("连接超时({}s)", self.connect_timeout.as_secs()))
            })?
    }

    /// Builds the connection parameters without touching the network.
    async fn resolve_db_info(&self, db_id: u64, db_name: &str) -> AppResult<DbInfo> {
        let db = self
            .store
            .get_db(db_id)
            .await?
            .ok_or_else(|| AppError::NotFound("数据库信息不存在".into()))?;
        let instance = self
            .store
            .get_instance(db.instance_id)
            .await?
            .ok_or_else(|| AppError::NotFound("数据库实例不存在".into()))?;

        let password = self
            .cipher
            .decrypt(instance.password.as_deref().unwrap_or_default())
            .map_err(|e| {
                tracing::error!(instance_id = instance.id, error = %e, "实例密码解密失败");
                AppError::DecryptionFailed("数据库实例密码解密失败".into())
            })?;

        let tag_path = self
            .store
            .list_tag_paths(TagResourceType::Db, &db.code)
            .await?;

        let info = DbInfo {
            id: db.id,
            name: db.name.clone(),
            instance_id: instance.id,
            db_type: instance.db_type,
            host: instance.host.unwrap_or_default(),
            port: instance
                .port
                .or_else(|| instance.db_type.default_port())
                .unwrap_or_default(),
            username: instance.username.unwrap_or_default(),
            password,
            database: db_name.to_string(),
            file_path: instance.file_path,
            params: instance.params,
            tag_path,
            flow_procdef_key: db.flow_procdef_key.clone(),
        };

        if !AllowList::parse(&db.database).contains(db_name) {
            return Err(AppError::PermissionDenied(format!(
                "未配置数据库【{}】的操作权限",
                db_name
            )));
        }
        Ok(info)
    }

    /// Any open connection of the instance, or one opened through its first
    /// configured database.
    pub async fn get_db_conn_by_instance_id(&self, instance_id: u64) -> AppResult<Arc<DbConn>> {
        if let Some(conn) = self
            .cache
            .get_any_where(|_, conn| conn.info.instance_id == instance_id)
        {
            return Ok(conn);
        }

        let not_configured =
            || AppError::NotFound(format!("实例[{}]未配置数据库, 请先进行配置", instance_id));
        let dbs = self.store.list_dbs_by_instance(instance_id).await?;
        let first = dbs.first().ok_or_else(not_configured)?;
        let allowed = AllowList::parse(&first.database);
        let db_name = allowed.first().ok_or_else(not_configured)?;
        self.get_db_conn(first.id, db_name).await
    }

    /// Creates (`db.id == 0`) or updates a database resource with its tags.
    pub async fn save_db(&self, mut db: Db, tag_ids: Vec<u64>) -> AppResult<()> {
        if db.id == 0 {
            if self
                .store
                .find_db_by_name(db.instance_id, &db.name)
                .await?
                .is_some()
            {
                return Err(AppError::AlreadyExists("该实例下数据库名已存在".into()));
            }
            db.code = IdGenerator::resource_code();
            let code = db.code.clone();
            let name = db.name.clone();
            self.store
                .apply(vec![
                    StoreOp::InsertDb(db),
                    StoreOp::RelateTags {
                        resource_type: TagResourceType::Db,
                        code,
                        tag_ids,
                    },
                ])
                .await?;
            tracing::info!(name = %name, "新增数据库");
            return Ok(());
        }

        let old = self
            .store
            .get_db(db.id)
            .await?
            .ok_or_else(|| AppError::NotFound("该数据库不存在".into()))?;
        if let Some(same_name) = self.store.find_db_by_name(old.instance_id, &db.name).await? {
            if same_name.id != db.id {
                return Err(AppError::AlreadyExists("该实例下数据库名已存在".into()));
            }
        }

        // Owning instance and resource code are fixed at creation.
        db.instance_id = old.instance_id;
        db.code = old.code.clone();

        let removed = AllowList::parse(&old.database).removed_from(&AllowList::parse(&db.database));

        // Connections may be authorized for databases no longer allowed.
        let closed = self.cache.invalidate_by_owner(db.id).await;

        let mut ops = Vec::with_capacity(removed.len() + 2);
        for name in &removed {
            ops.push(StoreOp::DeleteDbSql {
                db_id: db.id,
                db: Some(name.clone()),
            });
        }
        ops.push(StoreOp::RelateTags {
            resource_type: TagResourceType::Db,
            code: db.code.clone(),
            tag_ids,
        });
        let id = db.id;
        ops.push(StoreOp::UpdateDb(db));
        self.store.apply(ops).await?;

        tracing::info!(id = id, closed = closed, removed = ?removed, "更新数据库");
        Ok(())
    }

    /// Deletes a database resource, its saved SQL and tag relation after
    /// closing its connections.
    pub async fn delete(&self, id: u64) -> AppResult<()> {
        let db = self
            .store
            .get_db(id)
            .await?
            .ok_or_else(|| AppError::NotFound("数据库信息不存在".into()))?;

        let closed = self.cache.invalidate_by_owner(id).await;
        self.store
            .apply(vec![
                StoreOp::DeleteDb(id),
                StoreOp::DeleteDbSql { db_id: id, db: None },
                StoreOp::RelateTags {
                    resource_type: TagResourceType::Db,
                    code: db.code,
                    tag_ids: Vec::new(),
                },
            ])
            .await?;

        tracing::info!(id = id, name = %db.name, closed = closed, "删除数据库");
        Ok(())
    }

    /// Resolves the connection and dumps into `sink`.
    pub async fn dump_db<W>(
        &self,
        req: &DumpRequest,
        sink: W,
        cancel: &CancellationToken,
    ) -> AppResult<DumpStats>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let conn = self.get_db_conn_until(req.db_id, &req.db_name, cancel).await?;
        self.dump_conn(&conn, req, sink, cancel).await
    }

    /// Dumps through an already resolved connection.
    pub async fn dump_conn<W>(
        &self,
        conn: &DbConn,
        req: &DumpRequest,
        sink: W,
        cancel: &CancellationToken,
    ) -> AppResult<DumpStats>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut writer = SqlWriter::new(sink, self.dump_flush_bytes);
        write_header(
            &mut writer,
            &self.platform_name,
            &req.db_name,
            chrono::Local::now().naive_local(),
        )
        .await?;

        match dump_tables(conn.meta(), &req.options, &mut writer, cancel).await {
            Ok(stats) => {
                writer.finish().await?;
                tracing::info!(
                    db = %conn.info.log_desc(),
                    tables = stats.tables,
                    rows = stats.rows,
                    "数据库导出完成"
                );
                Ok(stats)
            }
            Err(e) => {
                // Keep what was produced so far.
                let _ = writer.flush().await;
                tracing::warn!(db = %conn.info.log_desc(), error = %e, "数据库导出失败");
                Err(e)
            }
        }
    }

    /// Closes every cached connection.
    pub async fn close_all(&self) -> usize {
        self.cache.close_all().await
    }
}
