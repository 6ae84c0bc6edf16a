//! Relational database connections.
//!
//! A [`DbInfo`] describes one authorized `(database resource, database name)`
//! target; a [`DbConnector`] turns it into a live [`DbConn`] holding a sqlx
//! pool and the dialect's [`MetadataProvider`].

pub mod meta;
mod mysql;
mod postgres;
mod sqlite;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::errors::{AppError, AppResult};
use common::models::DbType;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySqlPool, PgPool, SqlitePool};

use crate::conn_cache::LiveConnection;

pub use meta::{Column, DataKind, DataValue, Generated, Index, MetadataProvider, Table};
pub use mysql::MysqlMeta;
pub use postgres::PgMeta;
pub use sqlite::SqliteMeta;

/// Resolved connection parameters of one database. Password is decrypted.
#[derive(Clone)]
pub struct DbInfo {
    /// Database resource id.
    pub id: u64,
    pub name: String,
    pub instance_id: u64,
    pub db_type: DbType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Database name; PostgreSQL accepts `db/schema`.
    pub database: String,
    pub file_path: Option<String>,
    pub params: Option<String>,
    pub tag_path: Vec<String>,
    pub flow_procdef_key: Option<String>,
}

impl DbInfo {
    /// Database part of `database`.
    pub fn db_name(&self) -> &str {
        self.database
            .split_once('/')
            .map_or(self.database.as_str(), |(db, _)| db)
    }

    /// PostgreSQL schema selected by `db/schema`, `public` otherwise.
    pub fn current_schema(&self) -> &str {
        self.database
            .split_once('/')
            .map(|(_, schema)| schema)
            .filter(|s| !s.is_empty())
            .unwrap_or("public")
    }

    /// Short description for logs. Never includes credentials.
    pub fn log_desc(&self) -> String {
        format!(
            "{}[id={}, tag={:?}, name={}, ip={}:{}, database={}]",
            self.db_type, self.id, self.tag_path, self.name, self.host, self.port, self.database
        )
    }

    fn param_pairs(&self) -> Vec<(&str, &str)> {
        self.params
            .as_deref()
            .unwrap_or_default()
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }
}

impl std::fmt::Debug for DbInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.log_desc())
    }
}

/// Connection pool for the supported engines.
#[derive(Clone)]
pub enum DatabasePool {
    MySQL(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DatabasePool {
    async fn close(&self) {
        match self {
            DatabasePool::MySQL(pool) => pool.close().await,
            DatabasePool::Postgres(pool) => pool.close().await,
            DatabasePool::SQLite(pool) => pool.close().await,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            DatabasePool::MySQL(pool) => pool.is_closed(),
            DatabasePool::Postgres(pool) => pool.is_closed(),
            DatabasePool::SQLite(pool) => pool.is_closed(),
        }
    }
}

/// A live connection to one database.
pub struct DbConn {
    pub info: DbInfo,
    pool: DatabasePool,
    meta: Arc<dyn MetadataProvider>,
}

impl DbConn {
    pub fn new(info: DbInfo, pool: DatabasePool) -> Self {
        let meta: Arc<dyn MetadataProvider> = match &pool {
            DatabasePool::MySQL(p) => Arc::new(MysqlMeta::new(p.clone())),
            DatabasePool::Postgres(p) => Arc::new(PgMeta::new(p.clone(), info.current_schema())),
            DatabasePool::SQLite(p) => Arc::new(SqliteMeta::new(p.clone())),
        };
        Self { info, pool, meta }
    }

    pub fn meta(&self) -> &dyn MetadataProvider {
        self.meta.as_ref()
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

#[async_trait]
impl LiveConnection for DbConn {
    async fn close(&self) {
        self.pool.close().await;
        tracing::info!(db = %self.info.log_desc(), "数据库连接已关闭");
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Opens connections from resolved parameters.
#[async_trait]
pub trait DbConnector: Send + Sync {
    async fn connect(&self, info: DbInfo) -> AppResult<DbConn>;
}

/// Connector backed by sqlx pools.
pub struct SqlxConnector {
    max_connections: u32,
    connect_timeout: Duration,
}

impl SqlxConnector {
    pub fn new(max_connections: u32, connect_timeout: Duration) -> Self {
        Self {
            max_connections,
            connect_timeout,
        }
    }

    async fn connect_mysql(&self, info: &DbInfo) -> Result<MySqlPool, sqlx::Error> {
        let mut options = MySqlConnectOptions::new()
            .host(&info.host)
            .port(info.port)
            .username(&info.username)
            .password(&info.password)
            .database(info.db_name());
        for (key, value) in info.param_pairs() {
            match key {
                "charset" => options = options.charset(value),
                _ => tracing::debug!(key = %key, "忽略不支持的连接参数"),
            }
        }

        MySqlPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
    }

    async fn connect_postgres(&self, info: &DbInfo) -> Result<PgPool, sqlx::Error> {
        let mut options = PgConnectOptions::new()
            .host(&info.host)
            .port(info.port)
            .username(&info.username)
            .password(&info.password)
            .database(info.db_name())
            .options([("search_path", info.current_schema())]);
        for (key, value) in info.param_pairs() {
            match key {
                "sslmode" => options = options.ssl_mode(PgSslMode::from_str(value)?),
                "application_name" => options = options.application_name(value),
                _ => tracing::debug!(key = %key, "忽略不支持的连接参数"),
            }
        }

        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
    }

    async fn connect_sqlite(&self, info: &DbInfo) -> Result<SqlitePool, sqlx::Error> {
        let path = info.file_path.as_deref().unwrap_or_default();
        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        };

        // One connection, never recycled: an in-memory database lives exactly
        // as long as its connection.
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
    }
}

#[async_trait]
impl DbConnector for SqlxConnector {
    async fn connect(&self, info: DbInfo) -> AppResult<DbConn> {
        let pool = match info.db_type {
            DbType::MySQL => self.connect_mysql(&info).await.map(DatabasePool::MySQL),
            DbType::Postgres => self.connect_postgres(&info).await.map(DatabasePool::Postgres),
            DbType::SQLite => {
                if info.file_path.as_deref().unwrap_or_default().is_empty() {
                    return Err(AppError::Validation("SQLite requires file_path".into()));
                }
                self.connect_sqlite(&info).await.map(DatabasePool::SQLite)
            }
        }
        .map_err(|e| AppError::ConnectionFailed(e.to_string()))?;

        tracing::info!(db = %info.log_desc(), "连接数据库");
        Ok(DbConn::new(info, pool))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sqlite_info(id: u64, database: &str) -> DbInfo {
        DbInfo {
            id,
            name: format!("db-{}", id),
            instance_id: 1,
            db_type: DbType::SQLite,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: "secret".into(),
            database: database.into(),
            file_path: Some(":memory:".into()),
            params: None,
            tag_path: vec!["default/".into()],
            flow_procdef_key: None,
        }
    }

    #[test]
    fn test_schema_and_db_name_split() {
        let mut info = sqlite_info(1, "shop/sales");
        assert_eq!(info.db_name(), "shop");
        assert_eq!(info.current_schema(), "sales");
        info.database = "shop".into();
        assert_eq!(info.db_name(), "shop");
        assert_eq!(info.current_schema(), "public");
    }

    #[test]
    fn test_log_desc_hides_password() {
        let info = sqlite_info(3, "main");
        let desc = format!("{:?}", info);
        assert!(desc.contains("id=3"));
        assert!(!desc.contains("secret"));
    }

    #[test]
    fn test_param_pairs() {
        let mut info = sqlite_info(1, "main");
        info.params = Some("charset=utf8mb4& sslmode = disable&bogus".into());
        assert_eq!(
            info.param_pairs(),
            vec![("charset", "utf8mb4"), ("sslmode", "disable")]
        );
    }

    #[tokio::test]
    async fn test_sqlite_connect_and_close() {
        let connector = SqlxConnector::new(5, Duration::from_secs(5));
        let conn = connector.connect(sqlite_info(1, "main")).await.unwrap();
        assert_eq!(conn.meta().dialect(), "sqlite");
        assert!(!conn.is_closed());
        conn.close().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_sqlite_without_path_is_rejected() {
        let connector = SqlxConnector::new(5, Duration::from_secs(5));
        let mut info = sqlite_info(1, "main");
        info.file_path = None;
        let err = connector.connect(info).await.err().unwrap();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
