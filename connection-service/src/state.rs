//! Application state for connection service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use common::config::{AppConfig, ServiceUrls};
use sqlx::mysql::MySqlPoolOptions;
use tokio_util::sync::CancellationToken;

use crate::cipher::{AesGcmCipher, PasswordCipher};
use crate::db_app::DbApp;
use crate::dbm::{DbConnector, SqlxConnector};
use crate::flow::{HttpProcinstClient, ProcinstApp};
use crate::rdm::{ManagerConnector, RedisConnector};
use crate::redis_app::RedisApp;
use crate::store::{MemoryStore, MetaStore, MySqlStore};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db_app: Arc<DbApp>,
    pub redis_app: Arc<RedisApp>,
    /// Cancelled on shutdown; stops connection acquisition and running dumps.
    pub shutdown: CancellationToken,
}

/// Collaborators the applications are built from.
pub struct Parts {
    pub store: Arc<dyn MetaStore>,
    pub cipher: Arc<dyn PasswordCipher>,
    pub db_connector: Arc<dyn DbConnector>,
    pub redis_connector: Arc<dyn RedisConnector>,
    pub procinst: Arc<dyn ProcinstApp>,
}

impl AppState {
    /// Creates the state from configuration.
    ///
    /// The metadata store is MySQL when `DATABASE_URL` is set, in-memory otherwise.
    pub async fn new(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let store: Arc<dyn MetaStore> = match &config.database_url {
            Some(url) => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
                    .connect(url)
                    .await
                    .context("Failed to connect metadata database (check DATABASE_URL)")?;
                Arc::new(MySqlStore::new(pool).await?)
            }
            None => {
                tracing::warn!("未配置 DATABASE_URL，使用内存元数据存储");
                Arc::new(MemoryStore::new())
            }
        };

        let cipher = build_cipher(&config.password_secret)?;

        let urls = ServiceUrls::load();
        let parts = Parts {
            store,
            cipher: Arc::new(cipher),
            db_connector: Arc::new(SqlxConnector::new(
                config.max_connections,
                Duration::from_secs(config.connect_timeout_secs),
            )),
            redis_connector: Arc::new(ManagerConnector),
            procinst: Arc::new(HttpProcinstClient::new(urls.flow_service, reqwest::Client::new())),
        };
        Ok(Self::from_parts(config, parts, shutdown))
    }

    pub fn from_parts(config: AppConfig, parts: Parts, shutdown: CancellationToken) -> Self {
        let db_app = DbApp::new(
            &config,
            parts.store.clone(),
            parts.cipher.clone(),
            parts.db_connector,
            shutdown.clone(),
        );
        let redis_app = RedisApp::new(
            &config,
            parts.store,
            parts.cipher,
            parts.redis_connector,
            parts.procinst,
            shutdown.clone(),
        );
        Self {
            config,
            db_app: Arc::new(db_app),
            redis_app: Arc::new(redis_app),
            shutdown,
        }
    }

    /// Number of cached connections of both kinds.
    pub fn connection_count(&self) -> usize {
        self.db_app.cache().len() + self.redis_app.cache().len()
    }

    /// Cancels outstanding work and closes every cached connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let dbs = self.db_app.close_all().await;
        let redis = self.redis_app.close_all().await;
        tracing::info!(db = dbs, redis = redis, "连接已全部关闭");
    }
}

/// Password cipher keyed by `PASSWORD_SECRET`, which must be set.
fn build_cipher(secret: &str) -> anyhow::Result<AesGcmCipher> {
    ensure!(
        !secret.trim().is_empty(),
        "PASSWORD_SECRET is not set; refusing to store passwords under an empty key"
    );
    AesGcmCipher::new(secret).context("Failed to initialize password cipher")
}
