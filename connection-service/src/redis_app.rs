//! Redis 资源管理与命令执行
//!
//! 写命令在资源配置了审批流程时不会立即执行，而是提交审批，
//! 待流程完成回调后再通过 [`RedisApp::flow_biz_handle`] 执行。

use std::sync::Arc;
use std::time::Duration;

use common::config::AppConfig;
use common::errors::{AppError, AppResult};
use common::models::flow::REDIS_RUN_WRITE_CMD_FLOW_BIZ_TYPE;
use common::models::{
    BizHandleParam, CmdKind, CmdOutcome, ProcinstStatus, Redis, RunCmdParam, StartProcParam,
    TagResourceType,
};
use common::utils::{AllowList, IdGenerator};
use tokio_util::sync::CancellationToken;

use crate::cipher::PasswordCipher;
use crate::conn_cache::{ConnCache, LiveConnection, ResourceKey};
use crate::flow::ProcinstApp;
use crate::rdm::{classify_cmd, cmd_name, RedisConn, RedisConnector, RedisInfo};
use crate::store::{MetaStore, StoreOp};

pub struct RedisApp {
    store: Arc<dyn MetaStore>,
    cipher: Arc<dyn PasswordCipher>,
    connector: Arc<dyn RedisConnector>,
    procinst: Arc<dyn ProcinstApp>,
    cache: ConnCache<u32, RedisConn>,
    connect_timeout: Duration,
    shutdown: CancellationToken,
}

impl RedisApp {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn MetaStore>,
        cipher: Arc<dyn PasswordCipher>,
        connector: Arc<dyn RedisConnector>,
        procinst: Arc<dyn ProcinstApp>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            cipher,
            connector,
            procinst,
            cache: ConnCache::new("redis"),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            shutdown,
        }
    }

    pub fn cache(&self) -> &ConnCache<u32, RedisConn> {
        &self.cache
    }

    /// 获取 redis 连接，首次使用时建立
    pub async fn get_redis_conn(&self, id: u64, db: u32) -> AppResult<Arc<RedisConn>> {
        self.get_redis_conn_until(id, db, &self.shutdown).await
    }

    /// 同 [`RedisApp::get_redis_conn`]，`cancel` 或服务关闭时放弃等待
    pub async fn get_redis_conn_until(
        &self,
        id: u64,
        db: u32,
        cancel: &CancellationToken,
    ) -> AppResult<Arc<RedisConn>> {
        let key = ResourceKey::new(id, db);
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(AppError::Cancelled),
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            conn = self.cache.get_or_create(key, || self.open_redis_conn(id, db)) => conn,
        }
    }

    async fn open_redis_conn(&self, id: u64, db: u32) -> AppResult<RedisConn> {
        let info = self.resolve_redis_info(id, db).await?;
        self.connect(info).await
    }

    async fn connect(&self, info: RedisInfo) -> AppResult<RedisConn> {
        tokio::time::timeout(self.connect_timeout, self.connector.connect(info))
            .await
            .map_err(|_| {
                AppError::ConnectionFailed(format!("连接超时({}s)", self.connect_timeout.as_secs()))
            })?
    }

    async fn resolve_redis_info(&self, id: u64, db: u32) -> AppResult<RedisInfo> {
        let redis = self
            .store
            .get_redis(id)
            .await?
            .ok_or_else(|| AppError::NotFound("redis信息不存在".into()))?;

        let password = match redis.password.as_deref().filter(|p| !p.is_empty()) {
            Some(encrypted) => Some(self.cipher.decrypt(encrypted).map_err(|e| {
                tracing::error!(id = id, error = %e, "redis密码解密失败");
                AppError::DecryptionFailed("redis密码解密失败".into())
            })?),
            None => None,
        };

        let tag_path = self
            .store
            .list_tag_paths(TagResourceType::Redis, &redis.code)
            .await?;

        if !db_allowed(&redis.db, db) {
            return Err(AppError::PermissionDenied(format!(
                "未配置redis库【{}】的操作权限",
                db
            )));
        }

        Ok(RedisInfo {
            id: redis.id,
            name: redis.name,
            host: redis.host,
            password,
            db,
            tag_path,
            flow_procdef_key: redis.flow_procdef_key,
        })
    }

    /// 新增（`redis.id == 0`）或更新 redis 资源及其标签
    pub async fn save_redis(&self, mut redis: Redis, tag_ids: Vec<u64>) -> AppResult<()> {
        if redis.id == 0 {
            if self.store.find_redis_by_host(&redis.host).await?.is_some() {
                return Err(AppError::AlreadyExists("该实例已存在".into()));
            }
            if redis.code.is_empty() {
                redis.code = IdGenerator::resource_code();
            } else if self.store.find_redis_by_code(&redis.code).await?.is_some() {
                return Err(AppError::AlreadyExists("该编码已存在".into()));
            }
            redis.password = self.encrypt_password(redis.password.as_deref())?;

            let code = redis.code.clone();
            let host = redis.host.clone();
            self.store
                .apply(vec![
                    StoreOp::InsertRedis(redis),
                    StoreOp::RelateTags {
                        resource_type: TagResourceType::Redis,
                        code,
                        tag_ids,
                    },
                ])
                .await?;
            tracing::info!(host = %host, "新增redis");
            return Ok(());
        }

        let old = self
            .store
            .get_redis(redis.id)
            .await?
            .ok_or_else(|| AppError::NotFound("redis信息不存在".into()))?;
        if let Some(same_host) = self.store.find_redis_by_host(&redis.host).await? {
            if same_host.id != redis.id {
                return Err(AppError::AlreadyExists("该实例已存在".into()));
            }
        }

        redis.code = old.code.clone();
        let password_changed = redis.password.as_deref().is_some_and(|p| !p.is_empty());
        redis.password = if password_changed {
            self.encrypt_password(redis.password.as_deref())?
        } else {
            old.password.clone()
        };

        let closed = if password_changed
            || old.db != redis.db
            || old.host != redis.host
            || old.flow_procdef_key != redis.flow_procdef_key
        {
            self.cache.invalidate_by_owner(redis.id).await
        } else {
            0
        };

        let id = redis.id;
        self.store
            .apply(vec![
                StoreOp::RelateTags {
                    resource_type: TagResourceType::Redis,
                    code: redis.code.clone(),
                    tag_ids,
                },
                StoreOp::UpdateRedis(redis),
            ])
            .await?;
        tracing::info!(id = id, closed = closed, "更新redis");
        Ok(())
    }

    fn encrypt_password(&self, plain: Option<&str>) -> AppResult<Option<String>> {
        match plain.filter(|p| !p.is_empty()) {
            Some(p) => self
                .cipher
                .encrypt(p)
                .map(Some)
                .map_err(|e| AppError::Internal(format!("redis密码加密失败: {}", e))),
            None => Ok(None),
        }
    }

    /// 删除 redis 资源，先关闭其全部连接
    pub async fn delete(&self, id: u64) -> AppResult<()> {
        let redis = self
            .store
            .get_redis(id)
            .await?
            .ok_or_else(|| AppError::NotFound("redis信息不存在".into()))?;

        let closed = self.cache.invalidate_by_owner(id).await;
        self.store
            .apply(vec![
                StoreOp::DeleteRedis(id),
                StoreOp::RelateTags {
                    resource_type: TagResourceType::Redis,
                    code: redis.code,
                    tag_ids: Vec::new(),
                },
            ])
            .await?;
        tracing::info!(id = id, host = %redis.host, closed = closed, "删除redis");
        Ok(())
    }

    /// 测试连接：使用明文密码连接首个允许的库并 PING，随后关闭
    pub async fn test_conn(&self, redis: &Redis) -> AppResult<()> {
        let db = match AllowList::parse(&redis.db).first() {
            Some(first) => first
                .parse()
                .map_err(|_| AppError::Validation(format!("redis库号无效: {}", first)))?,
            None => 0,
        };
        let conn = self
            .connect(RedisInfo {
                id: redis.id,
                name: redis.name.clone(),
                host: redis.host.clone(),
                password: redis.password.clone().filter(|p| !p.is_empty()),
                db,
                tag_path: Vec::new(),
                flow_procdef_key: None,
            })
            .await?;
        let result = conn.ping().await;
        conn.close().await;
        result
    }

    /// 按参数中的资源与库执行命令
    pub async fn run_cmd_by_param(&self, param: RunCmdParam) -> AppResult<CmdOutcome> {
        let conn = self.get_redis_conn(param.id, param.db).await?;
        self.run_cmd(&conn, param).await
    }

    /// 执行命令；需要审批的写命令提交审批流程后返回 `Pending`
    pub async fn run_cmd(&self, conn: &RedisConn, param: RunCmdParam) -> AppResult<CmdOutcome> {
        let name = cmd_name(&param.cmd)?;

        if let Some(procdef_key) = conn.info.flow_procdef_key.as_deref().filter(|k| !k.is_empty())
        {
            if classify_cmd(&name) == CmdKind::Write {
                let biz_key = IdGenerator::biz_key();
                let biz_form = serde_json::to_string(&param)
                    .map_err(|e| AppError::Internal(format!("序列化命令失败: {}", e)))?;
                self.procinst
                    .start_proc(
                        procdef_key,
                        StartProcParam {
                            biz_type: REDIS_RUN_WRITE_CMD_FLOW_BIZ_TYPE.to_string(),
                            biz_key: biz_key.clone(),
                            biz_form,
                            remark: param.remark.clone(),
                        },
                    )
                    .await?;
                tracing::info!(
                    redis = %conn.info.log_desc(),
                    cmd = %name,
                    biz_key = %biz_key,
                    "写命令已提交审批"
                );
                return Ok(CmdOutcome::Pending { biz_key });
            }
        }

        let result = conn.run_cmd(&param.cmd).await?;
        tracing::debug!(redis = %conn.info.log_desc(), cmd = %name, "执行redis命令");
        Ok(CmdOutcome::Done { result })
    }

    /// 审批流程回调；仅流程完成时执行命令，否则返回 `None`
    pub async fn flow_biz_handle(&self, param: BizHandleParam) -> AppResult<Option<CmdOutcome>> {
        if param.procinst_status != ProcinstStatus::Completed {
            tracing::info!(
                biz_key = %param.biz_key,
                status = param.procinst_status.desc(),
                "审批流程未通过，不执行命令"
            );
            return Ok(None);
        }

        let cmd_param: RunCmdParam = serde_json::from_str(&param.biz_form)
            .map_err(|_| AppError::Validation("业务表单信息解析失败".into()))?;
        let conn = self.get_redis_conn(cmd_param.id, cmd_param.db).await?;
        let result = conn.run_cmd(&cmd_param.cmd).await?;
        tracing::info!(
            redis = %conn.info.log_desc(),
            biz_key = %param.biz_key,
            "审批通过，写命令已执行"
        );
        Ok(Some(CmdOutcome::Done { result }))
    }

    pub async fn close_all(&self) -> usize {
        self.cache.close_all().await
    }
}

/// 库号是否在允许列表中，未配置时仅允许 0 号库
fn db_allowed(allow_list: &str, db: u32) -> bool {
    let allowed = AllowList::parse(allow_list);
    if allowed.is_empty() {
        return db == 0;
    }
    allowed.contains(&db.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::AesGcmCipher;
    use crate::rdm::tests::FakeServer;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeConnector {
        server: Arc<FakeServer>,
        connects: AtomicUsize,
        last_password: Mutex<Option<String>>,
    }

    #[async_trait]
    impl RedisConnector for FakeConnector {
        async fn connect(&self, info: RedisInfo) -> AppResult<RedisConn> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.last_password.lock().unwrap() = info.password.clone();
            Ok(RedisConn::new(info, self.server.clone()))
        }
    }

    #[derive(Default)]
    struct RecordingProcinst {
        started: Mutex<Vec<(String, StartProcParam)>>,
    }

    #[async_trait]
    impl ProcinstApp for RecordingProcinst {
        async fn start_proc(&self, procdef_key: &str, param: StartProcParam) -> AppResult<()> {
            self.started
                .lock()
                .unwrap()
                .push((procdef_key.to_string(), param));
            Ok(())
        }
    }

    struct Fixture {
        app: RedisApp,
        store: Arc<MemoryStore>,
        server: Arc<FakeServer>,
        connector: Arc<FakeConnector>,
        procinst: Arc<RecordingProcinst>,
    }

    impl Fixture {
        fn connects(&self) -> usize {
            self.connector.connects.load(Ordering::SeqCst)
        }

        fn executed(&self) -> Vec<Vec<String>> {
            self.server.executed.lock().unwrap().clone()
        }
    }

    async fn fixture(flow_procdef_key: Option<&str>) -> Fixture {
        let cipher = Arc::new(AesGcmCipher::new("test-secret").unwrap());
        let store = Arc::new(MemoryStore::new());
        store
            .apply(vec![StoreOp::InsertRedis(Redis {
                id: 7,
                code: "redis7".into(),
                name: "cache".into(),
                host: "127.0.0.1:6379".into(),
                password: Some(cipher.encrypt("pw").unwrap()),
                db: "0,2".into(),
                flow_procdef_key: flow_procdef_key.map(String::from),
            })])
            .await
            .unwrap();

        let server = Arc::new(FakeServer::default());
        let connector = Arc::new(FakeConnector {
            server: server.clone(),
            connects: AtomicUsize::new(0),
            last_password: Mutex::new(None),
        });
        let procinst = Arc::new(RecordingProcinst::default());
        let app = RedisApp::new(
            &AppConfig::default(),
            store.clone(),
            cipher,
            connector.clone(),
            procinst.clone(),
            CancellationToken::new(),
        );
        Fixture {
            app,
            store,
            server,
            connector,
            procinst,
        }
    }

    fn param(cmd: serde_json::Value) -> RunCmdParam {
        serde_json::from_value(json!({"id": 7, "db": 2, "cmd": cmd, "remark": "fix data"})).unwrap()
    }

    fn callback(status: ProcinstStatus, biz_form: String) -> BizHandleParam {
        BizHandleParam {
            biz_key: "k".into(),
            biz_type: REDIS_RUN_WRITE_CMD_FLOW_BIZ_TYPE.into(),
            procinst_status: status,
            biz_form,
        }
    }

    #[tokio::test]
    async fn test_write_with_flow_is_deferred() {
        let fx = fixture(Some("redis_write")).await;
        let outcome = fx.app.run_cmd_by_param(param(json!(["SET", "k", "v"]))).await.unwrap();

        let CmdOutcome::Pending { biz_key } = outcome else {
            panic!("expected pending outcome");
        };
        assert_eq!(biz_key.len(), 24);
        assert!(fx.executed().is_empty());

        let started = fx.procinst.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        let (key, start) = &started[0];
        assert_eq!(key, "redis_write");
        assert_eq!(start.biz_type, REDIS_RUN_WRITE_CMD_FLOW_BIZ_TYPE);
        assert_eq!(start.biz_key, biz_key);
        assert_eq!(start.remark, "fix data");
        let form: RunCmdParam = serde_json::from_str(&start.biz_form).unwrap();
        assert_eq!(form, param(json!(["SET", "k", "v"])));
    }

    #[tokio::test]
    async fn test_read_with_flow_runs_immediately() {
        let fx = fixture(Some("redis_write")).await;
        fx.server
            .data
            .lock()
            .unwrap()
            .insert("k".into(), "v".into());

        let outcome = fx.app.run_cmd_by_param(param(json!(["get", "k"]))).await.unwrap();
        assert_eq!(outcome, CmdOutcome::Done { result: Some(json!("v")) });
        assert!(fx.procinst.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_without_flow_runs_immediately() {
        let fx = fixture(None).await;
        let outcome = fx.app.run_cmd_by_param(param(json!(["SET", "k", 1]))).await.unwrap();
        assert_eq!(outcome, CmdOutcome::Done { result: Some(json!("OK")) });
        assert_eq!(fx.server.data.lock().unwrap().get("k").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_missing_key_is_success() {
        let fx = fixture(None).await;
        let outcome = fx.app.run_cmd_by_param(param(json!(["GET", "nope"]))).await.unwrap();
        assert_eq!(outcome, CmdOutcome::Done { result: None });
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let fx = fixture(None).await;
        let err = fx.app.run_cmd_by_param(param(json!([]))).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(fx.executed().is_empty());
    }

    #[tokio::test]
    async fn test_select_cannot_switch_shared_connection() {
        let fx = fixture(Some("redis_write")).await;
        for cmd in [json!(["SELECT", "5"]), json!(["swapdb", 2, 5])] {
            let err = fx.app.run_cmd_by_param(param(cmd)).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
        assert!(fx.executed().is_empty());
        assert!(fx.procinst.started.lock().unwrap().is_empty());

        let form = serde_json::to_string(&param(json!(["SELECT", "5"]))).unwrap();
        let err = fx
            .app
            .flow_biz_handle(callback(ProcinstStatus::Completed, form))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(fx.executed().is_empty());
    }

    #[tokio::test]
    async fn test_caller_cancel_interrupts_connect() {
        struct StuckConnector;

        #[async_trait]
        impl RedisConnector for StuckConnector {
            async fn connect(&self, _info: RedisInfo) -> AppResult<RedisConn> {
                std::future::pending().await
            }
        }

        let fx = fixture(None).await;
        let app = RedisApp::new(
            &AppConfig::default(),
            fx.store.clone(),
            Arc::new(AesGcmCipher::new("test-secret").unwrap()),
            Arc::new(StuckConnector),
            fx.procinst.clone(),
            CancellationToken::new(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = app.get_redis_conn_until(7, 0, &cancel).await.err().unwrap();
        assert!(matches!(err, AppError::Cancelled));
        assert!(app.cache().is_empty());
    }

    #[tokio::test]
    async fn test_completed_flow_executes_once() {
        let fx = fixture(Some("redis_write")).await;
        fx.app.run_cmd_by_param(param(json!(["SET", "k", "v"]))).await.unwrap();
        let form = fx.procinst.started.lock().unwrap()[0].1.biz_form.clone();

        let outcome = fx
            .app
            .flow_biz_handle(callback(ProcinstStatus::Completed, form))
            .await
            .unwrap();

        assert_eq!(outcome, Some(CmdOutcome::Done { result: Some(json!("OK")) }));
        assert_eq!(fx.executed(), vec![vec!["SET", "k", "v"]]);
        assert_eq!(fx.server.data.lock().unwrap().get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_rejected_flow_never_executes() {
        let fx = fixture(Some("redis_write")).await;
        fx.app.run_cmd_by_param(param(json!(["DEL", "k"]))).await.unwrap();
        let form = fx.procinst.started.lock().unwrap()[0].1.biz_form.clone();

        for status in [
            ProcinstStatus::Rejected,
            ProcinstStatus::Back,
            ProcinstStatus::Cancelled,
            ProcinstStatus::Terminated,
        ] {
            let outcome = fx.app.flow_biz_handle(callback(status, form.clone())).await.unwrap();
            assert_eq!(outcome, None);
        }
        assert!(fx.executed().is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_form_is_validation_error() {
        let fx = fixture(None).await;
        let err = fx
            .app
            .flow_biz_handle(callback(ProcinstStatus::Completed, "not json".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "参数校验失败: 业务表单信息解析失败");
    }

    #[tokio::test]
    async fn test_db_outside_allow_list_is_denied_without_connecting() {
        let fx = fixture(None).await;
        let err = fx.app.get_redis_conn(7, 1).await.err().unwrap();
        assert!(matches!(err, AppError::PermissionDenied(_)));
        assert_eq!(fx.connects(), 0);

        let conn = fx.app.get_redis_conn(7, 2).await.unwrap();
        assert_eq!(conn.info.db, 2);
        assert_eq!(fx.connector.last_password.lock().unwrap().as_deref(), Some("pw"));
    }

    #[test]
    fn test_empty_allow_list_means_db_zero() {
        assert!(db_allowed("", 0));
        assert!(!db_allowed("", 1));
        assert!(db_allowed("1 3", 3));
        assert!(!db_allowed("1 3", 0));
    }

    #[tokio::test]
    async fn test_connection_is_cached() {
        let fx = fixture(None).await;
        let a = fx.app.get_redis_conn(7, 0).await.unwrap();
        let b = fx.app.get_redis_conn(7, 0).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fx.connects(), 1);
        assert!(matches!(
            fx.app.get_redis_conn(8, 0).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_invalidates_and_keeps_password() {
        let fx = fixture(None).await;
        let conn = fx.app.get_redis_conn(7, 2).await.unwrap();

        let mut redis = fx.store.get_redis(7).await.unwrap().unwrap();
        let stored_password = redis.password.clone();
        redis.password = None;
        redis.db = "0".into();
        redis.code = "changed".into();
        fx.app.save_redis(redis, vec![]).await.unwrap();

        assert!(conn.is_closed());
        let saved = fx.store.get_redis(7).await.unwrap().unwrap();
        assert_eq!(saved.password, stored_password);
        assert_eq!(saved.code, "redis7");
        assert!(matches!(
            fx.app.get_redis_conn(7, 2).await,
            Err(AppError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_unchanged_update_keeps_connection() {
        let fx = fixture(None).await;
        let conn = fx.app.get_redis_conn(7, 0).await.unwrap();
        let mut redis = fx.store.get_redis(7).await.unwrap().unwrap();
        redis.name = "renamed".into();
        redis.password = None;
        fx.app.save_redis(redis, vec![]).await.unwrap();
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let fx = fixture(None).await;
        let new_redis = Redis {
            id: 0,
            code: String::new(),
            name: "other".into(),
            host: "127.0.0.1:6379".into(),
            password: Some("pw2".into()),
            db: String::new(),
            flow_procdef_key: None,
        };
        assert!(matches!(
            fx.app.save_redis(new_redis.clone(), vec![]).await,
            Err(AppError::AlreadyExists(ref m)) if m == "该实例已存在"
        ));

        let dup_code = Redis {
            host: "10.0.0.1:6379".into(),
            code: "redis7".into(),
            ..new_redis.clone()
        };
        assert!(matches!(
            fx.app.save_redis(dup_code, vec![]).await,
            Err(AppError::AlreadyExists(ref m)) if m == "该编码已存在"
        ));

        let ok = Redis {
            host: "10.0.0.1:6379".into(),
            ..new_redis
        };
        fx.app.save_redis(ok, vec![]).await.unwrap();
        let saved = fx.store.find_redis_by_host("10.0.0.1:6379").await.unwrap().unwrap();
        assert_eq!(saved.code.len(), 16);
        assert_ne!(saved.password.as_deref(), Some("pw2"));
    }

    #[tokio::test]
    async fn test_delete_closes_connections() {
        let fx = fixture(None).await;
        let db0 = fx.app.get_redis_conn(7, 0).await.unwrap();
        let db2 = fx.app.get_redis_conn(7, 2).await.unwrap();

        fx.app.delete(7).await.unwrap();

        assert!(db0.is_closed() && db2.is_closed());
        assert!(fx.app.cache().is_empty());
        assert!(fx.store.get_redis(7).await.unwrap().is_none());
        assert!(matches!(fx.app.delete(7).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_conn_pings_first_db_and_closes() {
        let fx = fixture(None).await;
        let redis = Redis {
            id: 0,
            code: String::new(),
            name: "trial".into(),
            host: "10.0.0.9:6379".into(),
            password: Some("plain".into()),
            db: "3, 4".into(),
            flow_procdef_key: None,
        };
        fx.app.test_conn(&redis).await.unwrap();
        assert_eq!(fx.executed(), vec![vec!["PING"]]);
        assert_eq!(fx.connector.last_password.lock().unwrap().as_deref(), Some("plain"));
        assert!(fx.app.cache().is_empty());
    }
}
