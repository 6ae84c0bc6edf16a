//! Handler模块

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Local, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use utoipa::ToSchema;
use validator::Validate;

use common::errors::AppError;
use common::models::flow::REDIS_RUN_WRITE_CMD_FLOW_BIZ_TYPE;
use common::models::{BizHandleParam, CmdOutcome, Db, DumpDbQuery, Redis, RunCmdParam, RunCmdRequest};
use common::response::ApiResponse;

use crate::db_app::DumpRequest;
use crate::dump::DumpOptions;
use crate::state::AppState;

pub const SERVICE_NAME: &str = "connection-service";

/// 导出管道缓冲大小
const DUMP_PIPE_BYTES: usize = 64 * 1024;

/// 健康检查端点
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "health",
    responses(
        (status = 200, description = "服务运行正常", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        connections: state.connection_count(),
    })
}

/// 新增或更新数据库资源
#[utoipa::path(
    post,
    path = "/api/dbs",
    tag = "dbs",
    request_body = SaveDbRequest,
    responses(
        (status = 200, description = "已保存", body = ApiResponse<bool>),
        (status = 409, description = "数据库名已存在")
    )
)]
pub async fn save_db(
    State(state): State<AppState>,
    Json(req): Json<SaveDbRequest>,
) -> Result<Json<ApiResponse<bool>>, AppError> {
    req.validate()?;
    let (db, tag_ids) = req.into_parts();
    state.db_app.save_db(db, tag_ids).await?;
    Ok(Json(ApiResponse::ok_with_service(true, SERVICE_NAME)))
}

/// 删除数据库资源
#[utoipa::path(
    delete,
    path = "/api/dbs/{id}",
    tag = "dbs",
    params(
        ("id" = u64, Path, description = "数据库资源 ID")
    ),
    responses(
        (status = 200, description = "已删除", body = ApiResponse<bool>),
        (status = 404, description = "数据库未找到")
    )
)]
pub async fn delete_db(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ApiResponse<bool>>, AppError> {
    state.db_app.delete(id).await?;
    Ok(Json(ApiResponse::ok_with_service(true, SERVICE_NAME)))
}

/// 导出数据库为 SQL 文件（流式响应）
///
/// 连接在响应开始前解析，权限或连接错误以 JSON 错误返回；
/// 导出过程中的错误会中断输出流。
#[utoipa::path(
    get,
    path = "/api/dbs/{id}/dump",
    tag = "dbs",
    params(
        ("id" = u64, Path, description = "数据库资源 ID"),
        DumpDbQuery
    ),
    responses(
        (status = 200, description = "SQL 文本", body = String, content_type = "text/plain"),
        (status = 403, description = "未配置该库的操作权限"),
        (status = 404, description = "数据库未找到")
    )
)]
pub async fn dump_db(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<DumpDbQuery>,
) -> Result<Response, AppError> {
    query.validate()?;
    let cancel = state.shutdown.child_token();
    let conn = state
        .db_app
        .get_db_conn_until(id, &query.db, &cancel)
        .await?;

    let req = DumpRequest {
        db_id: id,
        db_name: query.db.clone(),
        options: DumpOptions {
            tables: query.table_list(),
            dump_ddl: query.ddl,
            dump_data: query.data,
        },
    };
    let (writer, reader) = tokio::io::duplex(DUMP_PIPE_BYTES);
    let (failed_tx, failed_rx) = oneshot::channel::<io::Error>();
    let db_app = state.db_app.clone();
    tokio::spawn(async move {
        // 客户端断开时写入失败，导出随之终止
        if let Err(e) = db_app.dump_conn(&conn, &req, writer, &cancel).await {
            tracing::warn!(db_id = req.db_id, db = %req.db_name, error = %e, "导出中断");
            let _ = failed_tx.send(io::Error::other(e.to_string()));
        }
    });

    // 导出失败时以错误结束响应体，客户端不会把截断的文件当作完整导出
    let failure = stream::once(failed_rx).filter_map(|r| async move { r.ok().map(Err) });
    let body = ReaderStream::new(reader).chain(failure);

    let filename = format!("{}.{}.sql", query.db, Local::now().format("%Y%m%d%H%M"));
    let headers = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        ),
    ];
    Ok((headers, Body::from_stream(body)).into_response())
}

/// 新增或更新 redis 资源
#[utoipa::path(
    post,
    path = "/api/redis",
    tag = "redis",
    request_body = SaveRedisRequest,
    responses(
        (status = 200, description = "已保存", body = ApiResponse<bool>),
        (status = 409, description = "实例或编码已存在")
    )
)]
pub async fn save_redis(
    State(state): State<AppState>,
    Json(req): Json<SaveRedisRequest>,
) -> Result<Json<ApiResponse<bool>>, AppError> {
    req.validate()?;
    let (redis, tag_ids) = req.into_parts();
    state.redis_app.save_redis(redis, tag_ids).await?;
    Ok(Json(ApiResponse::ok_with_service(true, SERVICE_NAME)))
}

/// 测试 redis 连接
#[utoipa::path(
    post,
    path = "/api/redis/test-conn",
    tag = "redis",
    request_body = SaveRedisRequest,
    responses(
        (status = 200, description = "连接成功", body = ApiResponse<bool>),
        (status = 502, description = "连接失败")
    )
)]
pub async fn test_redis_conn(
    State(state): State<AppState>,
    Json(req): Json<SaveRedisRequest>,
) -> Result<Json<ApiResponse<bool>>, AppError> {
    req.validate()?;
    let (redis, _) = req.into_parts();
    state.redis_app.test_conn(&redis).await?;
    Ok(Json(ApiResponse::ok_with_service(true, SERVICE_NAME)))
}

/// 删除 redis 资源
#[utoipa::path(
    delete,
    path = "/api/redis/{id}",
    tag = "redis",
    params(
        ("id" = u64, Path, description = "redis 资源 ID")
    ),
    responses(
        (status = 200, description = "已删除", body = ApiResponse<bool>),
        (status = 404, description = "redis 未找到")
    )
)]
pub async fn delete_redis(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ApiResponse<bool>>, AppError> {
    state.redis_app.delete(id).await?;
    Ok(Json(ApiResponse::ok_with_service(true, SERVICE_NAME)))
}

/// 执行 redis 命令
///
/// 需要审批的写命令返回 `pending` 与流程业务 key，审批通过后由回调执行。
#[utoipa::path(
    post,
    path = "/api/redis/{id}/{db}/run-cmd",
    tag = "redis",
    params(
        ("id" = u64, Path, description = "redis 资源 ID"),
        ("db" = u32, Path, description = "库号")
    ),
    request_body = RunCmdRequest,
    responses(
        (status = 200, description = "执行结果或待审批", body = ApiResponse<CmdOutcome>),
        (status = 403, description = "未配置该库的操作权限")
    )
)]
pub async fn run_cmd(
    State(state): State<AppState>,
    Path((id, db)): Path<(u64, u32)>,
    Json(req): Json<RunCmdRequest>,
) -> Result<Json<ApiResponse<CmdOutcome>>, AppError> {
    req.validate()?;
    let outcome = state
        .redis_app
        .run_cmd_by_param(RunCmdParam {
            id,
            db,
            cmd: req.cmd,
            remark: req.remark.unwrap_or_default(),
        })
        .await?;
    Ok(Json(ApiResponse::ok_with_service(outcome, SERVICE_NAME)))
}

/// 审批流程回调（内部端点，供流程服务调用）
#[utoipa::path(
    post,
    path = "/internal/flow/biz-handle",
    tag = "flow",
    request_body = BizHandleParam,
    responses(
        (status = 200, description = "已处理；未通过的流程返回空数据", body = ApiResponse<CmdOutcome>),
        (status = 400, description = "业务类型或表单无效")
    )
)]
pub async fn flow_biz_handle(
    State(state): State<AppState>,
    Json(param): Json<BizHandleParam>,
) -> Result<Json<ApiResponse<Option<CmdOutcome>>>, AppError> {
    if !param.biz_type.is_empty() && param.biz_type != REDIS_RUN_WRITE_CMD_FLOW_BIZ_TYPE {
        return Err(AppError::Validation(format!(
            "不支持的业务类型: {}",
            param.biz_type
        )));
    }
    let outcome = state.redis_app.flow_biz_handle(param).await?;
    Ok(Json(ApiResponse::ok_with_service(outcome, SERVICE_NAME)))
}

/// 保存数据库资源请求，`id` 为 0 时新增
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveDbRequest {
    #[serde(default)]
    pub id: u64,
    pub instance_id: u64,
    #[validate(length(min = 1, max = 64, message = "Name must be 1-64 characters"))]
    pub name: String,
    /// 允许操作的数据库名，空格或逗号分隔
    #[validate(length(min = 1, message = "Database is required"))]
    pub database: String,
    #[serde(default)]
    pub flow_procdef_key: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<u64>,
}

impl SaveDbRequest {
    fn into_parts(self) -> (Db, Vec<u64>) {
        let db = Db {
            id: self.id,
            instance_id: self.instance_id,
            name: self.name,
            code: String::new(),
            database: self.database,
            flow_procdef_key: self.flow_procdef_key.filter(|k| !k.is_empty()),
        };
        (db, self.tag_ids)
    }
}

/// 保存 redis 资源请求，`id` 为 0 时新增
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveRedisRequest {
    #[serde(default)]
    pub id: u64,
    /// 资源编码，新增时为空则自动生成
    #[serde(default)]
    pub code: String,
    #[validate(length(min = 1, max = 64, message = "Name must be 1-64 characters"))]
    pub name: String,
    /// `host:port`
    #[validate(length(min = 1, message = "Host is required"))]
    pub host: String,
    /// 明文密码；更新时为空表示不修改
    #[serde(default)]
    pub password: Option<String>,
    /// 允许操作的库号，为空时仅允许 0 号库
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub flow_procdef_key: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<u64>,
}

impl SaveRedisRequest {
    fn into_parts(self) -> (Redis, Vec<u64>) {
        let redis = Redis {
            id: self.id,
            code: self.code,
            name: self.name,
            host: self.host,
            password: self.password,
            db: self.db,
            flow_procdef_key: self.flow_procdef_key.filter(|k| !k.is_empty()),
        };
        (redis, self.tag_ids)
    }
}

/// 健康检查响应
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// 服务状态
    pub status: String,
    /// 服务名称
    pub service: String,
    /// 服务版本
    pub version: String,
    /// 当前时间戳
    pub timestamp: DateTime<Utc>,
    /// 已缓存的连接数
    pub connections: usize,
}
