//! 连接服务路由模块

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::handlers::{
    delete_db, delete_redis, dump_db, flow_biz_handle, health_check, run_cmd, save_db,
    save_redis, test_redis_conn,
};
use crate::state::AppState;

/// 创建连接服务路由
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/dbs", post(save_db))
        .route("/api/dbs/{id}", delete(delete_db))
        .route("/api/dbs/{id}/dump", get(dump_db))
        .route("/api/redis", post(save_redis))
        .route("/api/redis/test-conn", post(test_redis_conn))
        .route("/api/redis/{id}", delete(delete_redis))
        .route("/api/redis/{id}/{db}/run-cmd", post(run_cmd))
        .route("/internal/flow/biz-handle", post(flow_biz_handle))
}
