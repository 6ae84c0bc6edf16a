//! 数据库连接管理服务

use anyhow::Context;
use axum::{middleware, routing::get, Json, Router};
use common::config::AppConfig;
use common::middleware::request_id::request_id_middleware;
use connection_service::handlers::{self, SERVICE_NAME};
use connection_service::routes;
use connection_service::state::AppState;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "连接服务 API",
        version = "0.1.0",
        description = "数据库连接管理微服务"
    ),
    paths(
        handlers::health_check,
        handlers::save_db,
        handlers::delete_db,
        handlers::dump_db,
        handlers::save_redis,
        handlers::test_redis_conn,
        handlers::delete_redis,
        handlers::run_cmd,
        handlers::flow_biz_handle,
    ),
    components(schemas(
        common::models::CmdOutcome,
        common::models::RunCmdRequest,
        common::models::BizHandleParam,
        common::models::ProcinstStatus,
        handlers::SaveDbRequest,
        handlers::SaveRedisRequest,
        handlers::HealthResponse,
    )),
    tags(
        (name = "dbs", description = "数据库资源与导出端点"),
        (name = "redis", description = "redis 资源与命令端点"),
        (name = "flow", description = "审批流程回调端点"),
        (name = "health", description = "健康检查端点")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (if present) before anything else
    load_dotenv();

    // 初始化日志追踪
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // 加载配置
    let config = AppConfig::load_with_service(SERVICE_NAME);

    // 创建应用状态（元数据库未配置时使用内存存储）
    let shutdown = CancellationToken::new();
    let state = AppState::new(config.clone(), shutdown.clone())
        .await
        .context("Failed to initialize application state")?;

    let app = create_router(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    info!(service = SERVICE_NAME, address = %addr, "启动服务");

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("服务运行失败")?;

    state.close().await;
    info!(service = SERVICE_NAME, "服务已停止");
    Ok(())
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::router())
        .route("/api-docs/openapi.json", get(openapi_json))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Resolves on Ctrl+C and cancels in-flight work so streamed dumps end.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "无法监听退出信号");
        std::future::pending::<()>().await;
    }
    info!("收到退出信号，开始关闭");
    shutdown.cancel();
}

/// Load .env file from the working directory (best-effort, no error if missing).
fn load_dotenv() {
    let env_path = std::path::Path::new(".env");
    if let Ok(content) = std::fs::read_to_string(env_path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                // Only set if not already set by the environment
                if std::env::var(key).is_err() {
                    std::env::set_var(key, value.trim().trim_matches('"'));
                }
            }
        }
    }
}
