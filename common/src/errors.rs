//! Application error types.
//!
//! Every fallible operation in the services returns [`AppResult`]. Errors carry
//! a business message only; driver and crypto internals are flattened into
//! strings at the boundary where they occur.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::response::ApiResponse;

/// Result alias used across all services.
pub type AppResult<T> = Result<T, AppError>;

/// Application error.
///
/// `Clone` so a single failed connection attempt can be reported to every
/// caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Missing instance / database / redis record.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate resource identity on create or rename.
    #[error("{0}")]
    AlreadyExists(String),

    /// Requested sub-resource is outside the configured allow-list.
    #[error("{0}")]
    PermissionDenied(String),

    /// Stored credential could not be decrypted.
    #[error("{0}")]
    DecryptionFailed(String),

    /// Network or driver level failure while connecting.
    #[error("连接失败: {0}")]
    ConnectionFailed(String),

    /// Schema query failure during a dump.
    #[error("元数据获取失败: {0}")]
    MetadataFetchFailed(String),

    /// Request validation failure.
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// Query execution failure on a managed database.
    #[error("数据库查询失败: {0}")]
    DatabaseQuery(String),

    /// Redis command failure.
    #[error("Redis 操作失败: {0}")]
    RedisOperation(String),

    /// Database type without driver support.
    #[error("不支持的数据库类型: {0}")]
    UnsupportedDatabaseType(String),

    /// Failure calling another service.
    #[error("外部服务调用失败: {0}")]
    ExternalService(String),

    /// Operation stopped by its cancellation token.
    #[error("操作已取消")]
    Cancelled,

    /// Unexpected internal failure.
    #[error("内部错误: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable error code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::AlreadyExists(_) => "ALREADY_EXISTS",
            AppError::PermissionDenied(_) => "PERMISSION_DENIED",
            AppError::DecryptionFailed(_) => "DECRYPTION_FAILED",
            AppError::ConnectionFailed(_) => "CONNECTION_FAILED",
            AppError::MetadataFetchFailed(_) => "METADATA_FETCH_FAILED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::DatabaseQuery(_) => "DATABASE_QUERY_ERROR",
            AppError::RedisOperation(_) => "REDIS_OPERATION_ERROR",
            AppError::UnsupportedDatabaseType(_) => "UNSUPPORTED_DATABASE_TYPE",
            AppError::ExternalService(_) => "EXTERNAL_SERVICE_ERROR",
            AppError::Cancelled => "CANCELLED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::UnsupportedDatabaseType(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::ConnectionFailed(_) | AppError::ExternalService(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            AppError::DecryptionFailed(_)
            | AppError::MetadataFetchFailed(_)
            | AppError::DatabaseQuery(_)
            | AppError::RedisOperation(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "请求处理失败");
        } else {
            tracing::warn!(code = self.code(), error = %self, "请求被拒绝");
        }
        (status, Json(ApiResponse::err(self.code(), self.to_string()))).into_response()
    }
}
