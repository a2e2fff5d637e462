//! 统一错误处理
//!
//! 服务层与仓储层共用 [`AppError`]，在 API 层直接转换为 JSON 响应:
//!
//! ```json
//! { "success": false, "error": { "code": "INVALID_STATE_TRANSITION", "message": "..." } }
//! ```

use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// 应用错误
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 请求字段缺失或非法 (400)
    #[error("validation failed: {0}")]
    Validation(String),

    /// 资源不存在 (404)
    #[error("not found: {0}")]
    NotFound(String),

    /// 状态机不允许的迁移 (409)
    #[error("invalid state transition for {entity}: {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// 重复处理 / 并发写冲突 (409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// 外部服务 (文本提取、消息总线) 失败 (502)
    #[error("external service error: {0}")]
    ExternalService(String),

    /// 数据库错误 (500)
    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AppError::Conflict(msg.into())
    }

    pub fn transition(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        AppError::InvalidStateTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            AppError::Conflict(_) => "CONFLICT",
            AppError::ExternalService(_) => "EXTERNAL_SERVICE_ERROR",
            AppError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidStateTransition { .. } | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            AppError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => AppError::Conflict(
                format!("unique constraint {}", db_err.constraint().unwrap_or("violated")),
            ),
            _ => AppError::Persistence(e.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        AppError::Persistence(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::ExternalService(e.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(e: MultipartError) -> Self {
        AppError::Validation(format!("multipart: {}", e.body_text()))
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Persistence(format!("io: {}", e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        // 数据库细节只写日志，不返回给客户端
        let message = match &self {
            AppError::Persistence(detail) => {
                tracing::error!(error = %detail, "persistence failure");
                "internal persistence error".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "success": false,
            "error": { "code": self.code(), "message": message },
        });
        (status, Json(body)).into_response()
    }
}
