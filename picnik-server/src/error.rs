use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use picnik_common::ApiError;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidOperation(String),

    #[error("{0}")]
    AlreadyProcessed(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("user is not invited to this picnic")]
    NotInvited,

    #[error("{0}")]
    Unauthenticated(String),

    #[error("upstream provider error: {0}")]
    Upstream(String),

    /// The atomic batch did not commit; nothing was written and the call may be retried.
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidOperation(_) => "invalid_operation",
            AppError::AlreadyProcessed(_) => "already_processed",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::NotInvited => "not_invited",
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::Upstream(_) => "upstream",
            AppError::Storage(_) => "storage",
            AppError::Unknown(_) => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Storage(_) | AppError::Upstream(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            AppError::AlreadyProcessed(_) => StatusCode::CONFLICT,
            AppError::PermissionDenied(_) | AppError::NotInvited => StatusCode::FORBIDDEN,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sled::Error> for AppError {
    fn from(err: sled::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Unknown(err.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Unknown(err.into())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), "{self:#}");
        }
        let body = ApiError {
            success: false,
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_carry_status_and_code() {
        let response = AppError::AlreadyProcessed("done".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(AppError::NotInvited.code(), "not_invited");
        assert_eq!(AppError::NotFound("picnic p1".into()).to_string(), "picnic p1 not found");
        assert!(AppError::Storage("io".into()).is_retryable());
        assert!(!AppError::PermissionDenied("no".into()).is_retryable());
    }
}
