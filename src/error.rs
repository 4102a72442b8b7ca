use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

pub type ApiResult<T> = Result<T, ApiError>;

/// Token verification failures. All of these surface to the client as the
/// same generic 401 so a caller cannot probe which check failed; the concrete
/// cause is logged server-side.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("token principal no longer exists")]
    PrincipalNotFound,
    #[error("refresh token does not match the active session")]
    TokenMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Upload(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidCredentials | ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Upload(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code, independent of the human message.
    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Conflict(_) => "conflict",
            ApiError::InvalidCredentials => "invalid_credentials",
            ApiError::Auth(_) => "unauthorized",
            ApiError::Upload(_) => "upload_error",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            // Never leak internal error values or which auth check failed.
            ApiError::Internal(e) => {
                error!(error = %e, "internal error");
                "Something went wrong".to_string()
            }
            ApiError::Auth(e) => {
                warn!(reason = %e, "unauthorized");
                "Unauthorized".to_string()
            }
            other => other.to_string(),
        };
        let status = self.status();
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // Unique-constraint violation: the pre-insert uniqueness check
            // lost a race with a concurrent registration.
            if db.code().as_deref() == Some("23505") {
                return ApiError::Conflict("User already exists".into());
            }
        }
        ApiError::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_code_mapping() {
        let cases: Vec<(ApiError, StatusCode, &str)> = vec![
            (
                ApiError::Validation("x".into()),
                StatusCode::BAD_REQUEST,
                "validation_error",
            ),
            (
                ApiError::Conflict("x".into()),
                StatusCode::CONFLICT,
                "conflict",
            ),
            (
                ApiError::InvalidCredentials,
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
            ),
            (
                ApiError::Auth(AuthError::TokenMismatch),
                StatusCode::UNAUTHORIZED,
                "unauthorized",
            ),
            (
                ApiError::Upload("x".into()),
                StatusCode::BAD_GATEWAY,
                "upload_error",
            ),
            (
                ApiError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn auth_failures_share_one_client_facing_code() {
        for auth in [
            AuthError::InvalidToken,
            AuthError::PrincipalNotFound,
            AuthError::TokenMismatch,
        ] {
            assert_eq!(ApiError::Auth(auth).code(), "unauthorized");
        }
    }
}
