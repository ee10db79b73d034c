use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error kinds surfaced through every component. The gateway maps them to
/// HTTP statuses on REST and to `{success:false, error}` replies on sockets.
#[derive(Debug, Error)]
pub enum PulseError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("dependency failure: {0}")]
    Dependency(String),
}

pub type PulseResult<T> = Result<T, PulseError>;

impl PulseError {
    /// Stable kind label used in socket error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            PulseError::Unauthenticated(_) => "unauthenticated",
            PulseError::Forbidden(_) => "forbidden",
            PulseError::BadRequest(_) => "bad-request",
            PulseError::NotFound(_) => "not-found",
            PulseError::Conflict(_) => "conflict",
            PulseError::Dependency(_) => "dependency-failure",
        }
    }
}

impl From<diesel::result::Error> for PulseError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                info,
            ) => PulseError::Conflict(info.message().to_string()),
            other => PulseError::Dependency(format!("database error: {}", other)),
        }
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for PulseError {
    fn from(e: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        PulseError::Dependency(format!("database pool error: {}", e))
    }
}

impl From<redis::RedisError> for PulseError {
    fn from(e: redis::RedisError) -> Self {
        PulseError::Dependency(format!("redis error: {}", e))
    }
}

impl From<reqwest::Error> for PulseError {
    fn from(e: reqwest::Error) -> Self {
        PulseError::Dependency(format!("blob store error: {}", e))
    }
}

impl IntoResponse for PulseError {
    fn into_response(self) -> Response {
        let status = match &self {
            PulseError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            PulseError::Forbidden(_) => StatusCode::FORBIDDEN,
            PulseError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PulseError::NotFound(_) => StatusCode::NOT_FOUND,
            PulseError::Conflict(_) => StatusCode::CONFLICT,
            PulseError::Dependency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(PulseError::Unauthenticated("x".into()).kind(), "unauthenticated");
        assert_eq!(PulseError::Forbidden("x".into()).kind(), "forbidden");
        assert_eq!(PulseError::BadRequest("x".into()).kind(), "bad-request");
        assert_eq!(PulseError::NotFound("x".into()).kind(), "not-found");
        assert_eq!(PulseError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(PulseError::Dependency("x".into()).kind(), "dependency-failure");
    }
}
