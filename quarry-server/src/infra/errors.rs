use std::{fmt, time::Duration};

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use quarry_core::GovernorError;
use serde_json::json;
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

/// Shown for every rejection caused by a resource ceiling.
pub const BUSY_MESSAGE: &str = "system busy, try again shortly";

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        let mut response = (self.status, body).into_response();
        if let Some(retry_after) = self.retry_after {
            // Whole seconds, rounded up so clients never retry early.
            let secs = retry_after.as_secs()
                + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

impl From<GovernorError> for AppError {
    fn from(err: GovernorError) -> Self {
        let retry_after = err.retry_after();
        let app_error = match &err {
            GovernorError::AdmissionRejected { .. }
            | GovernorError::PoolExhausted { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, BUSY_MESSAGE)
            }
            GovernorError::RateLimitExceeded { .. }
            | GovernorError::ConcurrencyLimitExceeded { .. } => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, BUSY_MESSAGE)
            }
            GovernorError::Query(db) => Self::bad_request(db.to_string()),
            GovernorError::QueryTimeout { .. } => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, err.to_string())
            }
            GovernorError::Connection(db) => {
                error!(error = %db, "database connection failed");
                Self::new(StatusCode::BAD_GATEWAY, "database unavailable")
            }
            GovernorError::InvalidIdentifier { .. } => {
                Self::bad_request(err.to_string())
            }
            GovernorError::WorkspaceNotFound { .. }
            | GovernorError::JobNotFound(_) => Self::not_found(err.to_string()),
            GovernorError::WorkspaceInit { .. } => {
                error!(error = %err, "workspace initialization failed");
                Self::internal("failed to prepare workspace")
            }
            GovernorError::JobSpawn { .. } | GovernorError::Io(_) => {
                error!(error = %err, "governor operation failed");
                Self::internal("internal error")
            }
        };
        app_error.with_retry_after(retry_after)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::pool::DbError;

    use super::*;

    #[test]
    fn busy_rejections_share_one_message() {
        let admission: AppError = GovernorError::AdmissionRejected {
            running: 2,
            limit: 2,
        }
        .into();
        let concurrency: AppError =
            GovernorError::ConcurrencyLimitExceeded { limit: 5 }.into();

        assert_eq!(admission.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(concurrency.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(admission.message, BUSY_MESSAGE);
        assert_eq!(concurrency.message, BUSY_MESSAGE);
        assert!(admission.retry_after.is_some());
    }

    #[test]
    fn learner_sql_errors_are_client_errors() {
        let err: AppError =
            GovernorError::Query(DbError::query("syntax error at or near"))
                .into();

        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("syntax error"));
        assert_eq!(err.retry_after, None);
    }

    #[test]
    fn retry_after_header_rounds_up() {
        let response = AppError::new(StatusCode::TOO_MANY_REQUESTS, BUSY_MESSAGE)
            .with_retry_after(Some(Duration::from_millis(2_100)))
            .into_response();

        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("3"))
        );
    }
}
