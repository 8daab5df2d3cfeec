use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Internal(String),
}

// Postgres SQLSTATE codes we translate instead of masking.
const PG_UNIQUE_VIOLATION: &str = "23505";
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";
const PG_EXCLUSION_VIOLATION: &str = "23P01";

impl ApiError {
    pub fn invalid_credentials() -> Self {
        ApiError::Unauthorized("INVALID_CREDENTIALS", "Username or password is incorrect".into())
    }

    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", message.into())
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound("NOT_FOUND", format!("{what} not found"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(..) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(..) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(..) => StatusCode::NOT_FOUND,
            ApiError::Conflict(..) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            success: false,
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

/// Classify a database error. Constraint violations surface as client errors,
/// everything else becomes a masked 500.
pub fn db_error(e: sqlx::Error) -> ApiError {
    if let sqlx::Error::RowNotFound = e {
        return ApiError::not_found("record");
    }
    if let Some(db) = e.as_database_error() {
        match db.code().as_deref() {
            Some(PG_EXCLUSION_VIOLATION) => {
                return ApiError::Conflict(
                    "APPOINTMENT_CONFLICT",
                    "doctor already has an appointment in this time range".into(),
                );
            }
            Some(PG_UNIQUE_VIOLATION) => {
                let constraint = db.constraint().unwrap_or("unique constraint");
                return ApiError::Conflict("DUPLICATE", format!("duplicate value violates {constraint}"));
            }
            Some(PG_FOREIGN_KEY_VIOLATION) => {
                let constraint = db.constraint().unwrap_or("foreign key");
                return ApiError::BadRequest(
                    "INVALID_REFERENCE",
                    format!("referenced record does not exist ({constraint})"),
                );
            }
            _ => {}
        }
    }
    ApiError::Internal(format!("db error: {e}"))
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        db_error(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::Unauthorized(code, msg)
            | ApiError::Forbidden(code, msg)
            | ApiError::BadRequest(code, msg)
            | ApiError::NotFound(code, msg)
            | ApiError::Conflict(code, msg) => {
                (status, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed with internal error");
                (
                    status,
                    ApiError::to_error_response("INTERNAL", "Internal server error"),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::session_expired().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Forbidden("FORBIDDEN", "no".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ApiError::validation("bad").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::not_found("patient").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Conflict("APPOINTMENT_CONFLICT", "taken".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_row_not_found_is_404() {
        assert_eq!(db_error(sqlx::Error::RowNotFound).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_other_db_errors_are_internal() {
        let err = db_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, ApiError::Internal(_)));
    }

    #[tokio::test]
    async fn test_internal_message_is_masked() {
        use http_body_util::BodyExt;

        let resp = ApiError::Internal("db error: password authentication failed".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "INTERNAL");
        assert_eq!(json["error"]["message"], "Internal server error");
    }
}
