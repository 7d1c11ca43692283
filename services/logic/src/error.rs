use crate::service::LogicError;
use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use courier_common::ErrorResponse;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<LogicError> for ApiError {
    fn from(err: LogicError) -> Self {
        match err {
            LogicError::InvalidToken(err) => {
                api_unauthorized(&format!("invalid auth token: {err}"))
            }
            LogicError::Store(err) => err.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid(message) => api_validation_error(&message),
            StoreError::Unexpected(err) => {
                tracing::error!(error = %err, "session store failure");
                api_internal("session store failure")
            }
        }
    }
}

fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    ApiError {
        status,
        body: ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
        },
    }
}

pub fn api_validation_error(message: &str) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn api_unauthorized(message: &str) -> ApiError {
    api_error(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

pub fn api_internal(message: &str) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_status_codes() {
        let invalid: ApiError = StoreError::Invalid("key required".to_string()).into();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid.body.message, "key required");

        let unexpected: ApiError = StoreError::Unexpected(anyhow::anyhow!("disk gone")).into();
        assert_eq!(unexpected.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(unexpected.body.code, "internal");
        assert!(!unexpected.body.message.contains("disk gone"));
    }

    #[test]
    fn bad_token_is_unauthorized() {
        let parse = serde_json::from_str::<serde_json::Value>("{").expect_err("parse");
        let err: ApiError = LogicError::InvalidToken(parse).into();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.body.code, "unauthorized");
    }
}
