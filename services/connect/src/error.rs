//! Error responses for the push API.
//!
//! Every rejected push request carries a stable `code` and a readable
//! `message`; internal details stay in the server log.
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

fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    ApiError {
        status,
        body: ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
        },
    }
}

/// 400 with code `validation_error`.
pub fn api_validation_error(message: &str) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

/// 503 with code `overloaded`; the request may be retried later.
pub fn api_overloaded(message: &str) -> ApiError {
    api_error(StatusCode::SERVICE_UNAVAILABLE, "overloaded", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn error_renders_status_and_json_body() {
        let response = api_validation_error("keys must not be empty").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: ErrorResponse = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body.code, "validation_error");
        assert_eq!(body.message, "keys must not be empty");
    }

    #[test]
    fn overloaded_maps_to_service_unavailable() {
        let err = api_overloaded("room workers busy");
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.body.code, "overloaded");
    }
}
