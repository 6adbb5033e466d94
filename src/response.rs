//! HTTP response building helpers
//!
//! Provides a consistent API for building HTTP responses across all handlers.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, Response, StatusCode};
use serde::Serialize;
use tracing::{error, warn};

use crate::error::RegistryError;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Build a JSON response with 200 OK status
pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

/// Build a JSON response with 201 Created status
pub fn created<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, body)
}

/// Build a 404 Not Found response with message
pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({ "error": message, "kind": "not_found" }),
    )
}

/// Build a 405 Method Not Allowed response
pub fn method_not_allowed() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &serde_json::json!({ "error": "Method not allowed", "kind": "method_not_allowed" }),
    )
}

/// HTTP status for a registry failure
pub fn status_for(error: &RegistryError) -> StatusCode {
    match error {
        RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
        RegistryError::Unauthorized(_) | RegistryError::NotOwner { .. } => StatusCode::FORBIDDEN,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::LedgerUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a RegistryError to an appropriate HTTP response
pub fn error_response(error: RegistryError) -> Response<Full<Bytes>> {
    let status = status_for(&error);
    if status.is_server_error() {
        error!(kind = error.kind(), error = %error, "Request failed");
    } else {
        warn!(kind = error.kind(), error = %error, "Request rejected");
    }

    let mut body = serde_json::json!({
        "error": error.to_string(),
        "kind": error.kind(),
    });
    if error.is_retryable() {
        body["retryable"] = serde_json::Value::Bool(true);
    }
    json_response(status, &body)
}

/// Wrap a service result into an HTTP response
pub fn from_result<T: Serialize>(result: Result<T, RegistryError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap a create result into an HTTP response with 201 Created
pub fn from_create_result<T: Serialize>(result: Result<T, RegistryError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => created(&value),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_ok_response() {
        let resp = ok(&serde_json::json!({"test": true}));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&RegistryError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&RegistryError::Unauthorized("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&RegistryError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&RegistryError::LedgerRejected {
                operation: "addHash",
                fingerprint: None,
                reason: "revert".into(),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_unavailable_is_marked_retryable() {
        let resp = error_response(RegistryError::LedgerUnavailable {
            operation: "verify",
            fingerprint: None,
            reason: "timed out".into(),
        });
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["kind"], "ledger_unavailable");
        assert_eq!(body["retryable"], true);
    }

    #[tokio::test]
    async fn test_not_found_body() {
        let body = body_json(error_response(RegistryError::NotFound("product".into()))).await;
        assert_eq!(body["kind"], "not_found");
        assert!(body.get("retryable").is_none());
    }
}
