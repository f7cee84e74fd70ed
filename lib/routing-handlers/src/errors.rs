//! Domain error to HTTP outcome mapping

use crate::metrics::ApiMetrics;
use hyper::StatusCode;
use routing_api::{ApiError, RoutingError};
use tracing::{debug, warn};

/// What a handler writes back for a failed request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub body: ApiError,
}

impl ErrorResponse {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.body)
    }
}

/// Maps every `RoutingError` to a non-success response
///
/// Unauthorized requests are counted in `token_errors_total`.
#[derive(Clone)]
pub struct ErrorTranslator {
    metrics: ApiMetrics,
}

impl ErrorTranslator {
    pub fn new(metrics: ApiMetrics) -> Self {
        Self { metrics }
    }

    pub fn translate(&self, err: &RoutingError) -> ErrorResponse {
        let status = match err {
            RoutingError::ProcessRequest(_) => StatusCode::BAD_REQUEST,
            RoutingError::NotFound(_) => StatusCode::NOT_FOUND,
            RoutingError::Conflict(_) => StatusCode::CONFLICT,
            RoutingError::Communication(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RoutingError::Unauthorized(_) => {
                self.metrics.record_token_error();
                StatusCode::UNAUTHORIZED
            }
            RoutingError::LockTimeout(_) | RoutingError::Internal(_) => {
                warn!("Unmapped error reached the API: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        debug!("{} -> {}", err.kind(), status);
        ErrorResponse {
            status,
            body: ApiError::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routing_api::ErrorKind;
    use std::time::Duration;

    fn translator() -> (ErrorTranslator, ApiMetrics) {
        let metrics = ApiMetrics::new().unwrap();
        (ErrorTranslator::new(metrics.clone()), metrics)
    }

    #[test]
    fn test_fixed_mapping() {
        let (translator, _) = translator();
        let cases = [
            (RoutingError::ProcessRequest("bad ttl".into()), StatusCode::BAD_REQUEST),
            (RoutingError::NotFound("a|1.2.3.4:80".into()), StatusCode::NOT_FOUND),
            (RoutingError::Conflict("a|1.2.3.4:80".into()), StatusCode::CONFLICT),
            (RoutingError::Communication("timeout".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (RoutingError::Unauthorized("expired token".into()), StatusCode::UNAUTHORIZED),
            (RoutingError::LockTimeout(Duration::from_secs(1)), StatusCode::INTERNAL_SERVER_ERROR),
            (RoutingError::Internal("corrupt".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            let response = translator.translate(&err);
            assert_eq!(response.status, status, "{:?}", err);
            assert!(!response.status.is_success());
            assert_eq!(response.body.name, err.kind());
        }
    }

    #[test]
    fn test_unauthorized_counts_once_per_error() {
        let (translator, metrics) = translator();
        translator.translate(&RoutingError::Unauthorized("no token".into()));
        translator.translate(&RoutingError::Conflict("x".into()));
        assert_eq!(metrics.token_errors_total.get(), 1);

        translator.translate(&RoutingError::Unauthorized("bad token".into()));
        assert_eq!(metrics.token_errors_total.get(), 2);
    }

    #[test]
    fn test_json_body() {
        let (translator, _) = translator();
        let response = translator.translate(&RoutingError::NotFound("web.example.com|10.0.0.1:8080".into()));
        let body: serde_json::Value = serde_json::from_str(&response.to_json().unwrap()).unwrap();
        assert_eq!(body["name"], "ResourceNotFoundError");
        assert_eq!(body["message"], "Route not found: web.example.com|10.0.0.1:8080");
        assert_eq!(response.body.name, ErrorKind::ResourceNotFound);
    }
}
