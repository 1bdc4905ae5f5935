use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Backend answered with a non-2xx status; surfaced to the client verbatim.
    #[error("upstream returned {status}: {body}")]
    Upstream { status: StatusCode, body: String },

    #[error("failed to connect to upstream: {0}")]
    Connect(String),

    #[error("could not parse upstream response: {0}")]
    InvalidUpstream(String),

    #[error("no credential available for the upstream call")]
    MissingCredential,

    #[error("rate limit exceeded, retry in {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("request rejected by operator")]
    Rejected,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::Connect(_) | GatewayError::InvalidUpstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::MissingCredential => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Rejected => StatusCode::FORBIDDEN,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Connect(_) | GatewayError::InvalidUpstream(_) => "bad_gateway",
            GatewayError::MissingCredential => "authentication_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::Rejected => "permission_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Upstream { status, body } = self {
            return (status, body).into_response();
        }

        let status = self.status_code();
        let message = match &self {
            GatewayError::Internal(_) => "an internal error occurred".to_string(),
            other => other.to_string(),
        };
        let body = Json(serde_json::json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "code": serde_json::Value::Null,
            }
        }));

        match self {
            GatewayError::RateLimited { retry_after } => {
                (status, [(header::RETRY_AFTER, retry_after.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_keeps_status() {
        let err = GatewayError::Upstream {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: "{\"error\":\"bad\"}".to_string(),
        };
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let resp = GatewayError::RateLimited { retry_after: 7 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "7");
    }

    #[test]
    fn missing_credential_is_unauthorized() {
        assert_eq!(
            GatewayError::MissingCredential.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
