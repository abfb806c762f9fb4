//! Request-terminal errors and their HTTP mapping.
//!
//! Item-level parse problems are not errors here: they are collected as
//! [`crate::process::ItemFailure`] records and the batch keeps going.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// The reason is logged by the verifier and never returned to the caller.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("verification failed")]
    VerificationFailed,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("publish failed: {0}")]
    PublishFailed(String),
}

impl GatewayError {
    pub fn malformed(err: impl std::fmt::Display) -> Self {
        Self::MalformedEnvelope(err.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::VerificationFailed => StatusCode::FORBIDDEN,
            Self::MalformedEnvelope(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PublishFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body text sent back to the provider. Deliberately coarse.
    fn public_message(&self) -> &'static str {
        match self {
            Self::ChannelNotFound(_) => "channel not found",
            Self::AuthenticationFailed(_) => "unauthorized",
            Self::VerificationFailed => "verification failed",
            Self::MalformedEnvelope(_) => "invalid payload",
            Self::PayloadTooLarge => "payload too large",
            Self::MethodNotAllowed => "method not allowed",
            Self::PublishFailed(_) => "failed to publish events",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(serde_json::json!({ "error": self.public_message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::ChannelNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::AuthenticationFailed("bad".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::VerificationFailed.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::malformed("eof").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::PublishFailed("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_auth_reason_not_exposed() {
        let err = GatewayError::AuthenticationFailed("signature mismatch".into());
        assert_eq!(err.public_message(), "unauthorized");
    }
}
