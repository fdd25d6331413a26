//! Request-boundary error taxonomy.
//!
//! Every failure a handler can hit maps to a stable HTTP status with a
//! generic body. Detail (which check failed, which nonce collided, which
//! device was unknown) stays in server logs; the caller sees only the
//! coarse class.

use crate::cipher::CipherError;
use crate::persistence::redb_store::StoreError;
use crate::replay::ReplayError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("device {0} is revoked")]
    DeviceRevoked(String),
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("device client does not match resource client")]
    TenantMismatch,
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("unknown approval {0}")]
    UnknownApproval(String),
    #[error("decision already recorded for signal {0}")]
    DecisionAlreadySet(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl ResponseError for ProtocolError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthenticationFailed | Self::DeviceRevoked(_) | Self::UnknownDevice(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::TenantMismatch => StatusCode::FORBIDDEN,
            Self::Replay(ReplayError::MalformedTimestamp(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Replay(ReplayError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Replay(_) => StatusCode::CONFLICT,
            Self::UnknownApproval(_) | Self::MalformedRequest(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::DecisionAlreadySet(_) => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            // A device presenting a tampered or wrong-key envelope is an
            // authentication-class failure; everything else in the cipher is
            // a server-side fault
            Self::Cipher(CipherError::DecryptionFailed) => StatusCode::UNAUTHORIZED,
            Self::Cipher(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!(detail = %self, "💥 Request failed");
        } else {
            warn!(detail = %self, status = status.as_u16(), "Request rejected");
        }
        let message = match status {
            StatusCode::UNAUTHORIZED => "authentication failed",
            StatusCode::FORBIDDEN => "forbidden",
            StatusCode::CONFLICT => "conflict",
            StatusCode::UNPROCESSABLE_ENTITY => "unprocessable request",
            StatusCode::NOT_FOUND => "not found",
            _ => "internal error",
        };
        HttpResponse::build(status).json(serde_json::json!({ "error": message }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProtocolError::AuthenticationFailed.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProtocolError::DeviceRevoked("d".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProtocolError::UnknownDevice("d".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProtocolError::TenantMismatch.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProtocolError::Replay(ReplayError::ReplayedNonce).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProtocolError::Replay(ReplayError::StaleTimestamp(301, 300)).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProtocolError::Replay(ReplayError::MalformedTimestamp("x".into())).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ProtocolError::UnknownApproval("a".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ProtocolError::DecisionAlreadySet("s".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProtocolError::Cipher(CipherError::DecryptionFailed).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[actix_web::test]
    async fn test_response_body_stays_generic() {
        let response = ProtocolError::UnknownDevice("dev-secret-name".into()).error_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // The detailed Display form never reaches the body
        let body = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("dev-secret-name"));
        assert_eq!(text, r#"{"error":"authentication failed"}"#);
    }
}
