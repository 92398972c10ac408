//! Error taxonomy for the TSS server and key-share node
//!
//! Every public operation returns `Result<T, TssError>`. Handlers turn the
//! error into the `{success: false, code, msg}` envelope with a fixed
//! code -> HTTP status table.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::storage::StorageError;
use crate::types::ApiResponse;

/// Root error type
#[derive(Debug, Error)]
pub enum TssError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid tss session: {0}")]
    InvalidTssSession(String),

    #[error("invalid tss stage: {0}")]
    InvalidTssStage(String),

    #[error("triples result mismatch: {0}")]
    InvalidTssTriplesResult(String),

    #[error("insufficient key share nodes: need {required}, have {available}")]
    KeyshareNodeInsufficient { required: usize, available: usize },

    #[error("wallet already exists for {0}")]
    WalletAlreadyExists(String),

    #[error("public key already registered: {0}")]
    DuplicatePublicKey(String),

    #[error("user not found")]
    UserNotFound,

    #[error("wallet not found")]
    WalletNotFound,

    #[error("key share not found")]
    KeyShareNotFound,

    #[error("invalid public key: {0}")]
    PublicKeyInvalid(String),

    #[error("invalid share: {0}")]
    ShareInvalid(String),

    #[error("reshare failed: {0}")]
    ReshareFailed(String),

    #[error("commit-reveal session not found")]
    SessionNotFound,

    #[error("commit-reveal session expired")]
    SessionExpired,

    #[error("api already called: {0}")]
    ApiAlreadyCalled(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid commit-reveal session state: {0}")]
    InvalidSessionState(String),

    #[error("api {api} not allowed for {operation}")]
    ApiNotAllowed { api: String, operation: String },

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl TssError {
    /// Wire code for the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            TssError::Unauthorized(_) => "UNAUTHORIZED",
            TssError::InvalidTssSession(_) => "INVALID_TSS_SESSION",
            TssError::InvalidTssStage(_) => "INVALID_TSS_STAGE",
            TssError::InvalidTssTriplesResult(_) => "INVALID_TSS_TRIPLES_RESULT",
            TssError::KeyshareNodeInsufficient { .. } => "KEYSHARE_NODE_INSUFFICIENT",
            TssError::WalletAlreadyExists(_) => "WALLET_ALREADY_EXISTS",
            TssError::DuplicatePublicKey(_) => "DUPLICATE_PUBLIC_KEY",
            TssError::UserNotFound => "USER_NOT_FOUND",
            TssError::WalletNotFound => "WALLET_NOT_FOUND",
            TssError::KeyShareNotFound => "KEY_SHARE_NOT_FOUND",
            TssError::PublicKeyInvalid(_) => "PUBLIC_KEY_INVALID",
            TssError::ShareInvalid(_) => "SHARE_INVALID",
            TssError::ReshareFailed(_) => "RESHARE_FAILED",
            TssError::SessionNotFound => "SESSION_NOT_FOUND",
            TssError::SessionExpired => "SESSION_EXPIRED",
            TssError::ApiAlreadyCalled(_) => "API_ALREADY_CALLED",
            TssError::InvalidSignature => "INVALID_SIGNATURE",
            TssError::InvalidRequest(_) => "INVALID_REQUEST",
            TssError::InvalidSessionState(_) => "INVALID_SESSION_STATE",
            TssError::ApiNotAllowed { .. } => "API_NOT_ALLOWED",
            TssError::SignatureVerificationFailed => "SIGNATURE_VERIFICATION_FAILED",
            TssError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    /// HTTP status for the error envelope
    pub fn status(&self) -> StatusCode {
        match self {
            TssError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            TssError::InvalidTssSession(_)
            | TssError::InvalidTssStage(_)
            | TssError::InvalidTssTriplesResult(_)
            | TssError::PublicKeyInvalid(_)
            | TssError::ShareInvalid(_)
            | TssError::ReshareFailed(_)
            | TssError::InvalidSignature
            | TssError::InvalidRequest(_)
            | TssError::InvalidSessionState(_)
            | TssError::SignatureVerificationFailed => StatusCode::BAD_REQUEST,
            TssError::KeyshareNodeInsufficient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TssError::WalletAlreadyExists(_)
            | TssError::DuplicatePublicKey(_)
            | TssError::ApiAlreadyCalled(_) => StatusCode::CONFLICT,
            TssError::UserNotFound
            | TssError::WalletNotFound
            | TssError::KeyShareNotFound
            | TssError::SessionNotFound => StatusCode::NOT_FOUND,
            TssError::SessionExpired => StatusCode::GONE,
            TssError::ApiNotAllowed { .. } => StatusCode::FORBIDDEN,
            TssError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message returned to the caller. Unknown errors never leak details.
    pub fn public_message(&self) -> String {
        match self {
            TssError::Unknown(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }
}

impl From<StorageError> for TssError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => TssError::Unknown(format!("record not found: {}", what)),
            StorageError::AlreadyCalled(api) => TssError::ApiAlreadyCalled(api),
            other => TssError::Unknown(other.to_string()),
        }
    }
}

impl From<CryptoError> for TssError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidPoint(msg) => TssError::PublicKeyInvalid(msg),
            CryptoError::InvalidScalar(msg) | CryptoError::InconsistentShares(msg) => TssError::ShareInvalid(msg),
            CryptoError::Threshold(msg) => TssError::InvalidRequest(msg),
            CryptoError::InvalidMessage(msg) => TssError::InvalidRequest(msg),
            CryptoError::CommitmentMismatch(msg) => TssError::InvalidTssTriplesResult(msg),
            CryptoError::Verification => TssError::SignatureVerificationFailed,
            other => TssError::Unknown(other.to_string()),
        }
    }
}

impl IntoResponse for TssError {
    fn into_response(self) -> Response {
        if let TssError::Unknown(detail) = &self {
            tracing::error!(target: "tss::error", detail = %detail, "unhandled error");
        }
        let status = self.status();
        let body: ApiResponse<()> = ApiResponse::err(self.code(), self.public_message());
        (status, Json(body)).into_response()
    }
}

/// JSON body extractor whose rejections use the error envelope
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = TssError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| TssError::InvalidRequest(rejection.body_text()))?;
        Ok(ApiJson(value))
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, TssError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let err = TssError::ApiAlreadyCalled("get_key_shares".into());
        assert_eq!(err.code(), "API_ALREADY_CALLED");
        assert_eq!(err.status(), StatusCode::CONFLICT);

        assert_eq!(TssError::InvalidSignature.status(), StatusCode::BAD_REQUEST);
        assert_eq!(TssError::SessionExpired.status(), StatusCode::GONE);
        assert_eq!(
            TssError::KeyshareNodeInsufficient { required: 2, available: 1 }.code(),
            "KEYSHARE_NODE_INSUFFICIENT"
        );
    }

    #[test]
    fn test_unknown_error_hides_details() {
        let err = TssError::unknown("sqlite: disk I/O error");
        assert_eq!(err.code(), "UNKNOWN_ERROR");
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn test_crypto_error_mapping() {
        let err: TssError = CryptoError::CommitmentMismatch("big_c".into()).into();
        assert_eq!(err.code(), "INVALID_TSS_TRIPLES_RESULT");

        let err: TssError = CryptoError::Verification.into();
        assert_eq!(err.code(), "SIGNATURE_VERIFICATION_FAILED");
    }
}
