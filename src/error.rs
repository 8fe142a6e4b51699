use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

use crate::fingerprint::KeyError;
use crate::hashing::HashError;

/// Failures of the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by credential operations.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("invalid token format")]
    InvalidToken,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(#[from] KeyError),

    #[error("invalid fingerprint")]
    InvalidFingerprint,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found")]
    NotFound,

    #[error("public key is registered to another user")]
    KeyInUse,

    #[error("token hashing failed: {0}")]
    Hashing(#[from] HashError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CredentialError {
    /// Client input problems: never retried, never logged as failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CredentialError::InvalidToken
                | CredentialError::InvalidPublicKey(_)
                | CredentialError::InvalidFingerprint
                | CredentialError::InvalidRequest(_)
                | CredentialError::NotFound
                | CredentialError::KeyInUse
        )
    }
}

impl IntoResponse for CredentialError {
    fn into_response(self) -> Response {
        let status = match &self {
            CredentialError::InvalidToken
            | CredentialError::InvalidPublicKey(_)
            | CredentialError::InvalidFingerprint
            | CredentialError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CredentialError::NotFound => StatusCode::NOT_FOUND,
            CredentialError::KeyInUse => StatusCode::CONFLICT,
            CredentialError::Hashing(_) | CredentialError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = if self.is_client_error() {
            debug!("Rejected credential request: {}", self);
            self.to_string()
        } else {
            error!("Credential operation failed: {}", self);
            "internal error".to_string()
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, CredentialError>;
