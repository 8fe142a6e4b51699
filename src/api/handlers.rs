use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::ApiState;
use crate::credentials::{NewToken, TokenInfo};
use crate::error::{CredentialError, Result};
use crate::store::{SshKeyRecord, TokenRecord};

/// Token record as listed to its owner; the hash is never exposed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenView {
    pub id: String,
    pub label: String,
    pub hash_prefix: String,
    pub algorithm: String,
    pub scopes: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<TokenRecord> for TokenView {
    fn from(record: TokenRecord) -> Self {
        Self {
            id: record.id,
            label: record.label,
            hash_prefix: record.hash_prefix,
            algorithm: record.algorithm.to_string(),
            scopes: record.scopes,
            active: record.active,
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

/// SSH key wire shape; mixes snake_case fields with `userId`.
#[derive(Debug, Serialize)]
pub struct SshKeyView {
    pub id: String,
    pub fingerprint: String,
    pub key_name: String,
    pub label: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "userId")]
    pub user_id: String,
}

impl From<SshKeyRecord> for SshKeyView {
    fn from(record: SshKeyRecord) -> Self {
        Self {
            id: record.id,
            fingerprint: record.fingerprint,
            key_name: record.key_name,
            label: record.label,
            public_key: record.public_key,
            created_at: record.created_at,
            updated_at: record.updated_at,
            user_id: record.user_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IntrospectRequest {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTokenRequest {
    pub label: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub replace: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTokenResponse {
    pub id: String,
    pub token: String,
    pub access_token_partial: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterKeyRequest {
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub key_name: String,
}

/// Unwrap a JSON body. A body that doesn't parse is a 400 with a message.
fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| CredentialError::InvalidRequest(rejection.body_text()))
}

/// Health check
pub async fn health() -> Response {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION")
    }))
    .into_response()
}

/// GET /internal/api/ssh-keys/{fingerprint}
pub async fn lookup_ssh_key(
    State(state): State<Arc<ApiState>>,
    Path(fingerprint): Path<String>,
) -> Result<Response> {
    Ok(match state.service.lookup_fingerprint(&fingerprint).await? {
        Some(user_id) => Json(json!({ "userId": user_id })).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({}))).into_response(),
    })
}

/// POST /internal/api/tokens/introspect
pub async fn introspect_token(
    State(state): State<Arc<ApiState>>,
    body: std::result::Result<Json<IntrospectRequest>, JsonRejection>,
) -> Result<Json<TokenInfo>> {
    let request = json_body(body)?;
    Ok(Json(state.service.introspect(&request.token).await?))
}

/// POST /internal/api/users/{user_id}/git-tokens
pub async fn create_token(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
    body: std::result::Result<Option<Json<CreateTokenRequest>>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateTokenResponse>)> {
    // The body is optional; without a JSON content type the defaults apply.
    let request = match body.transpose() {
        Some(body) => json_body(body)?,
        None => CreateTokenRequest::default(),
    };
    let issued = state
        .service
        .create_token(
            &user_id,
            NewToken {
                label: request.label,
                scopes: request.scopes,
                expires_at: request.expires_at,
                replace: request.replace,
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            id: issued.record.id,
            token: issued.token,
            access_token_partial: issued.record.hash_prefix,
        }),
    ))
}

/// GET /internal/api/users/{user_id}/git-tokens
pub async fn list_tokens(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<TokenView>>> {
    let tokens = state.service.list_tokens(&user_id).await?;
    Ok(Json(tokens.into_iter().map(TokenView::from).collect()))
}

/// DELETE /internal/api/users/{user_id}/git-tokens/{token_id}
pub async fn revoke_token(
    State(state): State<Arc<ApiState>>,
    Path((user_id, token_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.service.revoke_token(&user_id, &token_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /internal/api/users/{user_id}/ssh-keys
pub async fn register_ssh_key(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
    body: std::result::Result<Json<RegisterKeyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SshKeyView>)> {
    let request = json_body(body)?;
    let registered = state
        .service
        .register_ssh_key(&user_id, &request.public_key, &request.key_name)
        .await?;

    let status = if registered.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(registered.record.into())))
}

/// GET /internal/api/users/{user_id}/ssh-keys
pub async fn list_ssh_keys(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<SshKeyView>>> {
    let keys = state.service.list_ssh_keys(&user_id).await?;
    Ok(Json(keys.into_iter().map(SshKeyView::from).collect()))
}

/// DELETE /internal/api/users/{user_id}/ssh-keys/{key_id}
pub async fn remove_ssh_key(
    State(state): State<Arc<ApiState>>,
    Path((user_id, key_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.service.remove_ssh_key(&user_id, &key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
