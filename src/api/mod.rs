//! HTTP surface of the credential service.

pub mod handlers;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::credentials::CredentialService;
use crate::resolver::SERVICE_ORIGIN_HEADER;

/// Application state shared across handlers
pub struct ApiState {
    pub service: Arc<CredentialService>,
    /// Basic credentials required from callers that are not internal services.
    pub admin: Option<(String, String)>,
}

impl ApiState {
    pub fn new(service: Arc<CredentialService>, admin: Option<(String, String)>) -> Self {
        Self { service, admin }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some((user, password)) = &self.admin else {
            return true;
        };

        let from_service = headers
            .get(SERVICE_ORIGIN_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| !v.trim().is_empty());
        if from_service {
            return true;
        }

        match basic_credentials(headers) {
            Some((given_user, given_password)) => {
                let user_ok = given_user.as_bytes().ct_eq(user.as_bytes());
                let password_ok = given_password.as_bytes().ct_eq(password.as_bytes());
                bool::from(user_ok & password_ok)
            }
            None => false,
        }
    }
}

/// Decode `Authorization: Basic <base64(user:password)>`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

async fn require_auth(State(state): State<Arc<ApiState>>, request: Request, next: Next) -> Response {
    if state.authorized(request.headers()) {
        return next.run(request).await;
    }

    debug!("Rejected unauthenticated request to {}", request.uri().path());
    let mut response = (StatusCode::UNAUTHORIZED, Body::from("Authentication required")).into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Basic realm=\"git-bridge\""),
    );
    response
}

/// Build the router. `/health` stays outside the auth layer.
pub fn router(state: Arc<ApiState>) -> Router {
    let internal = Router::new()
        .route("/ssh-keys/{fingerprint}", get(handlers::lookup_ssh_key))
        .route("/tokens/introspect", post(handlers::introspect_token))
        .route(
            "/users/{user_id}/git-tokens",
            post(handlers::create_token).get(handlers::list_tokens),
        )
        .route(
            "/users/{user_id}/git-tokens/{token_id}",
            delete(handlers::revoke_token),
        )
        .route(
            "/users/{user_id}/ssh-keys",
            post(handlers::register_ssh_key).get(handlers::list_ssh_keys),
        )
        .route(
            "/users/{user_id}/ssh-keys/{key_id}",
            delete(handlers::remove_ssh_key),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .nest("/internal/api", internal)
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!("Credential API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Credential API server failed")
}

/// Bind the API listener. Done before anything else starts so a bad or busy
/// address fails startup.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind credential API on {}", addr))
}
