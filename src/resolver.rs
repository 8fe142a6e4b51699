//! Fingerprint to user resolution for the SSH gateway.
//!
//! This module handles:
//! - Asking the credential service which user owns a key fingerprint
//! - Caching answers in memory, including "no such key", with separate TTLs
//! - Passing token introspection through to the credential service

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::LookupConfig;
use crate::fingerprint::is_fingerprint;

pub const SERVICE_ORIGIN_HEADER: &str = "X-Service-Origin";

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("resolver misconfigured: {0}")]
    Config(String),

    #[error("lookup backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("lookup timed out")]
    Timeout,

    #[error("malformed fingerprint")]
    MalformedFingerprint,
}

impl ResolverError {
    /// Transient failures; the caller may try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResolverError::BackendUnavailable(_) | ResolverError::Timeout
        )
    }
}

impl From<reqwest::Error> for ResolverError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ResolverError::Timeout
        } else {
            ResolverError::BackendUnavailable(err.to_string())
        }
    }
}

/// Maps a key fingerprint to the owning user id.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` means the key is not registered.
    async fn resolve(&self, fingerprint: &str) -> Result<Option<String>, ResolverError>;
}

/// Token introspection as reported by the credential service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenIntrospection {
    pub active: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    user_id: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    user_id: Option<String>,
    expires_at: Instant,
}

/// HTTP-backed resolver with positive and negative caching.
///
/// Failed lookups are never cached. Entries expire lazily on read.
pub struct AuthCache {
    client: reqwest::Client,
    base_url: Url,
    lookup_ttl: Duration,
    negative_ttl: Duration,
    service_origin: Option<String>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl AuthCache {
    pub fn new(config: &LookupConfig) -> Result<Self, ResolverError> {
        let base = config
            .base_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ResolverError::Config("lookup base URL is not set".to_string()))?;
        let base_url = Url::parse(base.trim())
            .map_err(|e| ResolverError::Config(format!("invalid lookup base URL '{}': {}", base, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ResolverError::Config(format!(
                "lookup base URL '{}' cannot be a base",
                base
            )));
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("git-bridge-gateway/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ResolverError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            lookup_ttl: config.lookup_ttl(),
            negative_ttl: config.negative_ttl(),
            service_origin: config.service_origin.clone(),
            entries: RwLock::new(HashMap::new()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ResolverError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ResolverError::Config("lookup base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn with_origin(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_origin {
            Some(origin) => request.header(SERVICE_ORIGIN_HEADER, origin),
            None => request,
        }
    }

    async fn cached(&self, fingerprint: &str) -> Option<Option<String>> {
        let entries = self.entries.read().await;
        entries
            .get(fingerprint)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.user_id.clone())
    }

    async fn store(&self, fingerprint: &str, user_id: Option<String>) {
        let ttl = if user_id.is_some() {
            self.lookup_ttl
        } else {
            self.negative_ttl
        };
        self.entries.write().await.insert(
            fingerprint.to_string(),
            CacheEntry {
                user_id,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn fetch(&self, fingerprint: &str) -> Result<Option<String>, ResolverError> {
        let url = self.endpoint(&["internal", "api", "ssh-keys", fingerprint])?;
        debug!("Looking up fingerprint at {}", url);

        let response = self.with_origin(self.client.get(url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: LookupResponse = response.json().await.map_err(|e| {
                    ResolverError::BackendUnavailable(format!("invalid lookup response: {}", e))
                })?;
                if body.user_id.is_empty() {
                    return Err(ResolverError::BackendUnavailable(
                        "lookup response has empty userId".to_string(),
                    ));
                }
                Ok(Some(body.user_id))
            }
            status => Err(ResolverError::BackendUnavailable(format!(
                "lookup returned {}",
                status
            ))),
        }
    }

    /// Ask the credential service whether a token is active. Not cached.
    #[allow(dead_code)] // For HTTPS-facing callers; the SSH path only resolves keys.
    pub async fn introspect_token(&self, token: &str) -> Result<TokenIntrospection, ResolverError> {
        if token.is_empty() {
            return Ok(TokenIntrospection::default());
        }

        let url = self.endpoint(&["internal", "api", "tokens", "introspect"])?;
        let response = self
            .with_origin(self.client.post(url))
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolverError::BackendUnavailable(format!(
                "introspection returned {}",
                status
            )));
        }

        response.json().await.map_err(|e| {
            ResolverError::BackendUnavailable(format!("invalid introspection response: {}", e))
        })
    }
}

#[async_trait]
impl IdentityResolver for AuthCache {
    async fn resolve(&self, fingerprint: &str) -> Result<Option<String>, ResolverError> {
        if !is_fingerprint(fingerprint) {
            return Err(ResolverError::MalformedFingerprint);
        }

        if let Some(hit) = self.cached(fingerprint).await {
            debug!(fingerprint, found = hit.is_some(), "Lookup cache hit");
            return Ok(hit);
        }

        match self.fetch(fingerprint).await {
            Ok(user_id) => {
                self.store(fingerprint, user_id.clone()).await;
                Ok(user_id)
            }
            Err(e) => {
                warn!(fingerprint, "Fingerprint lookup failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::TEST_KEY_FINGERPRINT;
    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Backend {
        calls: Arc<AtomicUsize>,
        status: Arc<Mutex<Option<StatusCode>>>,
        seen: Arc<Mutex<Vec<(String, Option<String>)>>>,
        delay: Option<Duration>,
    }

    async fn lookup(
        State(backend): State<Backend>,
        Path(fingerprint): Path<String>,
        headers: HeaderMap,
    ) -> axum::response::Response {
        backend.calls.fetch_add(1, Ordering::SeqCst);
        let origin = headers
            .get(SERVICE_ORIGIN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        backend.seen.lock().unwrap().push((fingerprint.clone(), origin));

        if let Some(delay) = backend.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = *backend.status.lock().unwrap() {
            return status.into_response();
        }
        if fingerprint == TEST_KEY_FINGERPRINT {
            Json(serde_json::json!({ "userId": "user-1" })).into_response()
        } else {
            StatusCode::NOT_FOUND.into_response()
        }
    }

    async fn introspect(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
        if body["token"] == "good" {
            Json(serde_json::json!({ "active": true, "userId": "user-1", "scopes": ["repo:read"] }))
        } else {
            Json(serde_json::json!({ "active": false }))
        }
    }

    async fn spawn_backend(backend: Backend) -> String {
        let app = Router::new()
            .route("/internal/api/ssh-keys/{fingerprint}", get(lookup))
            .route("/internal/api/tokens/introspect", post(introspect))
            .with_state(backend);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(base_url: &str) -> LookupConfig {
        LookupConfig {
            base_url: Some(base_url.to_string()),
            lookup_ttl_secs: 60,
            negative_ttl_secs: 60,
            request_timeout_secs: 2,
            service_origin: Some("git-bridge".to_string()),
        }
    }

    #[tokio::test]
    async fn test_positive_lookup_is_cached() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let cache = AuthCache::new(&config(&base)).unwrap();

        assert_eq!(
            cache.resolve(TEST_KEY_FINGERPRINT).await.unwrap().as_deref(),
            Some("user-1")
        );
        assert_eq!(
            cache.resolve(TEST_KEY_FINGERPRINT).await.unwrap().as_deref(),
            Some("user-1")
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_lookup_is_cached() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let cache = AuthCache::new(&config(&base)).unwrap();

        assert_eq!(cache.resolve("SHA256:unknown").await.unwrap(), None);
        assert_eq!(cache.resolve("SHA256:unknown").await.unwrap(), None);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let mut config = config(&base);
        config.lookup_ttl_secs = 1;
        config.negative_ttl_secs = 1;
        let cache = AuthCache::new(&config).unwrap();

        cache.resolve(TEST_KEY_FINGERPRINT).await.unwrap();
        cache.resolve("SHA256:unknown").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        cache.resolve(TEST_KEY_FINGERPRINT).await.unwrap();
        cache.resolve("SHA256:unknown").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
        // Refreshed entries replace the stale ones in place.
        assert_eq!(cache.entries.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_server_errors_are_not_cached() {
        let backend = Backend::default();
        *backend.status.lock().unwrap() = Some(StatusCode::INTERNAL_SERVER_ERROR);
        let base = spawn_backend(backend.clone()).await;
        let cache = AuthCache::new(&config(&base)).unwrap();

        let err = cache.resolve(TEST_KEY_FINGERPRINT).await.unwrap_err();
        assert!(matches!(err, ResolverError::BackendUnavailable(_)));
        assert!(err.is_retryable());

        *backend.status.lock().unwrap() = None;
        assert_eq!(
            cache.resolve(TEST_KEY_FINGERPRINT).await.unwrap().as_deref(),
            Some("user-1")
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let backend = Backend {
            delay: Some(Duration::from_secs(3)),
            ..Backend::default()
        };
        let base = spawn_backend(backend.clone()).await;
        let mut config = config(&base);
        config.request_timeout_secs = 1;
        let cache = AuthCache::new(&config).unwrap();

        let err = cache.resolve(TEST_KEY_FINGERPRINT).await.unwrap_err();
        assert!(matches!(err, ResolverError::Timeout));
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cache = AuthCache::new(&config(&format!("http://{}", addr))).unwrap();
        let err = cache.resolve(TEST_KEY_FINGERPRINT).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fingerprint_is_path_encoded_and_origin_sent() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let cache = AuthCache::new(&config(&format!("{}/", base))).unwrap();

        cache.resolve(TEST_KEY_FINGERPRINT).await.unwrap();

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, TEST_KEY_FINGERPRINT);
        assert_eq!(seen[0].1.as_deref(), Some("git-bridge"));
    }

    #[tokio::test]
    async fn test_malformed_fingerprint_skips_backend() {
        let backend = Backend::default();
        let base = spawn_backend(backend.clone()).await;
        let cache = AuthCache::new(&config(&base)).unwrap();

        let err = cache.resolve("not-a-fingerprint").await.unwrap_err();
        assert!(matches!(err, ResolverError::MalformedFingerprint));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_base_url_is_config_error() {
        let config = LookupConfig {
            base_url: None,
            ..LookupConfig::default()
        };
        assert!(matches!(AuthCache::new(&config), Err(ResolverError::Config(_))));

        let config = LookupConfig {
            base_url: Some("not a url".to_string()),
            ..LookupConfig::default()
        };
        assert!(matches!(AuthCache::new(&config), Err(ResolverError::Config(_))));
    }

    #[tokio::test]
    async fn test_introspection_pass_through() {
        let base = spawn_backend(Backend::default()).await;
        let cache = AuthCache::new(&config(&base)).unwrap();

        let active = cache.introspect_token("good").await.unwrap();
        assert!(active.active);
        assert_eq!(active.user_id.as_deref(), Some("user-1"));
        assert_eq!(active.scopes, Some(vec!["repo:read".to_string()]));

        assert!(!cache.introspect_token("bad").await.unwrap().active);
        assert_eq!(
            cache.introspect_token("").await.unwrap(),
            TokenIntrospection::default()
        );
    }
}
