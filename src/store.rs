//! Persistent credential records.
//!
//! Stores:
//! - Personal access token records, indexed by id and by hash prefix
//! - SSH key records, keyed by fingerprint
//!
//! [`JsonStore`] keeps everything in memory behind a single lock and, when
//! given a path, writes the whole document back to disk after every mutation
//! before releasing the lock. Reads therefore always observe completed writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreResult;
use crate::hashing::HashAlgorithm;

/// A stored personal access token. The plaintext is never part of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub label: String,
    pub hash: String,
    pub hash_prefix: String,
    pub algorithm: HashAlgorithm,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// A registered SSH public key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SshKeyRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub key_name: String,
    #[serde(default)]
    pub label: String,
    pub public_key: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`CredentialBackend::upsert_ssh_key`].
#[derive(Debug, Clone)]
pub struct NewSshKey {
    pub user_id: String,
    pub key_name: String,
    pub public_key: String,
    pub fingerprint: String,
}

/// Result of an SSH key upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub record: SshKeyRecord,
    /// True when this call created the record.
    pub inserted: bool,
}

/// Persistence contract for token and SSH key records.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    async fn insert_token(&self, record: TokenRecord) -> StoreResult<()>;

    /// Active tokens whose hash prefix equals `prefix`.
    async fn active_tokens_by_prefix(&self, prefix: &str) -> StoreResult<Vec<TokenRecord>>;

    async fn list_tokens(&self, user_id: &str) -> StoreResult<Vec<TokenRecord>>;

    /// Mark the user's token inactive. Returns false if the user has no such token.
    async fn deactivate_token(&self, user_id: &str, token_id: &str) -> StoreResult<bool>;

    /// Mark every active token of the user with this label inactive.
    async fn deactivate_tokens_by_label(&self, user_id: &str, label: &str) -> StoreResult<usize>;

    /// Insert the key if its fingerprint is unknown, otherwise refresh `updated_at`
    /// (and the label, when given) of the existing record.
    ///
    /// A fingerprint owned by a different user is returned untouched with
    /// `inserted == false`.
    async fn upsert_ssh_key(&self, key: NewSshKey, now: DateTime<Utc>) -> StoreResult<UpsertOutcome>;

    async fn find_ssh_key(&self, fingerprint: &str) -> StoreResult<Option<SshKeyRecord>>;

    async fn list_ssh_keys(&self, user_id: &str) -> StoreResult<Vec<SshKeyRecord>>;

    /// Remove the user's key by id. Returns false if the user has no such key.
    async fn delete_ssh_key(&self, user_id: &str, key_id: &str) -> StoreResult<bool>;
}

/// Generate a record id (24 hex characters).
pub fn new_record_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// On-disk document.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    /// Token records by id.
    #[serde(default)]
    tokens: HashMap<String, TokenRecord>,

    /// SSH key records by fingerprint.
    #[serde(default)]
    ssh_keys: HashMap<String, SshKeyRecord>,

    /// hash prefix -> token ids
    #[serde(skip)]
    prefix_index: HashMap<String, Vec<String>>,
}

impl StoreState {
    fn rebuild_index(&mut self) {
        self.prefix_index.clear();
        for record in self.tokens.values() {
            self.prefix_index
                .entry(record.hash_prefix.clone())
                .or_default()
                .push(record.id.clone());
        }
    }
}

/// JSON document store.
pub struct JsonStore {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
}

impl JsonStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            path: None,
        }
    }

    /// Load the store from disk, or start empty if the file doesn't exist.
    pub async fn load(path: PathBuf) -> StoreResult<Self> {
        let mut state = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str::<StoreState>(&content)?
        } else {
            StoreState::default()
        };
        state.rebuild_index();

        debug!(
            tokens = state.tokens.len(),
            ssh_keys = state.ssh_keys.len(),
            "Loaded credential store from {}",
            path.display()
        );

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    /// Write the document to disk. Callers hold the write lock.
    async fn save(&self, state: &StoreState) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(state)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;

        Ok(())
    }

    /// Persist `next` and only then make it the live state. A failed write
    /// leaves the live state as it was.
    async fn commit(&self, state: &mut StoreState, next: StoreState) -> StoreResult<()> {
        self.save(&next).await?;
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl CredentialBackend for JsonStore {
    async fn insert_token(&self, record: TokenRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.prefix_index
            .entry(record.hash_prefix.clone())
            .or_default()
            .push(record.id.clone());
        next.tokens.insert(record.id.clone(), record);
        self.commit(&mut state, next).await
    }

    async fn active_tokens_by_prefix(&self, prefix: &str) -> StoreResult<Vec<TokenRecord>> {
        let state = self.state.read().await;
        let Some(ids) = state.prefix_index.get(prefix) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| state.tokens.get(id))
            .filter(|record| record.active)
            .cloned()
            .collect())
    }

    async fn list_tokens(&self, user_id: &str) -> StoreResult<Vec<TokenRecord>> {
        let state = self.state.read().await;
        let mut tokens: Vec<TokenRecord> = state
            .tokens
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        tokens.sort_by_key(|record| record.created_at);
        Ok(tokens)
    }

    async fn deactivate_token(&self, user_id: &str, token_id: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let was_active = match state.tokens.get(token_id) {
            Some(record) if record.user_id == user_id => record.active,
            _ => return Ok(false),
        };
        if was_active {
            let mut next = state.clone();
            if let Some(record) = next.tokens.get_mut(token_id) {
                record.active = false;
            }
            self.commit(&mut state, next).await?;
        }
        Ok(true)
    }

    async fn deactivate_tokens_by_label(&self, user_id: &str, label: &str) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let mut count = 0;
        for record in next.tokens.values_mut() {
            if record.user_id == user_id && record.label == label && record.active {
                record.active = false;
                count += 1;
            }
        }
        if count > 0 {
            self.commit(&mut state, next).await?;
        }
        Ok(count)
    }

    async fn upsert_ssh_key(&self, key: NewSshKey, now: DateTime<Utc>) -> StoreResult<UpsertOutcome> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.ssh_keys.get(&key.fingerprint) {
            if existing.user_id != key.user_id {
                return Ok(UpsertOutcome {
                    record: existing.clone(),
                    inserted: false,
                });
            }
            let mut record = existing.clone();
            record.updated_at = now;
            if !key.key_name.is_empty() {
                record.label = key.key_name;
            }
            let mut next = state.clone();
            next.ssh_keys.insert(record.fingerprint.clone(), record.clone());
            self.commit(&mut state, next).await?;
            return Ok(UpsertOutcome {
                record,
                inserted: false,
            });
        }

        let record = SshKeyRecord {
            id: new_record_id(),
            user_id: key.user_id,
            label: key.key_name.clone(),
            key_name: key.key_name,
            public_key: key.public_key,
            fingerprint: key.fingerprint.clone(),
            created_at: now,
            updated_at: now,
        };
        let mut next = state.clone();
        next.ssh_keys.insert(key.fingerprint, record.clone());
        self.commit(&mut state, next).await?;

        Ok(UpsertOutcome {
            record,
            inserted: true,
        })
    }

    async fn find_ssh_key(&self, fingerprint: &str) -> StoreResult<Option<SshKeyRecord>> {
        let state = self.state.read().await;
        Ok(state.ssh_keys.get(fingerprint).cloned())
    }

    async fn list_ssh_keys(&self, user_id: &str) -> StoreResult<Vec<SshKeyRecord>> {
        let state = self.state.read().await;
        let mut keys: Vec<SshKeyRecord> = state
            .ssh_keys
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by_key(|record| record.created_at);
        Ok(keys)
    }

    async fn delete_ssh_key(&self, user_id: &str, key_id: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let fingerprint = state
            .ssh_keys
            .values()
            .find(|record| record.id == key_id && record.user_id == user_id)
            .map(|record| record.fingerprint.clone());

        match fingerprint {
            Some(fingerprint) => {
                let mut next = state.clone();
                next.ssh_keys.remove(&fingerprint);
                self.commit(&mut state, next).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
