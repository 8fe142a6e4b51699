//! SSH public key parsing and fingerprinting.
//!
//! This module handles:
//! - Validating public key material submitted for registration
//! - Computing `SHA256:<base64>` fingerprints (padded standard base64),
//!   identical for a key line and for the wire-format key offered during SSH
//!   authentication

use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const FINGERPRINT_PREFIX: &str = "SHA256:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("private key material is not accepted")]
    PrivateKey,

    #[error("unrecognized public key type")]
    UnknownType,

    #[error("invalid SSH key format: {0}")]
    Malformed(String),
}

/// A validated public key line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub key_type: String,
    pub key_data: String,
    pub comment: Option<String>,
}

impl ParsedKey {
    /// `type base64` without the comment.
    pub fn normalized(&self) -> String {
        format!("{} {}", self.key_type, self.key_data)
    }
}

/// Parse an SSH public key string into (type, base64_data).
///
/// Handles formats like:
/// - "ssh-ed25519 AAAA... comment"
/// - "ssh-rsa AAAA... comment"
pub fn parse_ssh_key(key: &str) -> Result<(String, String), KeyError> {
    let parts: Vec<&str> = key.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(KeyError::Malformed("too few parts".to_string()));
    }

    let key_type = parts[0].to_string();
    let key_data = parts[1].to_string();

    base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .map_err(|_| KeyError::Malformed("invalid base64 in SSH key".to_string()))?;

    Ok((key_type, key_data))
}

/// Validate key material submitted for registration.
///
/// Rejects anything that looks like a private key, lines without a recognized
/// public key type, and blobs whose embedded type does not match the line.
pub fn validate_public_key(material: &str) -> Result<ParsedKey, KeyError> {
    let trimmed = material.trim();
    if trimmed.contains("PRIVATE KEY") || trimmed.starts_with("-----BEGIN") {
        return Err(KeyError::PrivateKey);
    }

    let key_type = trimmed.split_whitespace().next().unwrap_or_default();
    if !is_public_key_type(key_type) {
        return Err(KeyError::UnknownType);
    }

    let (key_type, key_data) = parse_ssh_key(trimmed)?;
    let blob = base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .map_err(|_| KeyError::Malformed("invalid base64 in SSH key".to_string()))?;

    match embedded_key_type(&blob) {
        Some(embedded) if embedded == key_type => {}
        Some(embedded) => {
            return Err(KeyError::Malformed(format!(
                "key type '{}' does not match encoded type '{}'",
                key_type, embedded
            )));
        }
        None => return Err(KeyError::Malformed("truncated key blob".to_string())),
    }

    let comment = trimmed
        .split_whitespace()
        .skip(2)
        .collect::<Vec<_>>()
        .join(" ");

    Ok(ParsedKey {
        key_type,
        key_data,
        comment: (!comment.is_empty()).then_some(comment),
    })
}

fn is_public_key_type(key_type: &str) -> bool {
    let known_prefix = key_type.starts_with("ssh-")
        || key_type.starts_with("ecdsa-")
        || key_type.starts_with("sk-");
    known_prefix
        && key_type.len() > 4
        && key_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '@' | '.'))
}

/// Read the length-prefixed algorithm name at the start of a wire-format key.
fn embedded_key_type(blob: &[u8]) -> Option<&str> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4usize.checked_add(len)?)?;
    std::str::from_utf8(name).ok()
}

/// Compute the SHA256 fingerprint of an SSH public key line.
///
/// Returns the fingerprint in "SHA256:..." format used by `ssh-keygen -l`.
pub fn compute_fingerprint(public_key: &str) -> Result<String, KeyError> {
    let (_, key_data) = parse_ssh_key(public_key)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .map_err(|_| KeyError::Malformed("invalid base64 in SSH key".to_string()))?;
    Ok(compute_fingerprint_from_bytes(&decoded))
}

/// Compute fingerprint from raw key bytes (wire format).
pub fn compute_fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let hash = Sha256::digest(key_bytes);
    let b64 = base64::engine::general_purpose::STANDARD.encode(hash);
    format!("{}{}", FINGERPRINT_PREFIX, b64)
}

/// Canonical (padded) form of a caller-supplied fingerprint. `ssh-keygen -l`
/// prints the digest without `=` padding; both forms name the same key.
pub fn normalize_fingerprint(value: &str) -> String {
    let Some(digest) = value.strip_prefix(FINGERPRINT_PREFIX) else {
        return value.to_string();
    };
    let padding = match digest.len() % 4 {
        2 => "==",
        3 => "=",
        _ => "",
    };
    format!("{}{}{}", FINGERPRINT_PREFIX, digest, padding)
}

/// Compute fingerprint from a russh public key.
pub fn compute_fingerprint_from_pubkey(key: &russh::keys::PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    // public_key_bytes() returns the raw key data in SSH wire format
    let raw_bytes = key.public_key_bytes();
    compute_fingerprint_from_bytes(&raw_bytes)
}

/// Cheap shape check for a fingerprint received from a caller.
pub fn is_fingerprint(value: &str) -> bool {
    value
        .strip_prefix(FINGERPRINT_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && !rest.chars().any(char::is_whitespace))
}

#[cfg(test)]
pub(crate) const TEST_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@example.com";

#[cfg(test)]
pub(crate) const TEST_KEY_FINGERPRINT: &str = "SHA256:+DiY3wvvV6TuJJhbpZisF/zLDA0zPMSvHdkr4UvCOqU=";

#[cfg(test)]
pub(crate) const OTHER_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJk";
