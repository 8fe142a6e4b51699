//! Personal access token generation and hashing.
//!
//! Tokens are 32 random bytes, hex-encoded. Each stored token carries the
//! algorithm it was hashed with, and verification dispatches on that tag so
//! records created under older settings stay verifiable without rehashing.
//!
//! Stored hash formats:
//! - argon2id: PHC string (`$argon2id$v=19$m=...,t=...,p=...$salt$hash`)
//! - bcrypt: modular crypt string (`$2b$12$...`)
//! - pbkdf2: `pbkdf2$<iterations>$<salt hex>$<derived key hex>` (HMAC-SHA256,
//!   64-byte key); the older `pbkdf2$<salt hex>$<derived key hex>` form implies
//!   100000 iterations

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use crate::config::HashingConfig;

/// Number of random bytes in a plaintext token.
pub const TOKEN_BYTES: usize = 32;

/// Length of the lookup prefix, in hex characters.
pub const HASH_PREFIX_LEN: usize = 8;

const PBKDF2_KEY_LEN: usize = 64;
const PBKDF2_SALT_LEN: usize = 16;
const PBKDF2_LEGACY_ITERATIONS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid hashing parameters: {0}")]
    Params(String),

    #[error("hashing failed: {0}")]
    Failed(String),
}

/// Supported token hashing schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Argon2id,
    Bcrypt,
    Pbkdf2,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Argon2id => "argon2id",
            HashAlgorithm::Bcrypt => "bcrypt",
            HashAlgorithm::Pbkdf2 => "pbkdf2",
        }
    }

    /// Hash `token` under this algorithm.
    ///
    /// This is CPU bound (argon2id also allocates `argon2_memory_kib`); async
    /// callers should run it on the blocking pool.
    pub fn hash(self, token: &str, params: &HashingConfig) -> Result<String, HashError> {
        match self {
            HashAlgorithm::Argon2id => hash_argon2id(token, params),
            HashAlgorithm::Bcrypt => bcrypt::hash(token, params.bcrypt_cost)
                .map_err(|e| HashError::Failed(e.to_string())),
            HashAlgorithm::Pbkdf2 => Ok(hash_pbkdf2(token, params.pbkdf2_iterations)),
        }
    }

    /// Check `token` against a hash produced by this algorithm.
    ///
    /// Malformed stored hashes never verify.
    pub fn verify(self, token: &str, stored: &str) -> bool {
        match self {
            HashAlgorithm::Argon2id => verify_argon2id(token, stored),
            HashAlgorithm::Bcrypt => bcrypt::verify(token, stored).unwrap_or(false),
            HashAlgorithm::Pbkdf2 => verify_pbkdf2(token, stored),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "argon2id" | "argon2" => Ok(HashAlgorithm::Argon2id),
            "bcrypt" => Ok(HashAlgorithm::Bcrypt),
            "pbkdf2" => Ok(HashAlgorithm::Pbkdf2),
            other => Err(format!("unsupported hash algorithm '{}'", other)),
        }
    }
}

/// Generate a new plaintext token.
///
/// If the OS random source fails, the token is derived from the user id and
/// the current time and then hashed again, so the predictable input is never
/// handed out directly.
pub fn generate_token(user_id: &str) -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(e) => {
            warn!("OS random source unavailable, using fallback token derivation: {}", e);
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let seed = format!("{}-{}", user_id, nanos);
            hex::encode(Sha256::digest(seed.as_bytes()))
        }
    }
}

/// Lookup prefix for a plaintext token: the first 8 hex characters of its SHA-256.
pub fn hash_prefix(token: &str) -> String {
    let digest = hex::encode(Sha256::digest(token.as_bytes()));
    digest[..HASH_PREFIX_LEN].to_string()
}

/// Tokens are non-empty hex strings.
pub fn is_token_shaped(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_hexdigit())
}

fn hash_argon2id(token: &str, params: &HashingConfig) -> Result<String, HashError> {
    let argon_params = Params::new(
        params.argon2_memory_kib,
        params.argon2_time_cost,
        params.argon2_parallelism,
        None,
    )
    .map_err(|e| HashError::Params(e.to_string()))?;
    let argon = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut salt_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| HashError::Failed(e.to_string()))?;

    let hash = argon
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| HashError::Failed(e.to_string()))?;
    Ok(hash.to_string())
}

fn verify_argon2id(token: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(token.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn hash_pbkdf2(token: &str, iterations: u32) -> String {
    let mut salt = [0u8; PBKDF2_SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let derived = pbkdf2_derive(token, &salt, iterations);
    format!(
        "pbkdf2${}${}${}",
        iterations,
        hex::encode(salt),
        hex::encode(derived)
    )
}

fn verify_pbkdf2(token: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    let (iterations, salt_hex, expected_hex) = match parts.as_slice() {
        ["pbkdf2", iterations, salt, expected] => match iterations.parse::<u32>() {
            Ok(n) if n > 0 => (n, *salt, *expected),
            _ => return false,
        },
        ["pbkdf2", salt, expected] => (PBKDF2_LEGACY_ITERATIONS, *salt, *expected),
        _ => return false,
    };

    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(expected_hex)) else {
        return false;
    };
    if expected.len() != PBKDF2_KEY_LEN {
        return false;
    }

    let derived = pbkdf2_derive(token, &salt, iterations);
    derived[..].ct_eq(&expected[..]).into()
}

fn pbkdf2_derive(token: &str, salt: &[u8], iterations: u32) -> [u8; PBKDF2_KEY_LEN] {
    let mut out = [0u8; PBKDF2_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(token.as_bytes(), salt, iterations, &mut out);
    out
}

#[cfg(test)]
pub(crate) fn fast_params(algorithm: HashAlgorithm) -> HashingConfig {
    HashingConfig {
        algorithm,
        argon2_memory_kib: 1024,
        argon2_time_cost: 1,
        argon2_parallelism: 1,
        bcrypt_cost: 4,
        pbkdf2_iterations: 1_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [HashAlgorithm; 3] = [
        HashAlgorithm::Argon2id,
        HashAlgorithm::Bcrypt,
        HashAlgorithm::Pbkdf2,
    ];

    #[test]
    fn test_generate_token_shape() {
        let a = generate_token("u1");
        let b = generate_token("u1");
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(is_token_shaped(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_prefix() {
        // sha256("abc") = ba7816bf...
        assert_eq!(hash_prefix("abc"), "ba7816bf");
        assert_eq!(hash_prefix("abc").len(), HASH_PREFIX_LEN);
    }

    #[test]
    fn test_token_shape_check() {
        assert!(is_token_shaped("deadBEEF0123"));
        assert!(!is_token_shaped(""));
        assert!(!is_token_shaped("not-a-token"));
        assert!(!is_token_shaped("abc xyz"));
    }

    #[test]
    fn test_each_algorithm_verifies_its_own_hash() {
        let token = generate_token("u1");
        for algo in ALL {
            let stored = algo.hash(&token, &fast_params(algo)).unwrap();
            assert!(algo.verify(&token, &stored), "{} should verify", algo);
            assert!(!algo.verify(&format!("{}0", token), &stored), "{} accepted tampered token", algo);
        }
    }

    #[test]
    fn test_hash_formats() {
        let token = generate_token("u1");
        let argon = HashAlgorithm::Argon2id
            .hash(&token, &fast_params(HashAlgorithm::Argon2id))
            .unwrap();
        assert!(argon.starts_with("$argon2id$"));

        let bcrypt = HashAlgorithm::Bcrypt
            .hash(&token, &fast_params(HashAlgorithm::Bcrypt))
            .unwrap();
        assert!(bcrypt.starts_with("$2"));

        let pbkdf2 = HashAlgorithm::Pbkdf2
            .hash(&token, &fast_params(HashAlgorithm::Pbkdf2))
            .unwrap();
        assert!(pbkdf2.starts_with("pbkdf2$1000$"));
    }

    #[test]
    fn test_verification_uses_the_given_algorithm_only() {
        let token = generate_token("u1");
        let bcrypt = HashAlgorithm::Bcrypt
            .hash(&token, &fast_params(HashAlgorithm::Bcrypt))
            .unwrap();
        assert!(!HashAlgorithm::Argon2id.verify(&token, &bcrypt));
        assert!(!HashAlgorithm::Pbkdf2.verify(&token, &bcrypt));
    }

    #[test]
    fn test_legacy_pbkdf2_format() {
        let token = "00ff00ff";
        let salt = [7u8; 16];
        let derived = pbkdf2_derive(token, &salt, PBKDF2_LEGACY_ITERATIONS);
        let stored = format!("pbkdf2${}${}", hex::encode(salt), hex::encode(derived));
        assert!(HashAlgorithm::Pbkdf2.verify(token, &stored));
    }

    #[test]
    fn test_malformed_hashes_do_not_verify() {
        for algo in ALL {
            assert!(!algo.verify("abcd", ""));
            assert!(!algo.verify("abcd", "garbage"));
        }
        assert!(!HashAlgorithm::Pbkdf2.verify("abcd", "pbkdf2$0$00$00"));
        assert!(!HashAlgorithm::Pbkdf2.verify("abcd", "pbkdf2$zz$zz"));
    }

    #[test]
    fn test_algorithm_parse_and_display() {
        for algo in ALL {
            assert_eq!(algo.to_string().parse::<HashAlgorithm>().unwrap(), algo);
        }
        assert_eq!("ARGON2".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Argon2id);
        assert!("sha1".parse::<HashAlgorithm>().is_err());
        assert_eq!(
            serde_json::to_string(&HashAlgorithm::Pbkdf2).unwrap(),
            "\"pbkdf2\""
        );
    }
}
