//! Credential cache keys.
//!
//! A key is a SHA-256 digest over a scheme tag plus the credential parts,
//! each length-prefixed so part boundaries cannot be shifted. The scheme tag
//! keeps token keys and basic-auth keys in disjoint namespaces even when the
//! raw bytes coincide. Keys are never reversed; they exist only as map
//! indices.

use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque cache index for an authentication identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialKey([u8; 32]);

impl fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

fn digest(scheme: &str, parts: &[&str]) -> CredentialKey {
    let mut hasher = Sha256::new();
    for part in std::iter::once(&scheme).chain(parts.iter()) {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    CredentialKey(hasher.finalize().into())
}

/// Key for an email/password pair.
pub fn basic_key(email: &str, password: &str) -> CredentialKey {
    digest("basic", &[email, password])
}

/// Key for a shared-secret token.
pub fn token_key(token: &str) -> CredentialKey {
    digest("token", &[token])
}
