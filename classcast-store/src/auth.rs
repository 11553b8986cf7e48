//! Shared-secret authentication of gateway peers.
//!
//! The daemon stores only SHA-256 digests of the accepted secrets. A peer
//! presents the plaintext secret in its HELLO.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct PeerSecrets {
    digests: HashSet<String>,
}

impl PeerSecrets {
    /// Builds the accepted set from hex digests (case-insensitive).
    pub fn from_digests(digests: impl IntoIterator<Item = String>) -> Self {
        Self {
            digests: digests
                .into_iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Returns true when peers must authenticate.
    pub fn is_enforced(&self) -> bool {
        !self.digests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Checks a presented secret. Always false when nothing is configured.
    pub fn verify(&self, secret: &str) -> bool {
        !self.digests.is_empty() && self.digests.contains(&digest(secret))
    }
}

/// Lowercase hex SHA-256 of a secret.
pub fn digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
