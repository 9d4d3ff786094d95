//! One-way pseudonymous tokens for anonymised records.

use sha2::{Digest, Sha256};

/// Domain separator so tokens cannot be matched against plain SHA-256 of ids
const PSEUDONYM_CONTEXT: &[u8] = b"portaria:pseudonym:v1:";

/// Number of hex characters kept from the digest
const TOKEN_HEX_LEN: usize = 16;

/// Derive a deterministic pseudonym for an identifier, e.g. `ANON-1F2E...`.
///
/// The same identifier always maps to the same token, so statistics keep
/// grouping correctly after anonymisation while the original value cannot be
/// recovered from the token.
pub fn pseudonymous_token(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(PSEUDONYM_CONTEXT);
    hasher.update(identifier.as_bytes());
    let digest = hex::encode_upper(hasher.finalize());

    format!("ANON-{}", &digest[..TOKEN_HEX_LEN])
}
