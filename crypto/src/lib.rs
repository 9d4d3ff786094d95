//! Cryptographic primitives for Portaria
//!
//! - Ed25519 signing keys for gate QR payloads (`signing`)
//! - Deterministic one-way pseudonyms for LGPD anonymisation (`pseudonym`)
//!
//! # Example
//!
//! ```rust
//! use crypto::{pseudonymous_token, SigningKeyPair};
//!
//! let pair = SigningKeyPair::generate();
//! let signature = crypto::sign(pair.private_key(), b"2024001|ENTRY").unwrap();
//! crypto::verify(pair.public_key(), b"2024001|ENTRY", &signature).unwrap();
//!
//! assert!(pseudonymous_token("2024001").starts_with("ANON-"));
//! ```

pub mod error;
pub mod pseudonym;
pub mod signing;

pub use error::*;
pub use pseudonym::pseudonymous_token;
pub use signing::{sign, verify, SigningKeyPair};
