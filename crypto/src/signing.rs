//! Ed25519 signing keys used to sign gate QR payloads.
//!
//! Key material is exchanged as standard base64 so it can live inside JSON
//! documents in the local store and on the remote API.

use crate::error::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const SECRET_KEY_LENGTH: usize = 32;
const PUBLIC_KEY_LENGTH: usize = 32;

/// Freshly generated keypair, base64 encoded.
///
/// The private half is zeroized when the pair is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    public_key: String,
    private_key: String,
}

impl SigningKeyPair {
    /// Generate a new random keypair from the OS entropy source
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let secret = Zeroizing::new(signing_key.to_bytes());

        Self {
            public_key: BASE64.encode(signing_key.verifying_key().to_bytes()),
            private_key: BASE64.encode(secret.as_slice()),
        }
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

fn decode_fixed<const N: usize>(encoded: &str) -> CryptoResult<Zeroizing<[u8; N]>> {
    let bytes = Zeroizing::new(
        BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?,
    );

    if bytes.len() != N {
        return Err(CryptoError::InvalidKeyLength {
            expected: N,
            got: bytes.len(),
        });
    }

    let mut out = Zeroizing::new([0u8; N]);
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Sign `message` with a base64 private key, returning a base64 signature
pub fn sign(private_key_b64: &str, message: &[u8]) -> CryptoResult<String> {
    let secret = decode_fixed::<SECRET_KEY_LENGTH>(private_key_b64)?;
    let signing_key = SigningKey::from_bytes(&secret);
    Ok(BASE64.encode(signing_key.sign(message).to_bytes()))
}

/// Verify a base64 signature against a base64 public key
pub fn verify(public_key_b64: &str, message: &[u8], signature_b64: &str) -> CryptoResult<()> {
    let public = decode_fixed::<PUBLIC_KEY_LENGTH>(public_key_b64)?;
    let verifying_key =
        VerifyingKey::from_bytes(&public).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let signature_bytes = BASE64
        .decode(signature_b64.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| CryptoError::SignatureVerificationFailed(e.to_string()))?;

    verifying_key
        .verify(message, &signature)
        .map_err(|e| CryptoError::SignatureVerificationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_distinct() {
        let a = SigningKeyPair::generate();
        let b = SigningKeyPair::generate();

        assert_ne!(a.public_key(), b.public_key());
        assert_ne!(a.private_key(), b.private_key());
    }

    #[test]
    fn test_sign_and_verify() {
        let pair = SigningKeyPair::generate();
        let payload = b"2024001|ENTRY|2024-03-11T07:10:00Z";

        let signature = sign(pair.private_key(), payload).unwrap();
        assert!(verify(pair.public_key(), payload, &signature).is_ok());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let pair = SigningKeyPair::generate();
        let signature = sign(pair.private_key(), b"2024001|ENTRY").unwrap();

        let result = verify(pair.public_key(), b"2024002|ENTRY", &signature);
        assert!(matches!(result, Err(CryptoError::SignatureVerificationFailed(_))));
    }

    #[test]
    fn test_wrong_length_key() {
        let short = BASE64.encode([1u8; 16]);
        let result = sign(&short, b"x");
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength { expected: 32, got: 16 })
        ));
    }

    #[test]
    fn test_debug_hides_private_key() {
        let pair = SigningKeyPair::generate();
        let rendered = format!("{:?}", pair);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains(pair.private_key()));
    }
}
