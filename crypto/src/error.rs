use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
