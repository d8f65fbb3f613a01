use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("verification failed: {0}")]
    VerificationError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("unable to decrypt: {0}")]
    DecryptionError(String),

    #[error("key agreement failed: {0}")]
    AgreementError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("prekey error: {0}")]
    PreKeyError(String),

    #[error("key storage error: {0}")]
    StorageError(String),
}
