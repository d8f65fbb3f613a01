use serde::{Deserialize, Serialize};
use tessera_crypto::CryptoError;
use thiserror::Error;

use crate::store::StoreError;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Malformed input; never auto-retried.
    Validation,
    /// Missing key material or link request.
    NotFound,
    /// Signature or ownership mismatch; logged as a security event.
    Authorization,
    /// Too many attempts; carries the remaining wait.
    RateLimited,
    /// Key agreement or authenticated decryption failed.
    Crypto,
    /// The backing store failed; the caller may retry.
    Store,
}

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("device link request not found or already completed; request a new code on the new device")]
    LinkRequestNotFound,

    #[error("device link request expired; request a new code on the new device")]
    LinkRequestExpired,

    #[error("authorizing user {0} has no registered identity key")]
    UserNotFound(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("incorrect PIN ({attempts_remaining} attempts left before lockout)")]
    IncorrectPin { attempts_remaining: u32 },

    #[error("too many attempts, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrustError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_)
            | Self::LinkRequestNotFound
            | Self::LinkRequestExpired
            | Self::UserNotFound(_) => ErrorKind::NotFound,
            Self::InvalidSignature | Self::Unauthorized(_) | Self::IncorrectPin { .. } => {
                ErrorKind::Authorization
            }
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Crypto(CryptoError::StorageError(_)) | Self::Store(_) | Self::Serialization(_) => {
                ErrorKind::Store
            }
            Self::Crypto(_) => ErrorKind::Crypto,
        }
    }

    /// Seconds until the caller may try again, for rate-limited errors.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
