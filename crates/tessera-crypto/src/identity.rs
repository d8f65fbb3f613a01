use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// A device's long-lived cryptographic identity.
///
/// The Ed25519 key signs prekeys, link challenges and request proofs. Its
/// X25519 form (same scalar, Edwards→Montgomery map for the public half)
/// is used for key agreement, so peers only ever need the Ed25519 public key.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Restore an identity from a secret key slice of any length, rejecting
    /// anything that is not exactly 32 bytes.
    pub fn from_secret_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = <[u8; 32]>::try_from(bytes)
            .map_err(|_| CryptoError::InvalidKey("identity secret must be 32 bytes".into()))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Secret key bytes, for storage in the keychain only.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a signature against a public key.
    pub fn verify(
        public_key: &VerifyingKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        public_key
            .verify(message, signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }

    /// Verify a signature given as raw bytes against a raw Ed25519 public key.
    ///
    /// Malformed keys and signatures are reported the same way as a bad
    /// signature: callers treat all three as "does not verify".
    pub fn verify_raw(
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let public_key = verifying_key_from_slice(public_key)?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::VerificationError(format!("malformed signature: {e}")))?;
        Self::verify(&public_key, message, &signature)
    }

    /// Derive an X25519 static secret from this Ed25519 key for Diffie-Hellman.
    ///
    /// Uses the SHA-512-expanded scalar (same scalar that Ed25519 uses internally)
    /// so that `to_x25519_public()` matches `peer_ed25519_to_x25519()` via the
    /// standard Edwards→Montgomery birational map.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        let scalar_bytes = self.signing_key.to_scalar_bytes();
        x25519_dalek::StaticSecret::from(scalar_bytes)
    }

    pub fn to_x25519_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.to_x25519_secret())
    }

    /// Get the public key as a hex string (for display / sharing).
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Convert a peer's Ed25519 public key bytes to an X25519 public key.
    ///
    /// Uses the standard Edwards→Montgomery birational map (RFC 7748).
    pub fn peer_ed25519_to_x25519(
        ed25519_public_bytes: &[u8; 32],
    ) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(ed25519_public_bytes).map_err(|e| {
            CryptoError::VerificationError(format!("invalid Ed25519 public key: {e}"))
        })?;
        let montgomery = verifying_key.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Parse a raw Ed25519 public key.
pub fn verifying_key_from_slice(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let raw = <[u8; 32]>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidKey("Ed25519 public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))
}
