//! Identity, signed prekey and one-time prekey material, plus the bundle
//! served to peers who want to open a session with an offline user.
//!
//! Private halves stay on the device (see [`crate::keychain`]); only the
//! `Published*` projections are handed to the key directory.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;
use crate::identity::Identity;

/// Registration ids live in Signal's 14-bit range and are never zero.
const REGISTRATION_ID_MASK: u32 = 0x3FFF;

/// A user's identity key together with its registration id.
pub struct IdentityKeyPair {
    pub user_id: String,
    pub registration_id: u32,
    identity: Identity,
}

impl IdentityKeyPair {
    pub fn from_parts(user_id: impl Into<String>, identity: Identity, registration_id: u32) -> Self {
        Self {
            user_id: user_id.into(),
            registration_id,
            identity,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    pub fn published(&self, device_id: u32) -> PublishedIdentity {
        PublishedIdentity {
            user_id: self.user_id.clone(),
            device_id,
            public_key: self.public_key_bytes().to_vec(),
            registration_id: self.registration_id,
        }
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("user_id", &self.user_id)
            .field("registration_id", &self.registration_id)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Medium-lived X25519 prekey whose public half is signed by the identity key.
pub struct SignedPreKey {
    pub user_id: String,
    pub key_id: u32,
    pub signature: Vec<u8>,
    pub created_at_ms: u64,
    secret: StaticSecret,
}

impl SignedPreKey {
    /// Rebuild a signed prekey from persisted parts.
    pub fn restore(
        user_id: impl Into<String>,
        key_id: u32,
        secret: [u8; 32],
        signature: Vec<u8>,
        created_at_ms: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            key_id,
            signature,
            created_at_ms,
            secret: StaticSecret::from(secret),
        }
    }

    pub fn public_key(&self) -> X25519Public {
        X25519Public::from(&self.secret)
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Check the signature over the public half against an Ed25519 identity key.
    pub fn verify(&self, identity_public: &[u8]) -> Result<(), CryptoError> {
        Identity::verify_raw(identity_public, self.public_key().as_bytes(), &self.signature)
    }

    pub fn published(&self) -> PublishedSignedPreKey {
        PublishedSignedPreKey {
            user_id: self.user_id.clone(),
            key_id: self.key_id,
            public_key: self.public_key().as_bytes().to_vec(),
            signature: self.signature.clone(),
            created_at_ms: self.created_at_ms,
        }
    }
}

/// Single-use X25519 prekey.
pub struct OneTimePreKey {
    pub user_id: String,
    pub key_id: u32,
    pub used: bool,
    secret: StaticSecret,
}

impl OneTimePreKey {
    pub fn restore(user_id: impl Into<String>, key_id: u32, secret: [u8; 32]) -> Self {
        Self {
            user_id: user_id.into(),
            key_id,
            used: false,
            secret: StaticSecret::from(secret),
        }
    }

    pub fn public_key(&self) -> X25519Public {
        X25519Public::from(&self.secret)
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn published(&self) -> PublishedOneTimePreKey {
        PublishedOneTimePreKey {
            user_id: self.user_id.clone(),
            key_id: self.key_id,
            public_key: self.public_key().as_bytes().to_vec(),
            used: self.used,
        }
    }
}

/// Public projection of an identity as stored in the key directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedIdentity {
    pub user_id: String,
    pub device_id: u32,
    /// Ed25519 identity public key.
    pub public_key: Vec<u8>,
    pub registration_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedSignedPreKey {
    pub user_id: String,
    pub key_id: u32,
    /// X25519 public key.
    pub public_key: Vec<u8>,
    /// Ed25519 signature over `public_key` by the identity key.
    pub signature: Vec<u8>,
    pub created_at_ms: u64,
}

impl PublishedSignedPreKey {
    pub fn verify(&self, identity_public: &[u8]) -> Result<(), CryptoError> {
        Identity::verify_raw(identity_public, &self.public_key, &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedOneTimePreKey {
    pub user_id: String,
    pub key_id: u32,
    /// X25519 public key.
    pub public_key: Vec<u8>,
    pub used: bool,
}

/// Which of the recipient's prekeys a sender agreed against.
///
/// Travels next to the ciphertext so the recipient can resolve the
/// matching private half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "keyId", rename_all = "camelCase")]
pub enum AgreementKeyRef {
    Signed(u32),
    OneTime(u32),
}

/// Public keys needed to start an encrypted session with an offline peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    /// Ed25519 identity public key.
    pub identity_key: Vec<u8>,
    pub signed_prekey_id: u32,
    /// X25519 signed prekey (public).
    pub signed_prekey: Vec<u8>,
    /// Signature over the signed prekey by the identity key.
    pub signature: Vec<u8>,
    pub one_time_prekey_id: Option<u32>,
    /// X25519 one-time prekey, absent once the pool is exhausted.
    pub one_time_prekey: Option<Vec<u8>>,
}

impl PreKeyBundle {
    /// Verify the signed prekey against the bundle's identity key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        Identity::verify_raw(&self.identity_key, &self.signed_prekey, &self.signature)
            .map_err(|e| CryptoError::PreKeyError(format!("signed prekey does not verify: {e}")))
    }

    /// X25519 form of the bundle owner's identity key.
    pub fn identity_x25519(&self) -> Result<X25519Public, CryptoError> {
        let raw = <[u8; 32]>::try_from(self.identity_key.as_slice())
            .map_err(|_| CryptoError::InvalidKey("identity key wrong length".into()))?;
        Identity::peer_ed25519_to_x25519(&raw)
    }

    /// Verify the bundle and pick the key to agree against.
    ///
    /// Prefers the one-time prekey; an exhausted pool degrades to the signed
    /// prekey.
    pub fn agreement_key(&self) -> Result<(AgreementKeyRef, X25519Public), CryptoError> {
        self.verify()?;
        match (self.one_time_prekey_id, &self.one_time_prekey) {
            (Some(id), Some(key)) => Ok((AgreementKeyRef::OneTime(id), x25519_public(key)?)),
            (None, None) => Ok((
                AgreementKeyRef::Signed(self.signed_prekey_id),
                x25519_public(&self.signed_prekey)?,
            )),
            _ => Err(CryptoError::PreKeyError(
                "one-time prekey id and key must be present together".into(),
            )),
        }
    }
}

/// Generate a fresh identity with a random non-zero registration id.
pub fn generate_identity(user_id: impl Into<String>) -> Result<IdentityKeyPair, CryptoError> {
    let mut raw = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut raw)
        .map_err(|e| CryptoError::KeyGeneration(format!("entropy unavailable: {e}")))?;
    let registration_id = (u32::from_le_bytes(raw) & REGISTRATION_ID_MASK).max(1);

    let mut secret = zeroize::Zeroizing::new([0u8; 32]);
    OsRng
        .try_fill_bytes(&mut secret[..])
        .map_err(|e| CryptoError::KeyGeneration(format!("entropy unavailable: {e}")))?;

    Ok(IdentityKeyPair::from_parts(
        user_id,
        Identity::from_secret_bytes(&secret),
        registration_id,
    ))
}

/// Generate a signed prekey whose public half is signed by `identity`.
pub fn generate_signed_prekey(
    identity: &IdentityKeyPair,
    key_id: u32,
    created_at_ms: u64,
) -> SignedPreKey {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let signature = identity.identity().sign(public.as_bytes());
    SignedPreKey {
        user_id: identity.user_id.clone(),
        key_id,
        signature: signature.to_bytes().to_vec(),
        created_at_ms,
        secret,
    }
}

/// Generate `count` one-time prekeys with sequential ids starting at `start_id`.
///
/// Ids wrap around the `u32` space rather than overflowing.
pub fn generate_prekeys(user_id: &str, start_id: u32, count: u32) -> Vec<OneTimePreKey> {
    (0..count)
        .map(|offset| OneTimePreKey {
            user_id: user_id.to_string(),
            key_id: start_id.wrapping_add(offset),
            used: false,
            secret: StaticSecret::random_from_rng(OsRng),
        })
        .collect()
}

pub(crate) fn x25519_public(bytes: &[u8]) -> Result<X25519Public, CryptoError> {
    let raw = <[u8; 32]>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidKey("X25519 public key must be 32 bytes".into()))?;
    Ok(X25519Public::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_for(identity: &IdentityKeyPair, spk: &SignedPreKey, otpk: Option<&OneTimePreKey>) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: identity.registration_id,
            device_id: 1,
            identity_key: identity.public_key_bytes().to_vec(),
            signed_prekey_id: spk.key_id,
            signed_prekey: spk.public_key().as_bytes().to_vec(),
            signature: spk.signature.clone(),
            one_time_prekey_id: otpk.map(|k| k.key_id),
            one_time_prekey: otpk.map(|k| k.public_key().as_bytes().to_vec()),
        }
    }

    #[test]
    fn signed_prekey_verifies_for_many_identities() {
        for key_id in 0..16 {
            let identity = generate_identity("alice").unwrap();
            let spk = generate_signed_prekey(&identity, key_id, 1_000);
            assert!(spk.verify(&identity.public_key_bytes()).is_ok());
            assert!(spk.published().verify(&identity.public_key_bytes()).is_ok());
        }
    }

    #[test]
    fn signed_prekey_rejects_foreign_identity() {
        let alice = generate_identity("alice").unwrap();
        let bob = generate_identity("bob").unwrap();
        let spk = generate_signed_prekey(&alice, 1, 0);
        assert!(spk.verify(&bob.public_key_bytes()).is_err());
    }

    #[test]
    fn registration_id_in_range() {
        for _ in 0..32 {
            let id = generate_identity("u").unwrap().registration_id;
            assert!((1..=REGISTRATION_ID_MASK).contains(&id));
        }
    }

    #[test]
    fn prekeys_are_sequential_and_unused() {
        let keys = generate_prekeys("alice", 100, 5);
        let ids: Vec<u32> = keys.iter().map(|k| k.key_id).collect();
        assert_eq!(ids, vec![100, 101, 102, 103, 104]);
        assert!(keys.iter().all(|k| !k.used));
        assert_ne!(keys[0].public_key().as_bytes(), keys[1].public_key().as_bytes());
    }

    #[test]
    fn prekey_ids_wrap() {
        let keys = generate_prekeys("alice", u32::MAX, 2);
        assert_eq!(keys[0].key_id, u32::MAX);
        assert_eq!(keys[1].key_id, 0);
    }

    #[test]
    fn agreement_prefers_one_time_prekey() {
        let identity = generate_identity("alice").unwrap();
        let spk = generate_signed_prekey(&identity, 7, 0);
        let otpk = generate_prekeys("alice", 100, 1).remove(0);

        let (key_ref, public) = bundle_for(&identity, &spk, Some(&otpk)).agreement_key().unwrap();
        assert_eq!(key_ref, AgreementKeyRef::OneTime(100));
        assert_eq!(public.as_bytes(), otpk.public_key().as_bytes());

        let (key_ref, public) = bundle_for(&identity, &spk, None).agreement_key().unwrap();
        assert_eq!(key_ref, AgreementKeyRef::Signed(7));
        assert_eq!(public.as_bytes(), spk.public_key().as_bytes());
    }

    #[test]
    fn tampered_bundle_is_rejected() {
        let identity = generate_identity("alice").unwrap();
        let spk = generate_signed_prekey(&identity, 1, 0);
        let mut bundle = bundle_for(&identity, &spk, None);
        bundle.signed_prekey[0] ^= 0x01;
        assert!(matches!(bundle.agreement_key(), Err(CryptoError::PreKeyError(_))));
    }
}
