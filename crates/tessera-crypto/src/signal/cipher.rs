//! Per-message session cipher.
//!
//! Every message gets a fresh ephemeral X25519 key. The message key is
//! HKDF-SHA256 over `DH(ephemeral, remote) || DH(local, remote)`, so a
//! recipient can only open a payload when it names the right sender key.
//! There is no ratchet: no chain keys, no replay protection, no ordering.
//!
//! Wire layout: `ephemeral_public (32) || nonce (12) || ciphertext+tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::Identity;
use crate::signal::prekeys::{AgreementKeyRef, PreKeyBundle};

pub const EPHEMERAL_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Smallest well-formed payload: an empty plaintext still carries a tag.
pub const MIN_PAYLOAD_LEN: usize = EPHEMERAL_KEY_LEN + NONCE_LEN + TAG_LEN;

const MESSAGE_KEY_INFO: &[u8] = b"TesseraMessageKey";

/// Encrypt `plaintext` from the holder of `local_secret` to `remote_public`.
pub fn encrypt(
    plaintext: &[u8],
    local_secret: &StaticSecret,
    remote_public: &X25519Public,
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);

    let dh_ephemeral = ephemeral.diffie_hellman(remote_public);
    let dh_static = local_secret.diffie_hellman(remote_public);
    let local_public = X25519Public::from(local_secret);

    let message_key = derive_message_key(
        &dh_ephemeral,
        &dh_static,
        &local_public,
        remote_public,
        &ephemeral_public,
    )?;

    let cipher = Aes256Gcm::new_from_slice(&message_key[..])
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| CryptoError::EncryptionError(format!("entropy unavailable: {e}")))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut output = Vec::with_capacity(EPHEMERAL_KEY_LEN + NONCE_LEN + ciphertext.len());
    output.extend_from_slice(ephemeral_public.as_bytes());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt a payload produced by [`encrypt`].
///
/// `remote_public` is the sender's static key; a payload from anyone else
/// fails authentication.
pub fn decrypt(
    payload: &[u8],
    local_secret: &StaticSecret,
    remote_public: &X25519Public,
) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(CryptoError::MalformedPayload(format!(
            "payload is {} bytes, need at least {MIN_PAYLOAD_LEN}",
            payload.len()
        )));
    }

    let (ephemeral_bytes, rest) = payload.split_at(EPHEMERAL_KEY_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral_raw = <[u8; EPHEMERAL_KEY_LEN]>::try_from(ephemeral_bytes)
        .map_err(|_| CryptoError::MalformedPayload("invalid ephemeral key".into()))?;
    let ephemeral_public = X25519Public::from(ephemeral_raw);

    let dh_ephemeral = local_secret.diffie_hellman(&ephemeral_public);
    let dh_static = local_secret.diffie_hellman(remote_public);
    let local_public = X25519Public::from(local_secret);

    let message_key = derive_message_key(
        &dh_ephemeral,
        &dh_static,
        remote_public,
        &local_public,
        &ephemeral_public,
    )?;

    let cipher = Aes256Gcm::new_from_slice(&message_key[..])
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| {
            tracing::debug!(len = payload.len(), "session payload failed authentication");
            CryptoError::DecryptionError("authentication tag mismatch".into())
        })
}

fn derive_message_key(
    dh_ephemeral: &SharedSecret,
    dh_static: &SharedSecret,
    sender_public: &X25519Public,
    recipient_public: &X25519Public,
    ephemeral_public: &X25519Public,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if !dh_ephemeral.was_contributory() || !dh_static.was_contributory() {
        return Err(CryptoError::AgreementError(
            "non-contributory Diffie-Hellman output".into(),
        ));
    }

    let mut ikm = Zeroizing::new([0u8; 64]);
    ikm[..32].copy_from_slice(dh_ephemeral.as_bytes());
    ikm[32..].copy_from_slice(dh_static.as_bytes());

    let mut info = Vec::with_capacity(MESSAGE_KEY_INFO.len() + 96);
    info.extend_from_slice(MESSAGE_KEY_INFO);
    info.extend_from_slice(sender_public.as_bytes());
    info.extend_from_slice(recipient_public.as_bytes());
    info.extend_from_slice(ephemeral_public.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, &ikm[..]);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut key[..])
        .map_err(|e| CryptoError::AgreementError(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

/// First message to an offline peer, addressed via their prekey bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialMessage {
    /// Sender's Ed25519 identity public key.
    pub sender_identity: Vec<u8>,
    pub key_ref: AgreementKeyRef,
    pub payload: Vec<u8>,
}

/// Verify `bundle` and encrypt `plaintext` against its agreement key.
pub fn seal_for_bundle(
    sender: &Identity,
    bundle: &PreKeyBundle,
    plaintext: &[u8],
) -> Result<InitialMessage, CryptoError> {
    let (key_ref, remote_public) = bundle.agreement_key()?;
    let payload = encrypt(plaintext, &sender.to_x25519_secret(), &remote_public)?;
    Ok(InitialMessage {
        sender_identity: sender.public_key_bytes().to_vec(),
        key_ref,
        payload,
    })
}

impl InitialMessage {
    /// Open with the private half of the prekey named by `key_ref`.
    pub fn open(&self, agreement_secret: &StaticSecret) -> Result<Vec<u8>, CryptoError> {
        let raw = <[u8; 32]>::try_from(self.sender_identity.as_slice())
            .map_err(|_| CryptoError::InvalidKey("sender identity wrong length".into()))?;
        let sender_public = Identity::peer_ed25519_to_x25519(&raw)?;
        decrypt(&self.payload, agreement_secret, &sender_public)
    }
}
