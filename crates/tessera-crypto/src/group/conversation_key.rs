use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::signal::prekeys::x25519_public;

const WRAP_KEY_INFO: &[u8] = b"TesseraConversationKeyWrap";
const WIRE_LEN: usize = 40;

/// Symmetric key shared by every participant of one conversation.
///
/// Distributed by wrapping it once per participant (see [`WrappedKey`]) and
/// rotated by bumping the generation when membership changes.
#[derive(ZeroizeOnDrop)]
pub struct ConversationKey {
    key: [u8; 32],
    /// Monotonically increasing generation number for key rotation tracking.
    #[zeroize(skip)]
    generation: u64,
}

/// A conversation key sealed to one participant's X25519 public key.
///
/// Ephemeral X25519 + HKDF-SHA256 + ChaCha20-Poly1305. Any modification of
/// the stored ciphertext, nonce or ephemeral key makes unwrapping fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    pub participant_id: String,
    pub generation: u64,
    pub ephemeral_public: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl ConversationKey {
    pub fn generate(generation: u64) -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key, generation }
    }

    pub fn from_bytes(key: [u8; 32], generation: u64) -> Self {
        Self { key, generation }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fresh key for the next generation.
    pub fn rotate(&self) -> Self {
        Self::generate(self.generation + 1)
    }

    /// Encrypt a conversation payload (nonce prepended).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut output = Vec::with_capacity(12 + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypt a conversation payload (expects nonce prepended).
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < 12 {
            return Err(CryptoError::MalformedPayload("data too short".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

        let nonce = Nonce::from_slice(&data[..12]);
        cipher
            .decrypt(nonce, &data[12..])
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))
    }

    /// Serialize to the 40-byte keychain format: generation (8 LE) + key (32).
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WIRE_LEN);
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf
    }

    /// Deserialize from the 40-byte keychain format. Returns `None` if too short.
    pub fn from_wire_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < WIRE_LEN {
            return None;
        }
        let generation = u64::from_le_bytes(bytes[..8].try_into().ok()?);
        let key: [u8; 32] = bytes[8..WIRE_LEN].try_into().ok()?;
        Some(Self { key, generation })
    }

    /// Seal this key to one participant.
    pub fn wrap_for(
        &self,
        participant_id: &str,
        participant_public: &X25519Public,
    ) -> Result<WrappedKey, CryptoError> {
        let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519Public::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(participant_public);
        if !shared.was_contributory() {
            return Err(CryptoError::AgreementError(
                "participant key is not a valid X25519 point".into(),
            ));
        }

        let wrap_key = derive_wrap_key(
            shared.as_bytes(),
            &ephemeral_public,
            participant_public,
            participant_id,
            self.generation,
        )?;
        let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key[..])
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), self.key.as_slice())
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        Ok(WrappedKey {
            participant_id: participant_id.to_string(),
            generation: self.generation,
            ephemeral_public: ephemeral_public.as_bytes().to_vec(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Seal this key to every participant, one ciphertext each.
    pub fn wrap_for_participants<'a, I>(&self, participants: I) -> Result<Vec<WrappedKey>, CryptoError>
    where
        I: IntoIterator<Item = (&'a str, &'a X25519Public)>,
    {
        participants
            .into_iter()
            .map(|(id, public)| self.wrap_for(id, public))
            .collect()
    }

    /// Recover a conversation key from a [`WrappedKey`] addressed to us.
    pub fn unwrap(wrapped: &WrappedKey, local_secret: &StaticSecret) -> Result<Self, CryptoError> {
        let ephemeral_public = x25519_public(&wrapped.ephemeral_public)?;
        if wrapped.nonce.len() != 12 {
            return Err(CryptoError::MalformedPayload("wrapped key nonce must be 12 bytes".into()));
        }

        let shared = local_secret.diffie_hellman(&ephemeral_public);
        if !shared.was_contributory() {
            return Err(CryptoError::AgreementError("invalid ephemeral key".into()));
        }

        let local_public = X25519Public::from(local_secret);
        let wrap_key = derive_wrap_key(
            shared.as_bytes(),
            &ephemeral_public,
            &local_public,
            &wrapped.participant_id,
            wrapped.generation,
        )?;
        let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key[..])
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    chacha20poly1305::Nonce::from_slice(&wrapped.nonce),
                    wrapped.ciphertext.as_slice(),
                )
                .map_err(|_| CryptoError::DecryptionError("wrapped key failed authentication".into()))?,
        );

        let key = <[u8; 32]>::try_from(plaintext.as_slice())
            .map_err(|_| CryptoError::MalformedPayload("wrapped key has wrong length".into()))?;
        Ok(Self::from_bytes(key, wrapped.generation))
    }
}

fn derive_wrap_key(
    shared: &[u8; 32],
    ephemeral_public: &X25519Public,
    participant_public: &X25519Public,
    participant_id: &str,
    generation: u64,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut info = Vec::with_capacity(WRAP_KEY_INFO.len() + 72 + participant_id.len());
    info.extend_from_slice(WRAP_KEY_INFO);
    info.extend_from_slice(ephemeral_public.as_bytes());
    info.extend_from_slice(participant_public.as_bytes());
    info.extend_from_slice(&generation.to_le_bytes());
    info.extend_from_slice(participant_id.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut key[..])
        .map_err(|e| CryptoError::AgreementError(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant() -> (StaticSecret, X25519Public) {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret);
        (secret, public)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = ConversationKey::generate(1);
        let plaintext = b"hello from a conversation";

        let encrypted = key.encrypt(plaintext).unwrap();
        let decrypted = key.decrypt(&encrypted).unwrap();

        assert_eq!(plaintext.as_slice(), &decrypted);
    }

    #[test]
    fn wire_bytes_too_short() {
        assert!(ConversationKey::from_wire_bytes(&[0u8; 39]).is_none());
        assert!(ConversationKey::from_wire_bytes(&[]).is_none());
    }

    #[test]
    fn different_keys_fail() {
        let first = ConversationKey::generate(1);
        let second = ConversationKey::generate(2);

        let encrypted = first.encrypt(b"secret message").unwrap();
        assert!(second.decrypt(&encrypted).is_err());
    }

    #[test]
    fn wrapped_key_opens_only_for_its_participant() {
        let (alice_secret, alice_public) = participant();
        let (bob_secret, bob_public) = participant();
        let key = ConversationKey::generate(3);

        let wrapped = key
            .wrap_for_participants([("alice", &alice_public), ("bob", &bob_public)])
            .unwrap();
        assert_eq!(wrapped.len(), 2);

        let for_alice = ConversationKey::unwrap(&wrapped[0], &alice_secret).unwrap();
        assert_eq!(for_alice.as_bytes(), key.as_bytes());
        assert_eq!(for_alice.generation(), 3);

        let for_bob = ConversationKey::unwrap(&wrapped[1], &bob_secret).unwrap();
        assert_eq!(for_bob.as_bytes(), key.as_bytes());

        assert!(ConversationKey::unwrap(&wrapped[0], &bob_secret).is_err());
    }

    #[test]
    fn tampered_wrapped_key_fails() {
        let (secret, public) = participant();
        let key = ConversationKey::generate(1);
        let wrapped = key.wrap_for("alice", &public).unwrap();

        let mut bad_ciphertext = wrapped.clone();
        bad_ciphertext.ciphertext[0] ^= 0x01;
        assert!(matches!(
            ConversationKey::unwrap(&bad_ciphertext, &secret),
            Err(CryptoError::DecryptionError(_))
        ));

        let mut bad_generation = wrapped.clone();
        bad_generation.generation += 1;
        assert!(ConversationKey::unwrap(&bad_generation, &secret).is_err());

        let mut relabelled = wrapped;
        relabelled.participant_id = "mallory".into();
        assert!(ConversationKey::unwrap(&relabelled, &secret).is_err());
    }

    #[test]
    fn rotate_bumps_generation() {
        let key = ConversationKey::generate(7);
        let next = key.rotate();
        assert_eq!(next.generation(), 8);
        assert_ne!(next.as_bytes(), key.as_bytes());

        let restored = ConversationKey::from_wire_bytes(&next.to_wire_bytes()).unwrap();
        assert_eq!(restored.generation(), 8);
    }
}
