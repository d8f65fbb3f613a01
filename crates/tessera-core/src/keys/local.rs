use std::sync::Arc;

use tessera_crypto::keychain::{
    conversation_key_name, one_time_prekey_key_name, signed_prekey_key_name,
    KEY_CURRENT_SIGNED_PREKEY, KEY_ED25519_PRIVATE, KEY_NEXT_PREKEY_ID, KEY_REGISTRATION_ID,
    KEY_USER_ID, VAULT_CONVERSATIONS, VAULT_IDENTITY, VAULT_PREKEYS,
};
use tessera_crypto::signal::{
    generate_identity, generate_prekeys, generate_signed_prekey, seal_for_bundle,
    AgreementKeyRef, IdentityKeyPair, InitialMessage, PreKeyBundle, PublishedOneTimePreKey,
    PublishedSignedPreKey, SignedPreKey,
};
use tessera_crypto::{ConversationKey, CryptoError, Identity, Keychain, WrappedKey};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use super::PublishRequest;
use crate::auth::AuthProof;
use crate::clock::Clock;
use crate::config::KeyConfig;
use crate::error::TrustError;
use crate::store::PreKeyStats;

/// Device id published alongside the identity key.
const PRIMARY_DEVICE_ID: u32 = 1;
const FIRST_SIGNED_PREKEY_ID: u32 = 1;
const FIRST_ONE_TIME_PREKEY_ID: u32 = 1;
/// secret (32) + created_at (8 LE) + signature (64)
const SIGNED_PREKEY_RECORD_LEN: usize = 104;

/// Owns this device's private key material in the [`Keychain`].
pub struct KeyManager {
    identity: IdentityKeyPair,
    keychain: Arc<dyn Keychain>,
    clock: Arc<dyn Clock>,
    config: KeyConfig,
}

impl KeyManager {
    /// Create a fresh identity, signed prekey and one-time prekey pool.
    ///
    /// Returns the manager and the public material to publish.
    pub fn register(
        user_id: &str,
        keychain: Arc<dyn Keychain>,
        clock: Arc<dyn Clock>,
        config: KeyConfig,
    ) -> Result<(Self, PublishRequest), TrustError> {
        Self::register_with_prekeys(
            user_id,
            FIRST_ONE_TIME_PREKEY_ID,
            keychain,
            clock,
            config,
        )
    }

    /// [`register`](Self::register) with one-time prekey ids starting at `first_prekey_id`.
    pub fn register_with_prekeys(
        user_id: &str,
        first_prekey_id: u32,
        keychain: Arc<dyn Keychain>,
        clock: Arc<dyn Clock>,
        config: KeyConfig,
    ) -> Result<(Self, PublishRequest), TrustError> {
        if user_id.is_empty() {
            return Err(TrustError::Validation("user id must not be empty".into()));
        }
        if keychain.key_exists(VAULT_IDENTITY, KEY_ED25519_PRIVATE)? {
            return Err(TrustError::Validation(
                "an identity is already registered on this device".into(),
            ));
        }

        let identity = generate_identity(user_id)?;
        keychain.store_key(VAULT_IDENTITY, KEY_ED25519_PRIVATE, identity.identity().secret_key_bytes())?;
        keychain.store_key(
            VAULT_IDENTITY,
            KEY_REGISTRATION_ID,
            &identity.registration_id.to_le_bytes(),
        )?;
        keychain.store_key(VAULT_IDENTITY, KEY_USER_ID, user_id.as_bytes())?;
        keychain.store_key(VAULT_PREKEYS, KEY_NEXT_PREKEY_ID, &first_prekey_id.to_le_bytes())?;

        let manager = Self {
            identity,
            keychain,
            clock,
            config,
        };
        let signed = manager.install_signed_prekey(FIRST_SIGNED_PREKEY_ID)?;
        let one_time_prekeys = manager.issue_one_time_prekeys(config.one_time_prekey_pool_size)?;

        tracing::info!(
            user = %user_id,
            registration_id = manager.identity.registration_id,
            prekeys = one_time_prekeys.len(),
            "registered new identity"
        );

        let request = PublishRequest {
            identity: manager.identity.published(PRIMARY_DEVICE_ID),
            signed_prekey: signed,
            one_time_prekeys,
        };
        Ok((manager, request))
    }

    /// Restore the identity registered for `user_id`.
    pub fn load(
        user_id: &str,
        keychain: Arc<dyn Keychain>,
        clock: Arc<dyn Clock>,
        config: KeyConfig,
    ) -> Result<Self, TrustError> {
        let missing = || TrustError::NotFound(format!("no identity for {user_id} on this device; register first"));

        let stored_user = keychain
            .load_key(VAULT_IDENTITY, KEY_USER_ID)?
            .ok_or_else(missing)?;
        if stored_user != user_id.as_bytes() {
            return Err(missing());
        }
        let secret = Zeroizing::new(
            keychain
                .load_key(VAULT_IDENTITY, KEY_ED25519_PRIVATE)?
                .ok_or_else(missing)?,
        );
        let registration_id = read_u32(&*keychain, VAULT_IDENTITY, KEY_REGISTRATION_ID)?
            .ok_or_else(missing)?;

        let identity = IdentityKeyPair::from_parts(
            user_id,
            Identity::from_secret_slice(&secret)?,
            registration_id,
        );
        Ok(Self {
            identity,
            keychain,
            clock,
            config,
        })
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Sign a request proof for `method` at the current time.
    pub fn auth_proof(&self, method: &str) -> AuthProof {
        AuthProof::sign(
            self.identity.identity(),
            &self.identity.user_id,
            method,
            self.clock.now_ms(),
        )
    }

    /// Identity and current signed prekey, plus `one_time_prekeys`.
    pub fn publish_request(
        &self,
        one_time_prekeys: Vec<PublishedOneTimePreKey>,
    ) -> Result<PublishRequest, TrustError> {
        Ok(PublishRequest {
            identity: self.identity.published(PRIMARY_DEVICE_ID),
            signed_prekey: self.current_signed_prekey()?.published(),
            one_time_prekeys,
        })
    }

    pub fn current_signed_prekey(&self) -> Result<SignedPreKey, TrustError> {
        let key_id = read_u32(&*self.keychain, VAULT_PREKEYS, KEY_CURRENT_SIGNED_PREKEY)?
            .ok_or_else(|| TrustError::NotFound("no signed prekey; register first".into()))?;
        self.load_signed_prekey(key_id)
    }

    pub fn signed_prekey_due(&self) -> Result<bool, TrustError> {
        let current = self.current_signed_prekey()?;
        let max_age_ms = self.config.signed_prekey_max_age_secs.saturating_mul(1000);
        Ok(self.clock.now_ms().saturating_sub(current.created_at_ms) >= max_age_ms)
    }

    /// Generate the next signed prekey and make it current. The previous one
    /// stays in the keychain for messages already in flight.
    pub fn rotate_signed_prekey(&self) -> Result<PublishedSignedPreKey, TrustError> {
        let current = self.current_signed_prekey()?;
        let next_id = current.key_id.wrapping_add(1).max(1);
        let published = self.install_signed_prekey(next_id)?;
        tracing::info!(user = %self.identity.user_id, key_id = next_id, "rotated signed prekey");
        Ok(published)
    }

    /// Top the one-time pool back up to the target size.
    ///
    /// Empty when at least `replenish_below` unused keys remain on the server.
    pub fn replenish(&self, stats: &PreKeyStats) -> Result<Vec<PublishedOneTimePreKey>, TrustError> {
        if stats.unused >= self.config.replenish_below {
            return Ok(Vec::new());
        }
        if let Some(highest) = stats.highest_key_id {
            let next = read_u32(&*self.keychain, VAULT_PREKEYS, KEY_NEXT_PREKEY_ID)?.unwrap_or(0);
            if highest >= next {
                self.keychain.store_key(
                    VAULT_PREKEYS,
                    KEY_NEXT_PREKEY_ID,
                    &highest.wrapping_add(1).to_le_bytes(),
                )?;
            }
        }
        let count = self.config.one_time_prekey_pool_size.saturating_sub(stats.unused);
        let issued = self.issue_one_time_prekeys(count)?;
        tracing::info!(user = %self.identity.user_id, count = issued.len(), "replenished one-time prekeys");
        Ok(issued)
    }

    /// Verify `bundle` and pick the key to agree against.
    pub fn verify_bundle(
        bundle: &PreKeyBundle,
    ) -> Result<(AgreementKeyRef, X25519Public), TrustError> {
        Ok(bundle.agreement_key()?)
    }

    /// Encrypt a first message to the owner of `bundle`.
    pub fn seal_for(&self, bundle: &PreKeyBundle, plaintext: &[u8]) -> Result<InitialMessage, TrustError> {
        Ok(seal_for_bundle(self.identity.identity(), bundle, plaintext)?)
    }

    /// Private half of the prekey named by `key_ref`. One-time halves are
    /// removed from the keychain once resolved.
    pub fn agreement_secret(&self, key_ref: AgreementKeyRef) -> Result<StaticSecret, TrustError> {
        let secret = self.resolve_secret(key_ref)?;
        if let AgreementKeyRef::OneTime(key_id) = key_ref {
            self.consume_one_time_prekey(key_id)?;
        }
        Ok(secret)
    }

    /// Decrypt a first message addressed to one of our prekeys.
    ///
    /// The one-time prekey is consumed only after successful decryption, so a
    /// corrupted message does not burn it.
    pub fn open_initial(&self, message: &InitialMessage) -> Result<Vec<u8>, TrustError> {
        let secret = self.resolve_secret(message.key_ref)?;
        let plaintext = message.open(&secret)?;
        if let AgreementKeyRef::OneTime(key_id) = message.key_ref {
            self.consume_one_time_prekey(key_id)?;
        }
        Ok(plaintext)
    }

    pub fn store_conversation_key(
        &self,
        conversation_id: &str,
        key: &ConversationKey,
    ) -> Result<(), TrustError> {
        let bytes = Zeroizing::new(key.to_wire_bytes());
        self.keychain
            .store_key(VAULT_CONVERSATIONS, &conversation_key_name(conversation_id), &bytes)?;
        Ok(())
    }

    pub fn load_conversation_key(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationKey>, TrustError> {
        let Some(raw) = self
            .keychain
            .load_key(VAULT_CONVERSATIONS, &conversation_key_name(conversation_id))?
        else {
            return Ok(None);
        };
        let raw = Zeroizing::new(raw);
        ConversationKey::from_wire_bytes(&raw)
            .map(Some)
            .ok_or_else(|| CryptoError::StorageError("conversation key record truncated".into()).into())
    }

    /// Unwrap a conversation key addressed to this identity and keep it.
    pub fn accept_conversation_key(
        &self,
        conversation_id: &str,
        wrapped: &WrappedKey,
    ) -> Result<ConversationKey, TrustError> {
        let secret = self.identity.identity().to_x25519_secret();
        let key = ConversationKey::unwrap(wrapped, &secret)?;
        self.store_conversation_key(conversation_id, &key)?;
        Ok(key)
    }

    fn resolve_secret(&self, key_ref: AgreementKeyRef) -> Result<StaticSecret, TrustError> {
        match key_ref {
            AgreementKeyRef::Signed(key_id) => Ok(self.load_signed_prekey(key_id)?.secret().clone()),
            AgreementKeyRef::OneTime(key_id) => {
                let raw = self
                    .keychain
                    .load_key(VAULT_PREKEYS, &one_time_prekey_key_name(key_id))?
                    .ok_or_else(|| {
                        TrustError::NotFound(format!("one-time prekey {key_id} already used or unknown"))
                    })?;
                let raw = Zeroizing::new(raw);
                let bytes = <[u8; 32]>::try_from(raw.as_slice()).map_err(|_| {
                    CryptoError::StorageError(format!("one-time prekey {key_id} has wrong length"))
                })?;
                Ok(StaticSecret::from(bytes))
            }
        }
    }

    fn consume_one_time_prekey(&self, key_id: u32) -> Result<(), TrustError> {
        self.keychain
            .delete_key(VAULT_PREKEYS, &one_time_prekey_key_name(key_id))?;
        tracing::debug!(key_id, "consumed one-time prekey");
        Ok(())
    }

    fn install_signed_prekey(&self, key_id: u32) -> Result<PublishedSignedPreKey, TrustError> {
        let signed = generate_signed_prekey(&self.identity, key_id, self.clock.now_ms());

        let mut record = Zeroizing::new(Vec::with_capacity(SIGNED_PREKEY_RECORD_LEN));
        record.extend_from_slice(&signed.secret().to_bytes());
        record.extend_from_slice(&signed.created_at_ms.to_le_bytes());
        record.extend_from_slice(&signed.signature);
        self.keychain
            .store_key(VAULT_PREKEYS, &signed_prekey_key_name(key_id), &record)?;
        self.keychain
            .store_key(VAULT_PREKEYS, KEY_CURRENT_SIGNED_PREKEY, &key_id.to_le_bytes())?;
        Ok(signed.published())
    }

    fn load_signed_prekey(&self, key_id: u32) -> Result<SignedPreKey, TrustError> {
        let raw = self
            .keychain
            .load_key(VAULT_PREKEYS, &signed_prekey_key_name(key_id))?
            .ok_or_else(|| TrustError::NotFound(format!("signed prekey {key_id} not on this device")))?;
        let raw = Zeroizing::new(raw);
        if raw.len() != SIGNED_PREKEY_RECORD_LEN {
            return Err(CryptoError::StorageError(format!("signed prekey {key_id} record corrupt")).into());
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&raw[..32]);
        let mut created = [0u8; 8];
        created.copy_from_slice(&raw[32..40]);
        Ok(SignedPreKey::restore(
            self.identity.user_id.clone(),
            key_id,
            secret,
            raw[40..].to_vec(),
            u64::from_le_bytes(created),
        ))
    }

    fn issue_one_time_prekeys(&self, count: u32) -> Result<Vec<PublishedOneTimePreKey>, TrustError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let start = read_u32(&*self.keychain, VAULT_PREKEYS, KEY_NEXT_PREKEY_ID)?
            .unwrap_or(FIRST_ONE_TIME_PREKEY_ID);
        let prekeys = generate_prekeys(&self.identity.user_id, start, count);
        for prekey in &prekeys {
            let secret = Zeroizing::new(prekey.secret().to_bytes());
            self.keychain.store_key(
                VAULT_PREKEYS,
                &one_time_prekey_key_name(prekey.key_id),
                &secret[..],
            )?;
        }
        self.keychain.store_key(
            VAULT_PREKEYS,
            KEY_NEXT_PREKEY_ID,
            &start.wrapping_add(count).to_le_bytes(),
        )?;
        Ok(prekeys.iter().map(|k| k.published()).collect())
    }
}

fn read_u32(keychain: &dyn Keychain, vault: &str, key: &str) -> Result<Option<u32>, TrustError> {
    let Some(raw) = keychain.load_key(vault, key)? else {
        return Ok(None);
    };
    let bytes = <[u8; 4]>::try_from(raw.as_slice())
        .map_err(|_| CryptoError::StorageError(format!("{vault}/{key} is not a u32")))?;
    Ok(Some(u32::from_le_bytes(bytes)))
}
