use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_crypto::signal::{
    PreKeyBundle, PublishedIdentity, PublishedOneTimePreKey, PublishedSignedPreKey,
};

use crate::audit::{AuditEvent, AuditLog};
use crate::auth::Caller;
use crate::error::TrustError;
use crate::store::{PreKeyStats, TrustStore};

const PUBLIC_KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;

/// Public key material a device uploads to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub identity: PublishedIdentity,
    pub signed_prekey: PublishedSignedPreKey,
    #[serde(default)]
    pub one_time_prekeys: Vec<PublishedOneTimePreKey>,
}

/// Serves prekey bundles out of a [`TrustStore`].
pub struct KeyDirectory {
    store: Arc<dyn TrustStore>,
    audit: AuditLog,
}

impl KeyDirectory {
    pub fn new(store: Arc<dyn TrustStore>, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Upsert the caller's identity, signed prekey and one-time prekeys.
    pub fn publish_keys(&self, caller: &Caller, request: &PublishRequest) -> Result<(), TrustError> {
        let user_id = caller.user_id();
        let owned_by_caller = request.identity.user_id == user_id
            && request.signed_prekey.user_id == user_id
            && request.one_time_prekeys.iter().all(|k| k.user_id == user_id);
        if !owned_by_caller {
            self.audit
                .record(user_id, AuditEvent::KeyPublishDenied, "key material for another user");
            return Err(TrustError::Unauthorized(
                "callers may only publish their own keys".into(),
            ));
        }

        check_len("identity key", &request.identity.public_key, PUBLIC_KEY_LEN)?;
        check_len("signed prekey", &request.signed_prekey.public_key, PUBLIC_KEY_LEN)?;
        check_len("signed prekey signature", &request.signed_prekey.signature, SIGNATURE_LEN)?;
        for prekey in &request.one_time_prekeys {
            check_len("one-time prekey", &prekey.public_key, PUBLIC_KEY_LEN)?;
        }
        if request
            .signed_prekey
            .verify(&request.identity.public_key)
            .is_err()
        {
            return Err(TrustError::Validation(
                "signed prekey signature does not verify under the identity key".into(),
            ));
        }

        self.store.upsert_identity(&request.identity)?;
        self.store.upsert_signed_prekey(&request.signed_prekey)?;
        if !request.one_time_prekeys.is_empty() {
            self.store.upsert_one_time_prekeys(&request.one_time_prekeys)?;
        }

        self.audit.record(
            user_id,
            AuditEvent::KeysPublished,
            format!(
                "signed prekey {}, {} one-time prekeys",
                request.signed_prekey.key_id,
                request.one_time_prekeys.len()
            ),
        );
        Ok(())
    }

    /// Bundle for starting a session with `target_user_id`.
    ///
    /// Claims at most one one-time prekey. `None` if the target has no
    /// identity or signed prekey.
    pub fn fetch_bundle(&self, target_user_id: &str) -> Result<Option<PreKeyBundle>, TrustError> {
        let Some(identity) = self.store.load_identity(target_user_id)? else {
            return Ok(None);
        };
        let Some(signed) = self.store.latest_signed_prekey(target_user_id)? else {
            return Ok(None);
        };

        let one_time = self.store.claim_one_time_prekey(target_user_id)?;
        if one_time.is_none() {
            tracing::warn!(user = %target_user_id, "one-time prekey pool exhausted, serving signed prekey only");
            self.audit.record(
                target_user_id,
                AuditEvent::PreKeysExhausted,
                "bundle served without a one-time prekey",
            );
        }

        let (one_time_prekey_id, one_time_prekey) = match one_time {
            Some(key) => (Some(key.key_id), Some(key.public_key)),
            None => (None, None),
        };

        Ok(Some(PreKeyBundle {
            registration_id: identity.registration_id,
            device_id: identity.device_id,
            identity_key: identity.public_key,
            signed_prekey_id: signed.key_id,
            signed_prekey: signed.public_key,
            signature: signed.signature,
            one_time_prekey_id,
            one_time_prekey,
        }))
    }

    pub fn prekey_status(&self, caller: &Caller) -> Result<PreKeyStats, TrustError> {
        Ok(self.store.prekey_stats(caller.user_id())?)
    }

    /// User ids matching `prefix`. The prefix must be non-empty.
    pub fn search_users(&self, prefix: &str, limit: usize) -> Result<Vec<String>, TrustError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(TrustError::Validation("search prefix must not be empty".into()));
        }
        Ok(self.store.search_users(prefix, limit)?)
    }
}

fn check_len(what: &str, bytes: &[u8], expected: usize) -> Result<(), TrustError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(TrustError::Validation(format!(
            "{what} must be {expected} bytes, got {}",
            bytes.len()
        )))
    }
}
