//! Out-of-band device linking.
//!
//! The new device issues a request and shows its code and challenge; an
//! already-trusted device of the same user signs the challenge with its
//! identity key; [`DeviceLinkService::submit`] verifies the signature and
//! registers the new device exactly once.

use std::sync::Arc;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_crypto::identity::verifying_key_from_slice;
use tessera_crypto::Identity;

use crate::audit::{AuditEvent, AuditLog};
use crate::clock::Clock;
use crate::config::DeviceLinkConfig;
use crate::error::TrustError;
use crate::rate_limit::{RateLimitedAction, RateLimiters};
use crate::store::{DeviceInsert, DeviceRecord, ScopedTable, TrustStore};

const DEVICE_ID_DOMAIN: &[u8] = b"tessera-device-id";

/// What the new device displays to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkChallenge {
    pub request_id: String,
    pub device_code: String,
    pub challenge: String,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSubmission {
    pub request_id: String,
    #[serde(default)]
    pub device_code: Option<String>,
    /// Hex Ed25519 signature over the challenge string.
    pub signature: String,
    pub authorizing_user_id: String,
    /// Hex Ed25519 public key of the new device.
    pub new_device_public_key: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedDevice {
    pub device_id: String,
}

/// Sign `challenge` on the authorizing device. Returns hex.
pub fn sign_challenge(identity: &Identity, challenge: &str) -> String {
    hex::encode(identity.sign(challenge.as_bytes()).to_bytes())
}

/// Stable id for the device linked by `request_id` with `device_public_key`.
pub fn derive_device_id(request_id: &str, device_public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DEVICE_ID_DOMAIN);
    hasher.update((request_id.len() as u64).to_le_bytes());
    hasher.update(request_id.as_bytes());
    hasher.update(device_public_key);
    hex::encode(&hasher.finalize()[..16])
}

pub struct DeviceLinkService {
    store: Arc<dyn TrustStore>,
    limiters: Arc<RateLimiters>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl DeviceLinkService {
    pub fn new(
        store: Arc<dyn TrustStore>,
        limiters: Arc<RateLimiters>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        config: &DeviceLinkConfig,
    ) -> Self {
        Self {
            store,
            limiters,
            audit,
            clock,
            ttl_ms: config.request_ttl_secs.saturating_mul(1000),
        }
    }

    pub fn issue_request(&self) -> Result<LinkChallenge, TrustError> {
        let mut rng = rand::rngs::OsRng;
        let mut request_id = [0u8; 16];
        rng.fill_bytes(&mut request_id);
        let mut challenge = [0u8; 32];
        rng.fill_bytes(&mut challenge);

        let now = self.clock.now_ms();
        let issued = LinkChallenge {
            request_id: hex::encode(request_id),
            device_code: format!("{:06}", rng.gen_range(0..1_000_000u32)),
            challenge: hex::encode(challenge),
            expires_at_ms: now.saturating_add(self.ttl_ms),
        };

        self.store.insert_link_request(&crate::store::DeviceLinkRequest {
            request_id: issued.request_id.clone(),
            device_code: issued.device_code.clone(),
            challenge: issued.challenge.clone(),
            expires_at_ms: issued.expires_at_ms,
            completed: false,
            created_at_ms: now,
        })?;

        self.audit.record(
            &issued.request_id,
            AuditEvent::LinkRequestIssued,
            format!("expires at {}", issued.expires_at_ms),
        );
        Ok(issued)
    }

    /// Verify a signed challenge and register the new device.
    pub fn submit(&self, submission: &LinkSubmission) -> Result<LinkedDevice, TrustError> {
        let actor = submission.authorizing_user_id.as_str();
        self.limiters.check(RateLimitedAction::DeviceLink, actor)?;
        let (device_key, signature) = validate_fields(submission)?;

        let now = self.clock.now_ms();
        let request = self
            .store
            .pending_link_request(&submission.request_id)?
            .filter(|request| {
                submission
                    .device_code
                    .as_deref()
                    .map_or(true, |code| code == request.device_code)
            });
        let Some(request) = request else {
            self.audit.record(
                actor,
                AuditEvent::LinkRequestNotFound,
                format!("request {}", submission.request_id),
            );
            return Err(TrustError::LinkRequestNotFound);
        };
        if now >= request.expires_at_ms {
            self.audit.record(
                actor,
                AuditEvent::LinkRequestExpired,
                format!("request {}", request.request_id),
            );
            return Err(TrustError::LinkRequestExpired);
        }

        let Some(identity) = self.store.load_identity(actor)? else {
            self.audit
                .record(actor, AuditEvent::LinkUserNotFound, "no registered identity key");
            return Err(TrustError::UserNotFound(actor.to_string()));
        };

        if Identity::verify_raw(&identity.public_key, request.challenge.as_bytes(), &signature)
            .is_err()
        {
            self.audit.record(
                actor,
                AuditEvent::LinkSignatureInvalid,
                format!("request {}", request.request_id),
            );
            return Err(TrustError::InvalidSignature);
        }

        let device_id = derive_device_id(&request.request_id, &device_key);
        let inserted = self.store.insert_device(&DeviceRecord {
            device_id: device_id.clone(),
            user_id: actor.to_string(),
            device_name: submission.device_name.clone(),
            public_key: device_key,
            linked_at_ms: now,
        })?;
        if inserted == DeviceInsert::AlreadyPresent {
            tracing::debug!(device = %device_id, "device already present, completing retried link");
        }

        if !self
            .store
            .complete_link_request(&request.request_id, &device_id)?
        {
            // Another device won the completion race; undo our insert.
            if inserted == DeviceInsert::Inserted {
                if let Err(e) =
                    self.store
                        .delete_scoped(ScopedTable::Devices, actor, &device_id)
                {
                    tracing::warn!(
                        device = %device_id,
                        error = %e,
                        "failed to roll back losing device insert"
                    );
                }
            }
            self.audit.record(
                actor,
                AuditEvent::LinkRequestNotFound,
                format!("request {} completed by another device", request.request_id),
            );
            return Err(TrustError::LinkRequestNotFound);
        }

        self.audit.record(
            actor,
            AuditEvent::DeviceLinked,
            format!("device {device_id} via request {}", request.request_id),
        );
        Ok(LinkedDevice { device_id })
    }
}

/// Required fields present and well-formed. Returns the decoded device key
/// and signature.
fn validate_fields(submission: &LinkSubmission) -> Result<(Vec<u8>, Vec<u8>), TrustError> {
    for (name, value) in [
        ("requestId", &submission.request_id),
        ("signature", &submission.signature),
        ("authorizingUserId", &submission.authorizing_user_id),
        ("newDevicePublicKey", &submission.new_device_public_key),
    ] {
        if value.trim().is_empty() {
            return Err(TrustError::Validation(format!("{name} is required")));
        }
    }

    let device_key = hex::decode(&submission.new_device_public_key)
        .map_err(|_| TrustError::Validation("newDevicePublicKey must be hex".into()))?;
    verifying_key_from_slice(&device_key).map_err(|e| {
        TrustError::Validation(format!("newDevicePublicKey is not an Ed25519 key: {e}"))
    })?;

    let signature = hex::decode(&submission.signature)
        .map_err(|_| TrustError::Validation("signature must be hex".into()))?;
    if signature.len() != 64 {
        return Err(TrustError::Validation("signature must be 64 bytes".into()));
    }
    Ok((device_key, signature))
}
