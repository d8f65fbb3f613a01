//! Caller authentication for owner-scoped requests.
//!
//! A request carries an [`AuthProof`]: an Ed25519 signature by the caller's
//! identity key over `tessera-auth:<method>:<userId>:<issuedAtMs>`. A proof
//! verified against the key directory yields a [`Caller`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_crypto::signal::PublishedIdentity;
use tessera_crypto::Identity;

use crate::audit::{AuditEvent, AuditLog};
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::error::TrustError;
use crate::store::TrustStore;

pub fn auth_message(method: &str, user_id: &str, issued_at_ms: u64) -> Vec<u8> {
    format!("tessera-auth:{method}:{user_id}:{issued_at_ms}").into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProof {
    pub user_id: String,
    pub issued_at_ms: u64,
    /// Hex-encoded Ed25519 signature.
    pub signature: String,
}

impl AuthProof {
    pub fn sign(identity: &Identity, user_id: &str, method: &str, issued_at_ms: u64) -> Self {
        let signature = identity.sign(&auth_message(method, user_id, issued_at_ms));
        Self {
            user_id: user_id.to_string(),
            issued_at_ms,
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

/// An authenticated user id. Store operations are scoped by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    user_id: String,
}

impl Caller {
    /// Trust a user id established by the host's own authentication layer.
    pub fn assume(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

pub struct Authenticator {
    store: Arc<dyn TrustStore>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    max_skew_ms: u64,
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn TrustStore>,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
        config: &AuthConfig,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            max_skew_ms: config.max_clock_skew_secs.saturating_mul(1000),
        }
    }

    /// Verify `proof` for `method` against the caller's published identity key.
    pub fn authenticate(&self, method: &str, proof: &AuthProof) -> Result<Caller, TrustError> {
        let Some(identity) = self.store.load_identity(&proof.user_id)? else {
            return Err(self.reject(proof, "no identity key registered"));
        };
        self.verify_with_key(method, proof, &identity.public_key)
    }

    /// First publication has no stored key to check against, so the proof is
    /// verified with the identity being published. Later publications must
    /// be signed by the stored key.
    pub fn authenticate_publish(
        &self,
        method: &str,
        proof: &AuthProof,
        published: &PublishedIdentity,
    ) -> Result<Caller, TrustError> {
        if published.user_id != proof.user_id {
            return Err(self.reject(proof, "proof user does not match published identity"));
        }
        match self.store.load_identity(&proof.user_id)? {
            Some(existing) => self.verify_with_key(method, proof, &existing.public_key),
            None => self.verify_with_key(method, proof, &published.public_key),
        }
    }

    fn verify_with_key(
        &self,
        method: &str,
        proof: &AuthProof,
        public_key: &[u8],
    ) -> Result<Caller, TrustError> {
        let now = self.clock.now_ms();
        if now.abs_diff(proof.issued_at_ms) > self.max_skew_ms {
            return Err(self.reject(proof, "proof outside allowed clock skew"));
        }

        let Ok(signature) = hex::decode(&proof.signature) else {
            return Err(self.reject(proof, "signature is not hex"));
        };
        let message = auth_message(method, &proof.user_id, proof.issued_at_ms);
        if Identity::verify_raw(public_key, &message, &signature).is_err() {
            return Err(self.reject(proof, "signature does not verify"));
        }

        Ok(Caller::assume(proof.user_id.clone()))
    }

    fn reject(&self, proof: &AuthProof, reason: &str) -> TrustError {
        self.audit.record(&proof.user_id, AuditEvent::AuthRejected, reason);
        TrustError::Unauthorized(reason.to_string())
    }
}
