//! Local PIN gate with tiered lockout and inactivity re-lock.
//!
//! Fully local: the only I/O is the [`Keychain`] that persists [`PinState`]
//! after every mutation, so restarting the process cannot clear a block.

use std::sync::Arc;
use std::time::Duration;

use argon2::{Algorithm, Argon2, Params, Version};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tessera_crypto::keychain::{KEY_PIN_STATE, VAULT_LOCAL};
use tessera_crypto::{CryptoError, Keychain};
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditLog};
use crate::clock::{secs_until, Clock};
use crate::config::{PinConfig, PIN_LENGTH};
use crate::error::TrustError;

const HASH_SCHEME: &str = "argon2id";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// App areas that require an unlocked gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectedSurface {
    Conversations,
    Contacts,
    Wallet,
    Settings,
    DeviceManagement,
    KeyBackup,
}

impl ProtectedSurface {
    pub const ALL: [ProtectedSurface; 6] = [
        Self::Conversations,
        Self::Contacts,
        Self::Wallet,
        Self::Settings,
        Self::DeviceManagement,
        Self::KeyBackup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversations => "conversations",
            Self::Contacts => "contacts",
            Self::Wallet => "wallet",
            Self::Settings => "settings",
            Self::DeviceManagement => "device_management",
            Self::KeyBackup => "key_backup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum GateState {
    Unlocked,
    Locked,
    Blocked {
        #[serde(rename = "untilMs")]
        until_ms: u64,
    },
}

/// Persisted gate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PinState {
    /// `argon2id$<salt hex>$<hash hex>`.
    pub pin_hash: Option<String>,
    pub failed_attempts: u32,
    pub blocked_until_ms: Option<u64>,
    pub last_activity_ms: u64,
    pub locked: bool,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            pin_hash: None,
            failed_attempts: 0,
            blocked_until_ms: None,
            last_activity_ms: 0,
            locked: true,
        }
    }
}

/// Re-authentication through the account's primary credential, supplied by
/// the host. Required to reset a forgotten PIN.
pub trait PrimaryCredential: Send + Sync {
    fn reauthenticate(&self) -> Result<(), TrustError>;
}

pub struct PinGate {
    actor: String,
    config: PinConfig,
    tiers_ms: Vec<u64>,
    keychain: Arc<dyn Keychain>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    state: Mutex<PinState>,
}

impl PinGate {
    /// Restore persisted state. The gate always starts locked.
    pub fn open(
        actor: impl Into<String>,
        config: PinConfig,
        keychain: Arc<dyn Keychain>,
        clock: Arc<dyn Clock>,
        audit: AuditLog,
    ) -> Result<Self, TrustError> {
        let mut state = match keychain.load_key(VAULT_LOCAL, KEY_PIN_STATE)? {
            Some(raw) => serde_json::from_slice::<PinState>(&raw)?,
            None => PinState::default(),
        };
        state.locked = true;

        let mut tiers_ms = config.sorted_tiers_ms();
        if tiers_ms.is_empty() {
            tiers_ms.push(PinConfig::default().sorted_tiers_ms()[0]);
        }

        Ok(Self {
            actor: actor.into(),
            config,
            tiers_ms,
            keychain,
            clock,
            audit,
            state: Mutex::new(state),
        })
    }

    pub fn has_pin(&self) -> bool {
        self.state.lock().pin_hash.is_some()
    }

    pub fn state(&self) -> GateState {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        gate_state(&state)
    }

    pub fn failed_attempts(&self) -> u32 {
        self.state.lock().failed_attempts
    }

    pub fn remaining_block_secs(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        state.blocked_until_ms.map_or(0, |until| secs_until(now, until))
    }

    /// Set or change the PIN. Changing an existing PIN requires an unlocked gate.
    pub fn set_pin(&self, pin: &str) -> Result<(), TrustError> {
        validate_pin(pin)?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        if state.pin_hash.is_some() && gate_state(&state) != GateState::Unlocked {
            return Err(TrustError::Unauthorized("unlock before changing the PIN".into()));
        }

        state.pin_hash = Some(hash_pin(pin)?);
        state.failed_attempts = 0;
        state.blocked_until_ms = None;
        state.locked = false;
        state.last_activity_ms = now;
        self.persist(&state)?;
        drop(state);

        self.audit.record(&self.actor, AuditEvent::PinSet, "PIN set");
        Ok(())
    }

    pub fn verify_pin(&self, candidate: &str) -> Result<(), TrustError> {
        validate_pin(candidate)?;
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);

        if let Some(until) = state.blocked_until_ms {
            return Err(TrustError::RateLimited {
                retry_after_secs: secs_until(now, until),
            });
        }
        let Some(stored) = state.pin_hash.clone() else {
            return Err(TrustError::NotFound("no PIN has been set; set one first".into()));
        };

        if verify_hash(candidate, &stored)? {
            state.failed_attempts = 0;
            state.blocked_until_ms = None;
            state.locked = false;
            state.last_activity_ms = now;
            self.persist(&state)?;
            drop(state);
            self.audit.record(&self.actor, AuditEvent::PinUnlocked, "PIN accepted");
            return Ok(());
        }

        state.failed_attempts = state.failed_attempts.saturating_add(1);
        let failed = state.failed_attempts;
        let threshold = self.config.failure_threshold;

        if failed >= threshold {
            let tier = ((failed - threshold) as usize).min(self.tiers_ms.len() - 1);
            let until = now.saturating_add(self.tiers_ms[tier]);
            state.blocked_until_ms = Some(until);
            state.locked = true;
            self.persist(&state)?;
            drop(state);

            let retry_after_secs = secs_until(now, until);
            self.audit.record(
                &self.actor,
                AuditEvent::PinBlocked,
                format!("{failed} consecutive failures, blocked {retry_after_secs}s"),
            );
            return Err(TrustError::RateLimited { retry_after_secs });
        }

        self.persist(&state)?;
        drop(state);
        self.audit
            .record(&self.actor, AuditEvent::PinFailed, format!("failure {failed} of {threshold}"));
        Err(TrustError::IncorrectPin {
            attempts_remaining: threshold - failed,
        })
    }

    /// Clear the PIN and failure state after re-authenticating with the
    /// primary credential.
    pub fn reset_pin(&self, credential: &dyn PrimaryCredential) -> Result<(), TrustError> {
        if let Err(e) = credential.reauthenticate() {
            self.audit
                .record(&self.actor, AuditEvent::PinResetDenied, e.to_string());
            return Err(e);
        }

        let mut state = self.state.lock();
        *state = PinState::default();
        self.persist(&state)?;
        drop(state);

        self.audit.record(&self.actor, AuditEvent::PinReset, "PIN cleared");
        Ok(())
    }

    pub fn lock(&self) -> Result<(), TrustError> {
        let mut state = self.state.lock();
        state.locked = true;
        self.persist(&state)
    }

    /// Record user activity, postponing the inactivity re-lock.
    pub fn touch(&self) -> Result<(), TrustError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        if state.locked {
            return Ok(());
        }
        state.last_activity_ms = now;
        self.persist(&state)
    }

    /// Allow access to `surface` only while unlocked. Unprotected surfaces,
    /// and every surface while no PIN is set, always pass.
    pub fn authorize(&self, surface: ProtectedSurface) -> Result<(), TrustError> {
        if !self.config.protected_surfaces.contains(&surface) {
            return Ok(());
        }

        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        if state.pin_hash.is_none() {
            return Ok(());
        }
        match gate_state(&state) {
            GateState::Unlocked => {
                state.last_activity_ms = now;
                self.persist(&state)
            }
            GateState::Locked | GateState::Blocked { .. } => Err(TrustError::Unauthorized(format!(
                "{} requires the PIN",
                surface.as_str()
            ))),
        }
    }

    /// Resolve once an active block has elapsed, polling on the configured
    /// interval. Returns immediately if the gate is not blocked.
    pub async fn wait_until_unblocked(&self) -> GateState {
        let poll = Duration::from_millis(self.config.unblock_poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let state = self.state();
            if !matches!(state, GateState::Blocked { .. }) {
                return state;
            }
        }
    }

    /// Apply block expiry and inactivity re-lock for `now`.
    fn refresh(&self, state: &mut PinState, now: u64) {
        if state.blocked_until_ms.is_some_and(|until| now >= until) {
            state.blocked_until_ms = None;
        }
        let timeout_ms = self.config.inactivity_timeout_secs.saturating_mul(1000);
        if !state.locked && now.saturating_sub(state.last_activity_ms) >= timeout_ms {
            tracing::debug!(actor = %self.actor, "inactivity timeout, re-locking");
            state.locked = true;
        }
    }

    fn persist(&self, state: &PinState) -> Result<(), TrustError> {
        let raw = serde_json::to_vec(state)?;
        self.keychain.store_key(VAULT_LOCAL, KEY_PIN_STATE, &raw)?;
        Ok(())
    }
}

fn gate_state(state: &PinState) -> GateState {
    match state.blocked_until_ms {
        Some(until_ms) => GateState::Blocked { until_ms },
        None if state.pin_hash.is_none() || !state.locked => GateState::Unlocked,
        None => GateState::Locked,
    }
}

fn validate_pin(pin: &str) -> Result<(), TrustError> {
    if pin.len() == PIN_LENGTH && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(TrustError::Validation(format!("PIN must be exactly {PIN_LENGTH} digits")))
    }
}

/// `Argon2id`, light parameters in debug builds.
fn derive(pin: &str, salt: &[u8]) -> Result<Zeroizing<[u8; HASH_LEN]>, TrustError> {
    #[cfg(debug_assertions)]
    let params = Params::new(256, 1, 1, Some(HASH_LEN));
    #[cfg(not(debug_assertions))]
    let params = Params::new(65536, 3, 4, Some(HASH_LEN));
    let params = params.map_err(|e| CryptoError::KeyGeneration(format!("argon2 params: {e}")))?;

    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new([0u8; HASH_LEN]);
    hasher
        .hash_password_into(pin.as_bytes(), salt, &mut out[..])
        .map_err(|e| CryptoError::KeyGeneration(format!("argon2: {e}")))?;
    Ok(out)
}

fn hash_pin(pin: &str) -> Result<String, TrustError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let hash = derive(pin, &salt)?;
    Ok(format!("{HASH_SCHEME}${}${}", hex::encode(salt), hex::encode(&hash[..])))
}

fn verify_hash(candidate: &str, stored: &str) -> Result<bool, TrustError> {
    let mut parts = stored.split('$');
    let (Some(HASH_SCHEME), Some(salt_hex), Some(hash_hex), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CryptoError::StorageError("unrecognized PIN hash format".into()).into());
    };
    let salt = hex::decode(salt_hex)
        .map_err(|e| CryptoError::StorageError(format!("PIN salt: {e}")))?;
    let expected = hex::decode(hash_hex)
        .map_err(|e| CryptoError::StorageError(format!("PIN hash: {e}")))?;

    let actual = derive(candidate, &salt)?;
    Ok(constant_time_eq(&actual[..], &expected))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
