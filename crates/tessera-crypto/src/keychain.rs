use std::collections::HashMap;

use parking_lot::Mutex;

use crate::CryptoError;

/// Local key storage, independent of the backing store.
///
/// Private halves of identity and prekey material, and the PIN gate's
/// state, live here and never reach the remote store.
pub trait Keychain: Send + Sync {
    /// Store a key under a vault/key pair.
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// Retrieve a key from a vault/key pair.
    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Delete a key from a vault/key pair.
    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError>;

    /// Check if a key exists.
    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError>;
}

// Vault and key constants used throughout the application.

/// Vault for identity keys.
pub const VAULT_IDENTITY: &str = "identity";
/// Ed25519 signing private key.
pub const KEY_ED25519_PRIVATE: &str = "ed25519_private";
/// Registration id, 4 bytes LE.
pub const KEY_REGISTRATION_ID: &str = "registration_id";
/// User id the identity was registered under (UTF-8).
pub const KEY_USER_ID: &str = "user_id";

/// Vault for prekey material.
pub const VAULT_PREKEYS: &str = "prekeys";
/// Id of the current signed prekey, 4 bytes LE.
pub const KEY_CURRENT_SIGNED_PREKEY: &str = "current_signed_prekey";
/// Next unissued one-time prekey id, 4 bytes LE.
pub const KEY_NEXT_PREKEY_ID: &str = "next_prekey_id";

/// Vault for local access control.
pub const VAULT_LOCAL: &str = "local";
/// Serialized PIN gate state.
pub const KEY_PIN_STATE: &str = "pin_state";

/// Vault for conversation keys.
pub const VAULT_CONVERSATIONS: &str = "conversations";

/// Key name for a signed prekey record.
pub fn signed_prekey_key_name(key_id: u32) -> String {
    format!("signed_prekey_{key_id}")
}

/// Key name for a one-time prekey secret.
pub fn one_time_prekey_key_name(key_id: u32) -> String {
    format!("prekey_{key_id}")
}

/// Key name for a conversation key.
pub fn conversation_key_name(conversation_id: &str) -> String {
    format!("conversation_{conversation_id}")
}

/// In-memory keychain.
///
/// Suitable for tests and for hosts that manage persistence themselves.
/// Data is lost on process exit.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Keychain for MemoryKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .insert((vault.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(&(vault.to_string(), key.to_string()))
            .cloned())
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .remove(&(vault.to_string(), key.to_string()));
        Ok(())
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self
            .entries
            .lock()
            .contains_key(&(vault.to_string(), key.to_string())))
    }
}
