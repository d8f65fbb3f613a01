//! Row store contract for the trust core.
//!
//! Every mutation is a single statement (per-row upsert, conditional update,
//! or filtered delete); callers scope each call by an authenticated user id.

mod sqlite;

pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};
use tessera_crypto::signal::{PublishedIdentity, PublishedOneTimePreKey, PublishedSignedPreKey};
use thiserror::Error;

use crate::audit::AuditEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to open store: {0}")]
    Open(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Unused one-time prekey count and the highest id ever published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyStats {
    pub unused: u32,
    pub highest_key_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLinkRequest {
    pub request_id: String,
    pub device_code: String,
    pub challenge: String,
    pub expires_at_ms: u64,
    pub completed: bool,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub user_id: String,
    pub device_name: Option<String>,
    /// Ed25519 public key of the linked device.
    pub public_key: Vec<u8>,
    pub linked_at_ms: u64,
}

/// Outcome of inserting a device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceInsert {
    Inserted,
    /// Same device id already bound to the same user.
    AlreadyPresent,
}

/// Per-device tables purged by a wipe, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopedTable {
    Messages,
    Conversations,
    Sessions,
    DeviceLocations,
    Devices,
}

impl ScopedTable {
    pub const WIPE_ORDER: [ScopedTable; 5] = [
        Self::Messages,
        Self::Conversations,
        Self::Sessions,
        Self::DeviceLocations,
        Self::Devices,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Conversations => "conversations",
            Self::Sessions => "sessions",
            Self::DeviceLocations => "device_locations",
            Self::Devices => "devices",
        }
    }
}

pub trait TrustStore: Send + Sync {
    fn upsert_identity(&self, identity: &PublishedIdentity) -> Result<(), StoreError>;
    fn load_identity(&self, user_id: &str) -> Result<Option<PublishedIdentity>, StoreError>;
    /// User ids starting with `prefix`, ascending, at most `limit`.
    fn search_users(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    fn upsert_signed_prekey(&self, prekey: &PublishedSignedPreKey) -> Result<(), StoreError>;
    /// Most recently created signed prekey.
    fn latest_signed_prekey(&self, user_id: &str)
        -> Result<Option<PublishedSignedPreKey>, StoreError>;

    /// Insert one-time prekeys. Existing rows keep their `used` flag.
    fn upsert_one_time_prekeys(&self, prekeys: &[PublishedOneTimePreKey]) -> Result<(), StoreError>;
    /// Flip the lowest unused one-time prekey to used and return it, in one
    /// conditional statement. `None` when the pool is exhausted.
    fn claim_one_time_prekey(&self, user_id: &str)
        -> Result<Option<PublishedOneTimePreKey>, StoreError>;
    fn prekey_stats(&self, user_id: &str) -> Result<PreKeyStats, StoreError>;

    fn insert_link_request(&self, request: &DeviceLinkRequest) -> Result<(), StoreError>;
    /// An uncompleted request with this id, expired or not.
    fn pending_link_request(&self, request_id: &str)
        -> Result<Option<DeviceLinkRequest>, StoreError>;
    /// Mark completed by `device_id` if still pending. Returns true when
    /// this device completed it, now or on an earlier attempt; false when a
    /// different device already did.
    fn complete_link_request(&self, request_id: &str, device_id: &str)
        -> Result<bool, StoreError>;

    fn insert_device(&self, device: &DeviceRecord) -> Result<DeviceInsert, StoreError>;
    fn load_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;
    fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceRecord>, StoreError>;

    /// Delete rows of `table` owned by `user_id` and scoped to `device_id`.
    fn delete_scoped(&self, table: ScopedTable, user_id: &str, device_id: &str)
        -> Result<usize, StoreError>;

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
    /// Most recent `limit` audit rows, oldest first.
    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError>;
}
