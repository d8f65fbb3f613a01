//! Best-effort purge of one device's data on revocation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditLog};
use crate::auth::Caller;
use crate::error::TrustError;
use crate::store::{ScopedTable, TrustStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WipeReport {
    pub device_id: String,
    pub success: bool,
    pub rows_deleted: usize,
    pub failed_steps: Vec<ScopedTable>,
}

pub struct DeviceWipeCoordinator {
    store: Arc<dyn TrustStore>,
    audit: AuditLog,
}

impl DeviceWipeCoordinator {
    pub fn new(store: Arc<dyn TrustStore>, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Delete messages, conversations, sessions, location records and finally
    /// the device record of `device_id`. Only the owning user may wipe.
    ///
    /// A failing step is logged and reported but does not stop later steps.
    pub fn wipe_device(&self, caller: &Caller, device_id: &str) -> Result<WipeReport, TrustError> {
        let user_id = caller.user_id();
        let Some(device) = self.store.load_device(device_id)? else {
            return Err(TrustError::NotFound(format!("device {device_id} is not linked")));
        };
        if device.user_id != user_id {
            self.audit.record(
                user_id,
                AuditEvent::WipeDenied,
                format!("device {device_id} belongs to another user"),
            );
            return Err(TrustError::Unauthorized("only the owner may wipe a device".into()));
        }

        let mut rows_deleted = 0;
        let mut failed_steps = Vec::new();
        for step in ScopedTable::WIPE_ORDER {
            match self.store.delete_scoped(step, user_id, device_id) {
                Ok(rows) => {
                    tracing::debug!(device = %device_id, table = step.table_name(), rows, "wipe step done");
                    rows_deleted += rows;
                }
                Err(e) => {
                    tracing::warn!(
                        device = %device_id,
                        table = step.table_name(),
                        error = %e,
                        "wipe step failed, continuing"
                    );
                    failed_steps.push(step);
                }
            }
        }

        let success = failed_steps.is_empty();
        let detail = if success {
            format!("device {device_id}: {rows_deleted} rows removed")
        } else {
            let failed: Vec<&str> = failed_steps.iter().map(|s| s.table_name()).collect();
            format!(
                "device {device_id}: {rows_deleted} rows removed, failed: {}",
                failed.join(", ")
            )
        };
        self.audit.record(user_id, AuditEvent::DeviceWiped, detail);

        Ok(WipeReport {
            device_id: device_id.to_string(),
            success,
            rows_deleted,
            failed_steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{DeviceRecord, SqliteStore};

    fn seed(store: &SqliteStore, user: &str, device: &str) {
        store
            .insert_device(&DeviceRecord {
                device_id: device.into(),
                user_id: user.into(),
                device_name: None,
                public_key: vec![9; 32],
                linked_at_ms: 0,
            })
            .unwrap();
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO messages (conversation_id, owner_user_id, device_id, ciphertext, sent_at)
                     VALUES ('c1', ?1, ?2, x'00', 0)",
                    [user, device],
                )?;
                conn.execute(
                    "INSERT INTO sessions (owner_user_id, device_id, peer_user_id, session_data, updated_at)
                     VALUES (?1, ?2, 'peer', x'00', 0)",
                    [user, device],
                )
            })
            .unwrap();
    }

    fn coordinator() -> (Arc<SqliteStore>, AuditLog, DeviceWipeCoordinator) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let audit = AuditLog::new(10, Arc::new(ManualClock::new(0)));
        let wiper = DeviceWipeCoordinator::new(store.clone(), audit.clone());
        (store, audit, wiper)
    }

    #[test]
    fn owner_wipe_removes_only_that_device() {
        let (store, audit, wiper) = coordinator();
        seed(&store, "alice", "d1");
        seed(&store, "alice", "d2");

        let report = wiper.wipe_device(&Caller::assume("alice"), "d1").unwrap();
        assert!(report.success);
        assert_eq!(report.rows_deleted, 3);
        assert!(store.load_device("d1").unwrap().is_none());
        assert!(store.load_device("d2").unwrap().is_some());
        assert_eq!(audit.entries_for(AuditEvent::DeviceWiped).len(), 1);
    }

    #[test]
    fn non_owner_is_denied_and_audited() {
        let (store, audit, wiper) = coordinator();
        seed(&store, "alice", "d1");

        let err = wiper.wipe_device(&Caller::assume("mallory"), "d1").unwrap_err();
        assert!(matches!(err, TrustError::Unauthorized(_)));
        assert!(store.load_device("d1").unwrap().is_some());
        assert_eq!(audit.entries_for(AuditEvent::WipeDenied).len(), 1);
    }

    #[test]
    fn unknown_device_is_not_found() {
        let (_store, _audit, wiper) = coordinator();
        assert!(matches!(
            wiper.wipe_device(&Caller::assume("alice"), "nope"),
            Err(TrustError::NotFound(_))
        ));
    }
}
