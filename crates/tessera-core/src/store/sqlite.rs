use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tessera_crypto::signal::{PublishedIdentity, PublishedOneTimePreKey, PublishedSignedPreKey};

use super::{
    DeviceInsert, DeviceLinkRequest, DeviceRecord, PreKeyStats, ScopedTable, StoreError,
    TrustStore,
};
use crate::audit::{AuditEntry, AuditEvent};

/// Schema version. Bump when the schema changes.
const SCHEMA_VERSION: i64 = 2;

/// `SQLite`-backed trust store.
///
/// One connection behind a mutex; every trait method is a single statement
/// or a single transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Open(format!("{}: {e}", path.display())))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current != SCHEMA_VERSION {
            if current != 0 {
                let audit_rows: i64 = conn
                    .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
                    .unwrap_or(0);
                tracing::info!(
                    old = current,
                    new = SCHEMA_VERSION,
                    audit_rows,
                    "store schema version mismatch, recreating (audit log kept)"
                );
                drop_all_tables(&conn)?;
            }
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` against the raw connection.
    ///
    /// For hosts that keep their own CRUD tables (conversations, messages,
    /// sessions, device locations) in the same database.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }
}

/// Drop every user table except the audit log so the schema can be cleanly
/// re-applied.
fn drop_all_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch("PRAGMA foreign_keys=OFF;")?;

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != 'audit_log'",
    )?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))?;
    }

    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_ms(ms: i64) -> u64 {
    u64::try_from(ms).unwrap_or(0)
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS identity_keys (
    user_id TEXT PRIMARY KEY,
    device_id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    registration_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS signed_prekeys (
    user_id TEXT NOT NULL,
    key_id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    signature BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, key_id)
);

CREATE TABLE IF NOT EXISTS one_time_prekeys (
    user_id TEXT NOT NULL,
    key_id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    used INTEGER NOT NULL DEFAULT 0 CHECK (used IN (0, 1)),
    PRIMARY KEY (user_id, key_id)
);
CREATE INDEX IF NOT EXISTS idx_one_time_prekeys_unused
    ON one_time_prekeys(user_id, used, key_id);

CREATE TABLE IF NOT EXISTS device_link_requests (
    request_id TEXT PRIMARY KEY,
    device_code TEXT NOT NULL,
    challenge TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1)),
    completed_device_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    device_name TEXT,
    public_key BLOB NOT NULL,
    linked_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT NOT NULL,
    owner_user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    title TEXT,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (id, owner_user_id, device_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    owner_user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    ciphertext BLOB NOT NULL,
    sent_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_scope ON messages(owner_user_id, device_id);

CREATE TABLE IF NOT EXISTS sessions (
    owner_user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    peer_user_id TEXT NOT NULL,
    session_data BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (owner_user_id, device_id, peer_user_id)
);

CREATE TABLE IF NOT EXISTS device_locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT NOT NULL,
    event TEXT NOT NULL,
    detail TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;
";

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRecord> {
    Ok(DeviceRecord {
        device_id: row.get(0)?,
        user_id: row.get(1)?,
        device_name: row.get(2)?,
        public_key: row.get(3)?,
        linked_at_ms: from_sql_ms(row.get(4)?),
    })
}

impl TrustStore for SqliteStore {
    fn upsert_identity(&self, identity: &PublishedIdentity) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO identity_keys (user_id, device_id, public_key, registration_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                device_id = excluded.device_id,
                public_key = excluded.public_key,
                registration_id = excluded.registration_id",
            params![
                identity.user_id,
                identity.device_id,
                identity.public_key,
                identity.registration_id
            ],
        )?;
        Ok(())
    }

    fn load_identity(&self, user_id: &str) -> Result<Option<PublishedIdentity>, StoreError> {
        let conn = self.conn.lock();
        let identity = conn
            .query_row(
                "SELECT user_id, device_id, public_key, registration_id
                 FROM identity_keys WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(PublishedIdentity {
                        user_id: row.get(0)?,
                        device_id: row.get(1)?,
                        public_key: row.get(2)?,
                        registration_id: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(identity)
    }

    fn search_users(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM identity_keys
             WHERE substr(user_id, 1, length(?1)) = ?1
             ORDER BY user_id LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let users = stmt
            .query_map(params![prefix, limit], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(users)
    }

    fn upsert_signed_prekey(&self, prekey: &PublishedSignedPreKey) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signed_prekeys (user_id, key_id, public_key, signature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, key_id) DO UPDATE SET
                public_key = excluded.public_key,
                signature = excluded.signature,
                created_at = excluded.created_at",
            params![
                prekey.user_id,
                prekey.key_id,
                prekey.public_key,
                prekey.signature,
                to_sql_ms(prekey.created_at_ms)
            ],
        )?;
        Ok(())
    }

    fn latest_signed_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<PublishedSignedPreKey>, StoreError> {
        let conn = self.conn.lock();
        let prekey = conn
            .query_row(
                "SELECT user_id, key_id, public_key, signature, created_at
                 FROM signed_prekeys WHERE user_id = ?1
                 ORDER BY created_at DESC, key_id DESC LIMIT 1",
                params![user_id],
                |row| {
                    Ok(PublishedSignedPreKey {
                        user_id: row.get(0)?,
                        key_id: row.get(1)?,
                        public_key: row.get(2)?,
                        signature: row.get(3)?,
                        created_at_ms: from_sql_ms(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(prekey)
    }

    fn upsert_one_time_prekeys(&self, prekeys: &[PublishedOneTimePreKey]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            // Re-publishing may refresh an unused key but never touches `used`.
            let mut stmt = tx.prepare(
                "INSERT INTO one_time_prekeys (user_id, key_id, public_key, used)
                 VALUES (?1, ?2, ?3, 0)
                 ON CONFLICT(user_id, key_id) DO UPDATE SET
                    public_key = excluded.public_key
                 WHERE one_time_prekeys.used = 0",
            )?;
            for prekey in prekeys {
                stmt.execute(params![prekey.user_id, prekey.key_id, prekey.public_key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn claim_one_time_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<PublishedOneTimePreKey>, StoreError> {
        let conn = self.conn.lock();
        let claimed = conn
            .query_row(
                "UPDATE one_time_prekeys SET used = 1
                 WHERE user_id = ?1 AND used = 0 AND key_id = (
                    SELECT key_id FROM one_time_prekeys
                    WHERE user_id = ?1 AND used = 0
                    ORDER BY key_id LIMIT 1
                 )
                 RETURNING user_id, key_id, public_key",
                params![user_id],
                |row| {
                    Ok(PublishedOneTimePreKey {
                        user_id: row.get(0)?,
                        key_id: row.get(1)?,
                        public_key: row.get(2)?,
                        used: true,
                    })
                },
            )
            .optional()?;
        Ok(claimed)
    }

    fn prekey_stats(&self, user_id: &str) -> Result<PreKeyStats, StoreError> {
        let conn = self.conn.lock();
        let (unused, highest): (i64, Option<u32>) = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN used = 0 THEN 1 ELSE 0 END), 0), MAX(key_id)
             FROM one_time_prekeys WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(PreKeyStats {
            unused: u32::try_from(unused)
                .map_err(|_| StoreError::Corrupt(format!("unused prekey count {unused}")))?,
            highest_key_id: highest,
        })
    }

    fn insert_link_request(&self, request: &DeviceLinkRequest) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO device_link_requests
                (request_id, device_code, challenge, expires_at, completed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                request.request_id,
                request.device_code,
                request.challenge,
                to_sql_ms(request.expires_at_ms),
                request.completed,
                to_sql_ms(request.created_at_ms)
            ],
        )?;
        Ok(())
    }

    fn pending_link_request(
        &self,
        request_id: &str,
    ) -> Result<Option<DeviceLinkRequest>, StoreError> {
        let conn = self.conn.lock();
        let request = conn
            .query_row(
                "SELECT request_id, device_code, challenge, expires_at, completed, created_at
                 FROM device_link_requests WHERE request_id = ?1 AND completed = 0",
                params![request_id],
                |row| {
                    Ok(DeviceLinkRequest {
                        request_id: row.get(0)?,
                        device_code: row.get(1)?,
                        challenge: row.get(2)?,
                        expires_at_ms: from_sql_ms(row.get(3)?),
                        completed: row.get(4)?,
                        created_at_ms: from_sql_ms(row.get(5)?),
                    })
                },
            )
            .optional()?;
        Ok(request)
    }

    fn complete_link_request(&self, request_id: &str, device_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE device_link_requests SET completed = 1, completed_device_id = ?2
             WHERE request_id = ?1 AND (completed = 0 OR completed_device_id = ?2)",
            params![request_id, device_id],
        )?;
        Ok(changed == 1)
    }

    fn insert_device(&self, device: &DeviceRecord) -> Result<DeviceInsert, StoreError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO devices (device_id, user_id, device_name, public_key, linked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(device_id) DO NOTHING",
            params![
                device.device_id,
                device.user_id,
                device.device_name,
                device.public_key,
                to_sql_ms(device.linked_at_ms)
            ],
        )?;
        if inserted == 1 {
            return Ok(DeviceInsert::Inserted);
        }

        let owner: String = conn.query_row(
            "SELECT user_id FROM devices WHERE device_id = ?1",
            params![device.device_id],
            |row| row.get(0),
        )?;
        if owner == device.user_id {
            Ok(DeviceInsert::AlreadyPresent)
        } else {
            Err(StoreError::Conflict(format!(
                "device {} is bound to another user",
                device.device_id
            )))
        }
    }

    fn load_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let conn = self.conn.lock();
        let device = conn
            .query_row(
                "SELECT device_id, user_id, device_name, public_key, linked_at
                 FROM devices WHERE device_id = ?1",
                params![device_id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT device_id, user_id, device_name, public_key, linked_at
             FROM devices WHERE user_id = ?1 ORDER BY linked_at, device_id",
        )?;
        let devices = stmt
            .query_map(params![user_id], device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    fn delete_scoped(
        &self,
        table: ScopedTable,
        user_id: &str,
        device_id: &str,
    ) -> Result<usize, StoreError> {
        let sql = match table {
            ScopedTable::Devices => "DELETE FROM devices WHERE user_id = ?1 AND device_id = ?2",
            ScopedTable::Messages => {
                "DELETE FROM messages WHERE owner_user_id = ?1 AND device_id = ?2"
            }
            ScopedTable::Conversations => {
                "DELETE FROM conversations WHERE owner_user_id = ?1 AND device_id = ?2"
            }
            ScopedTable::Sessions => {
                "DELETE FROM sessions WHERE owner_user_id = ?1 AND device_id = ?2"
            }
            ScopedTable::DeviceLocations => {
                "DELETE FROM device_locations WHERE owner_user_id = ?1 AND device_id = ?2"
            }
        };
        let conn = self.conn.lock();
        Ok(conn.execute(sql, params![user_id, device_id])?)
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log (actor, event, detail, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.actor,
                entry.event.as_str(),
                entry.detail,
                to_sql_ms(entry.timestamp_ms)
            ],
        )?;
        Ok(())
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT actor, event, detail, timestamp FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut entries = rows
            .into_iter()
            .map(|(actor, event, detail, timestamp)| {
                let event = AuditEvent::parse(&event)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown audit event {event}")))?;
                Ok(AuditEntry {
                    actor,
                    event,
                    detail,
                    timestamp_ms: from_sql_ms(timestamp),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        entries.reverse();
        Ok(entries)
    }
}
