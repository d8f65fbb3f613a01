//! Link a new device through the full service stack, then revoke it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tessera_core::audit::AuditEntry;
use tessera_core::clock::ManualClock;
use tessera_core::config::KeyConfig;
use tessera_core::device_link::sign_challenge;
use tessera_core::store::{
    DeviceInsert, DeviceLinkRequest, DeviceRecord, PreKeyStats, ScopedTable, SqliteStore,
    StoreError, TrustStore,
};
use tessera_core::{
    AuditEvent, Caller, KeyManager, LinkChallenge, LinkSubmission, TrustConfig, TrustError,
    TrustServices,
};
use tessera_crypto::signal::{PublishedIdentity, PublishedOneTimePreKey, PublishedSignedPreKey};
use tessera_crypto::{Identity, MemoryKeychain};

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<FlakyStore>,
    services: TrustServices,
    alice: KeyManager,
}

fn harness() -> Harness {
    harness_with(Faults::default())
}

fn harness_with(faults: Faults) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(FlakyStore::new(faults));
    let services = TrustServices::new(store.clone(), TrustConfig::default(), clock.clone());

    let (alice, keys) = KeyManager::register(
        "alice",
        Arc::new(MemoryKeychain::new()),
        clock.clone(),
        KeyConfig::default(),
    )
    .unwrap();
    let proof = alice.auth_proof("publishKeys");
    let caller = services
        .auth
        .authenticate_publish("publishKeys", &proof, &keys.identity)
        .unwrap();
    services.directory.publish_keys(&caller, &keys).unwrap();

    Harness {
        clock,
        store,
        services,
        alice,
    }
}

fn signed_submission(h: &Harness, issued: &LinkChallenge, new_device: &Identity) -> LinkSubmission {
    LinkSubmission {
        request_id: issued.request_id.clone(),
        device_code: Some(issued.device_code.clone()),
        signature: sign_challenge(h.alice.identity().identity(), &issued.challenge),
        authorizing_user_id: "alice".into(),
        new_device_public_key: new_device.public_key_hex(),
        device_name: Some("phone".into()),
    }
}

fn link_new_device(h: &Harness) -> String {
    let issued = h.services.device_links.issue_request().unwrap();
    let submission = signed_submission(h, &issued, &Identity::generate());
    h.services.device_links.submit(&submission).unwrap().device_id
}

#[test]
fn linked_device_can_be_wiped_by_owner() {
    let h = harness();
    let device_id = link_new_device(&h);
    assert_eq!(h.store.list_devices("alice").unwrap().len(), 1);

    let proof = h.alice.auth_proof("wipeDevice");
    let caller = h.services.auth.authenticate("wipeDevice", &proof).unwrap();
    let report = h.services.wipe.wipe_device(&caller, &device_id).unwrap();
    assert!(report.success);
    assert!(h.store.list_devices("alice").unwrap().is_empty());

    let persisted: Vec<AuditEvent> = h
        .store
        .recent_audit(100)
        .unwrap()
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert!(persisted.contains(&AuditEvent::DeviceLinked));
    assert!(persisted.contains(&AuditEvent::DeviceWiped));
}

#[test]
fn expired_link_never_creates_device() {
    let h = harness();
    let issued = h.services.device_links.issue_request().unwrap();
    h.clock.advance(Duration::from_secs(
        TrustConfig::default().device_link.request_ttl_secs + 1,
    ));

    let err = h
        .services
        .device_links
        .submit(&LinkSubmission {
            request_id: issued.request_id,
            device_code: None,
            signature: sign_challenge(h.alice.identity().identity(), &issued.challenge),
            authorizing_user_id: "alice".into(),
            new_device_public_key: Identity::generate().public_key_hex(),
            device_name: None,
        })
        .unwrap_err();
    assert!(matches!(err, TrustError::LinkRequestExpired));
    assert!(h.store.list_devices("alice").unwrap().is_empty());
}

/// SQLite underneath, with switchable faults.
#[derive(Default)]
struct Faults {
    wipe_step: Option<ScopedTable>,
    insert_device_failures: AtomicU32,
    completion_failures: AtomicU32,
    /// Serve each link request as first read, the way a racing reader sees it.
    stale_link_reads: bool,
}

struct FlakyStore {
    inner: SqliteStore,
    faults: Faults,
    link_snapshots: Mutex<HashMap<String, DeviceLinkRequest>>,
}

impl FlakyStore {
    fn new(faults: Faults) -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            faults,
            link_snapshots: Mutex::new(HashMap::new()),
        }
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl TrustStore for FlakyStore {
    fn upsert_identity(&self, identity: &PublishedIdentity) -> Result<(), StoreError> {
        self.inner.upsert_identity(identity)
    }
    fn load_identity(&self, user_id: &str) -> Result<Option<PublishedIdentity>, StoreError> {
        self.inner.load_identity(user_id)
    }
    fn search_users(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        self.inner.search_users(prefix, limit)
    }
    fn upsert_signed_prekey(&self, prekey: &PublishedSignedPreKey) -> Result<(), StoreError> {
        self.inner.upsert_signed_prekey(prekey)
    }
    fn latest_signed_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<PublishedSignedPreKey>, StoreError> {
        self.inner.latest_signed_prekey(user_id)
    }
    fn upsert_one_time_prekeys(&self, prekeys: &[PublishedOneTimePreKey]) -> Result<(), StoreError> {
        self.inner.upsert_one_time_prekeys(prekeys)
    }
    fn claim_one_time_prekey(
        &self,
        user_id: &str,
    ) -> Result<Option<PublishedOneTimePreKey>, StoreError> {
        self.inner.claim_one_time_prekey(user_id)
    }
    fn prekey_stats(&self, user_id: &str) -> Result<PreKeyStats, StoreError> {
        self.inner.prekey_stats(user_id)
    }
    fn insert_link_request(&self, request: &DeviceLinkRequest) -> Result<(), StoreError> {
        self.inner.insert_link_request(request)
    }
    fn pending_link_request(
        &self,
        request_id: &str,
    ) -> Result<Option<DeviceLinkRequest>, StoreError> {
        if !self.faults.stale_link_reads {
            return self.inner.pending_link_request(request_id);
        }
        let mut snapshots = self.link_snapshots.lock();
        if let Some(request) = snapshots.get(request_id) {
            return Ok(Some(request.clone()));
        }
        let request = self.inner.pending_link_request(request_id)?;
        if let Some(request) = &request {
            snapshots.insert(request_id.to_string(), request.clone());
        }
        Ok(request)
    }
    fn complete_link_request(&self, request_id: &str, device_id: &str) -> Result<bool, StoreError> {
        if take_failure(&self.faults.completion_failures) {
            return Err(StoreError::Conflict("device_link_requests unavailable".into()));
        }
        self.inner.complete_link_request(request_id, device_id)
    }
    fn insert_device(&self, device: &DeviceRecord) -> Result<DeviceInsert, StoreError> {
        if take_failure(&self.faults.insert_device_failures) {
            return Err(StoreError::Conflict("devices unavailable".into()));
        }
        self.inner.insert_device(device)
    }
    fn load_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        self.inner.load_device(device_id)
    }
    fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceRecord>, StoreError> {
        self.inner.list_devices(user_id)
    }
    fn delete_scoped(
        &self,
        table: ScopedTable,
        user_id: &str,
        device_id: &str,
    ) -> Result<usize, StoreError> {
        if self.faults.wipe_step == Some(table) {
            return Err(StoreError::Conflict(format!("{} unavailable", table.table_name())));
        }
        self.inner.delete_scoped(table, user_id, device_id)
    }
    fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.inner.append_audit(entry)
    }
    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, StoreError> {
        self.inner.recent_audit(limit)
    }
}

#[test]
fn wipe_continues_past_failing_step() {
    let flaky = Arc::new(FlakyStore::new(Faults {
        wipe_step: Some(ScopedTable::Sessions),
        ..Faults::default()
    }));
    flaky
        .insert_device(&DeviceRecord {
            device_id: "d1".into(),
            user_id: "alice".into(),
            device_name: None,
            public_key: vec![1; 32],
            linked_at_ms: 0,
        })
        .unwrap();

    let services = TrustServices::new(
        flaky.clone(),
        TrustConfig::default(),
        Arc::new(ManualClock::new(0)),
    );
    let report = services
        .wipe
        .wipe_device(&Caller::assume("alice"), "d1")
        .unwrap();

    assert!(!report.success);
    assert_eq!(report.failed_steps, vec![ScopedTable::Sessions]);
    // Later steps still ran.
    assert!(flaky.load_device("d1").unwrap().is_none());
    assert_eq!(services.audit.entries_for(AuditEvent::DeviceWiped).len(), 1);
    assert_eq!(services.audit.len(), 1);
}

#[test]
fn racing_submissions_with_different_devices_link_one() {
    let h = harness_with(Faults {
        stale_link_reads: true,
        ..Faults::default()
    });
    let issued = h.services.device_links.issue_request().unwrap();
    let first = signed_submission(&h, &issued, &Identity::generate());
    let second = signed_submission(&h, &issued, &Identity::generate());

    let linked = h.services.device_links.submit(&first).unwrap();
    let err = h.services.device_links.submit(&second).unwrap_err();
    assert!(matches!(err, TrustError::LinkRequestNotFound));

    let devices = h.store.list_devices("alice").unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, linked.device_id);
    assert_eq!(h.services.audit.entries_for(AuditEvent::DeviceLinked).len(), 1);
    assert_eq!(
        h.services.audit.entries_for(AuditEvent::LinkRequestNotFound).len(),
        1
    );
}

#[test]
fn same_device_racing_itself_gets_same_id() {
    let h = harness_with(Faults {
        stale_link_reads: true,
        ..Faults::default()
    });
    let issued = h.services.device_links.issue_request().unwrap();
    let submission = signed_submission(&h, &issued, &Identity::generate());

    let first = h.services.device_links.submit(&submission).unwrap();
    let second = h.services.device_links.submit(&submission).unwrap();
    assert_eq!(first.device_id, second.device_id);
    assert_eq!(h.store.list_devices("alice").unwrap().len(), 1);
}

#[test]
fn failed_device_insert_leaves_request_pending() {
    let h = harness_with(Faults {
        insert_device_failures: AtomicU32::new(1),
        ..Faults::default()
    });
    let issued = h.services.device_links.issue_request().unwrap();
    let submission = signed_submission(&h, &issued, &Identity::generate());

    let err = h.services.device_links.submit(&submission).unwrap_err();
    assert!(matches!(err, TrustError::Store(_)));
    assert!(h.store.list_devices("alice").unwrap().is_empty());
    assert!(h.store.pending_link_request(&issued.request_id).unwrap().is_some());

    let linked = h.services.device_links.submit(&submission).unwrap();
    let devices = h.store.list_devices("alice").unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, linked.device_id);
}

#[test]
fn failed_completion_retries_to_the_same_device() {
    let h = harness_with(Faults {
        completion_failures: AtomicU32::new(1),
        ..Faults::default()
    });
    let issued = h.services.device_links.issue_request().unwrap();
    let new_device = Identity::generate();
    let submission = signed_submission(&h, &issued, &new_device);

    let err = h.services.device_links.submit(&submission).unwrap_err();
    assert!(matches!(err, TrustError::Store(_)));
    // The device row landed but the request is still open.
    assert_eq!(h.store.list_devices("alice").unwrap().len(), 1);
    assert!(h.store.pending_link_request(&issued.request_id).unwrap().is_some());

    let linked = h.services.device_links.submit(&submission).unwrap();
    let devices = h.store.list_devices("alice").unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, linked.device_id);
    assert!(h.store.pending_link_request(&issued.request_id).unwrap().is_none());
}
