use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::store::TrustStore;

/// Security-relevant events written to the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    PinSet,
    PinFailed,
    PinBlocked,
    PinUnlocked,
    PinReset,
    PinResetDenied,
    LinkRequestIssued,
    LinkRequestNotFound,
    LinkRequestExpired,
    LinkUserNotFound,
    LinkSignatureInvalid,
    DeviceLinked,
    DeviceWiped,
    WipeDenied,
    KeysPublished,
    KeyPublishDenied,
    PreKeysExhausted,
    RateLimited,
    AuthRejected,
}

impl AuditEvent {
    const ALL: [AuditEvent; 19] = [
        Self::PinSet,
        Self::PinFailed,
        Self::PinBlocked,
        Self::PinUnlocked,
        Self::PinReset,
        Self::PinResetDenied,
        Self::LinkRequestIssued,
        Self::LinkRequestNotFound,
        Self::LinkRequestExpired,
        Self::LinkUserNotFound,
        Self::LinkSignatureInvalid,
        Self::DeviceLinked,
        Self::DeviceWiped,
        Self::WipeDenied,
        Self::KeysPublished,
        Self::KeyPublishDenied,
        Self::PreKeysExhausted,
        Self::RateLimited,
        Self::AuthRejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PinSet => "pin_set",
            Self::PinFailed => "pin_failed",
            Self::PinBlocked => "pin_blocked",
            Self::PinUnlocked => "pin_unlocked",
            Self::PinReset => "pin_reset",
            Self::PinResetDenied => "pin_reset_denied",
            Self::LinkRequestIssued => "link_request_issued",
            Self::LinkRequestNotFound => "link_request_not_found",
            Self::LinkRequestExpired => "link_request_expired",
            Self::LinkUserNotFound => "link_user_not_found",
            Self::LinkSignatureInvalid => "link_signature_invalid",
            Self::DeviceLinked => "device_linked",
            Self::DeviceWiped => "device_wiped",
            Self::WipeDenied => "wipe_denied",
            Self::KeysPublished => "keys_published",
            Self::KeyPublishDenied => "key_publish_denied",
            Self::PreKeysExhausted => "prekeys_exhausted",
            Self::RateLimited => "rate_limited",
            Self::AuthRejected => "auth_rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == raw)
    }

    /// Failures and denials, as opposed to successful transitions.
    pub fn is_security_failure(self) -> bool {
        !matches!(
            self,
            Self::PinSet
                | Self::PinUnlocked
                | Self::PinReset
                | Self::LinkRequestIssued
                | Self::DeviceLinked
                | Self::DeviceWiped
                | Self::KeysPublished
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub actor: String,
    pub event: AuditEvent,
    pub detail: String,
    pub timestamp_ms: u64,
}

/// Capacity-bounded audit trail.
///
/// Cloning shares the same buffer. Keeps the most recent `capacity` entries
/// in memory; with a sink attached every entry is also appended to the
/// store's append-only table. Sink failures are logged, never returned.
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<AuditInner>,
}

struct AuditInner {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn TrustStore>>,
}

impl AuditLog {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self::build(capacity, clock, None)
    }

    pub fn with_sink(capacity: usize, clock: Arc<dyn Clock>, sink: Arc<dyn TrustStore>) -> Self {
        Self::build(capacity, clock, Some(sink))
    }

    fn build(capacity: usize, clock: Arc<dyn Clock>, sink: Option<Arc<dyn TrustStore>>) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(AuditInner {
                capacity,
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
                clock,
                sink,
            }),
        }
    }

    pub fn record(&self, actor: &str, event: AuditEvent, detail: impl Into<String>) {
        let entry = AuditEntry {
            actor: actor.to_string(),
            event,
            detail: detail.into(),
            timestamp_ms: self.inner.clock.now_ms(),
        };

        if event.is_security_failure() {
            tracing::warn!(actor = %entry.actor, event = event.as_str(), detail = %entry.detail, "audit");
        } else {
            tracing::info!(actor = %entry.actor, event = event.as_str(), detail = %entry.detail, "audit");
        }

        if let Some(sink) = &self.inner.sink {
            if let Err(e) = sink.append_audit(&entry) {
                tracing::error!(error = %e, event = event.as_str(), "failed to persist audit entry");
            }
        }

        let mut entries = self.inner.entries.lock();
        if entries.len() == self.inner.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Buffered entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.entries.lock().iter().cloned().collect()
    }

    pub fn entries_for(&self, event: AuditEvent) -> Vec<AuditEntry> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.event == event)
            .cloned()
            .collect()
    }

    /// Clear the in-memory buffer. Persisted rows are untouched.
    pub fn reset(&self) {
        self.inner.entries.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::SqliteStore;

    #[test]
    fn ring_buffer_keeps_most_recent() {
        let log = AuditLog::new(3, Arc::new(ManualClock::new(0)));
        for i in 0..5 {
            log.record("alice", AuditEvent::PinFailed, format!("attempt {i}"));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].detail, "attempt 2");
        assert_eq!(entries[2].detail, "attempt 4");
    }

    #[test]
    fn reset_clears_buffer_only() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let log = AuditLog::with_sink(10, Arc::new(ManualClock::new(5)), store.clone());
        log.record("bob", AuditEvent::DeviceLinked, "dev-1");
        log.reset();

        assert!(log.is_empty());
        let persisted = store.recent_audit(10).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].event, AuditEvent::DeviceLinked);
        assert_eq!(persisted[0].timestamp_ms, 5);
    }

    #[test]
    fn event_names_roundtrip() {
        for event in AuditEvent::ALL {
            assert_eq!(AuditEvent::parse(event.as_str()), Some(event));
        }
        assert_eq!(AuditEvent::parse("nope"), None);
    }

    #[test]
    fn clones_share_state() {
        let log = AuditLog::new(4, Arc::new(ManualClock::new(0)));
        let other = log.clone();
        other.record("carol", AuditEvent::WipeDenied, "not owner");
        assert_eq!(log.entries_for(AuditEvent::WipeDenied).len(), 1);
        assert_eq!(log.capacity(), 4);
    }
}
