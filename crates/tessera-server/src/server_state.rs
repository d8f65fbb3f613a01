use std::sync::Arc;

use tessera_core::{Clock, TrustServices};

/// Central state for the trust daemon.
pub struct ServerState {
    pub services: TrustServices,
    pub clock: Arc<dyn Clock>,
    /// Unix timestamp (ms) when the server started.
    pub started_at_ms: u64,
}

impl ServerState {
    pub fn new(services: TrustServices, clock: Arc<dyn Clock>) -> Self {
        let started_at_ms = clock.now_ms();
        Self {
            services,
            clock,
            started_at_ms,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.started_at_ms) / 1000
    }
}
