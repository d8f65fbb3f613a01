use std::sync::Arc;

use crate::audit::AuditLog;
use crate::auth::Authenticator;
use crate::clock::Clock;
use crate::config::TrustConfig;
use crate::device_link::DeviceLinkService;
use crate::keys::KeyDirectory;
use crate::rate_limit::RateLimiters;
use crate::store::TrustStore;
use crate::wipe::DeviceWipeCoordinator;

/// Server-side services sharing one store, clock and audit trail.
pub struct TrustServices {
    pub config: TrustConfig,
    pub audit: AuditLog,
    pub limiters: Arc<RateLimiters>,
    pub directory: KeyDirectory,
    pub device_links: DeviceLinkService,
    pub wipe: DeviceWipeCoordinator,
    pub auth: Authenticator,
}

impl TrustServices {
    pub fn new(store: Arc<dyn TrustStore>, config: TrustConfig, clock: Arc<dyn Clock>) -> Self {
        let audit = AuditLog::with_sink(config.audit.capacity, clock.clone(), store.clone());
        let limiters = Arc::new(RateLimiters::from_config(
            &config.rate_limits,
            clock.clone(),
            audit.clone(),
        ));
        Self {
            directory: KeyDirectory::new(store.clone(), audit.clone()),
            device_links: DeviceLinkService::new(
                store.clone(),
                limiters.clone(),
                audit.clone(),
                clock.clone(),
                &config.device_link,
            ),
            wipe: DeviceWipeCoordinator::new(store.clone(), audit.clone()),
            auth: Authenticator::new(store, clock, audit.clone(), &config.auth),
            limiters,
            audit,
            config,
        }
    }
}
