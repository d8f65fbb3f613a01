pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod device_link;
pub mod error;
pub mod keys;
pub mod pin;
pub mod rate_limit;
pub mod services;
pub mod store;
pub mod wipe;

pub use audit::{AuditEntry, AuditEvent, AuditLog};
pub use auth::{AuthProof, Authenticator, Caller};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrustConfig;
pub use device_link::{DeviceLinkService, LinkChallenge, LinkSubmission, LinkedDevice};
pub use error::{ErrorKind, TrustError};
pub use keys::{KeyDirectory, KeyManager, PublishRequest};
pub use pin::{GateState, PinGate, PrimaryCredential, ProtectedSurface};
pub use rate_limit::{RateLimitedAction, RateLimiter, RateLimiters};
pub use services::TrustServices;
pub use store::{SqliteStore, StoreError, TrustStore};
pub use wipe::{DeviceWipeCoordinator, WipeReport};
