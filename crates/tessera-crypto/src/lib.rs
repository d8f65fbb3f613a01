pub mod error;
pub mod group;
pub mod identity;
pub mod keychain;
pub mod signal;

pub use error::CryptoError;
pub use group::{ConversationKey, WrappedKey};
pub use identity::Identity;
pub use keychain::{Keychain, MemoryKeychain};
pub use signal::PreKeyBundle;
