//! Key lifecycle: the server-side key directory and the device-local key
//! manager that owns the private halves.

mod directory;
mod local;

pub use directory::{KeyDirectory, PublishRequest};
pub use local::KeyManager;
