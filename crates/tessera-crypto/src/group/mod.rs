pub mod conversation_key;

pub use conversation_key::{ConversationKey, WrappedKey};
