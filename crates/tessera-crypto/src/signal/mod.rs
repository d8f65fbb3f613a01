pub mod cipher;
pub mod prekeys;

pub use cipher::{decrypt, encrypt, seal_for_bundle, InitialMessage};
pub use prekeys::{
    generate_identity, generate_prekeys, generate_signed_prekey, AgreementKeyRef, IdentityKeyPair,
    OneTimePreKey, PreKeyBundle, PublishedIdentity, PublishedOneTimePreKey, PublishedSignedPreKey,
    SignedPreKey,
};
