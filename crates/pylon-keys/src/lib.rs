//! API key store.
//!
//! Maps presented credentials to identity records. A credential has the form
//! `sk-` followed by 32 random alphanumeric characters; only its SHA-256
//! hash is ever stored, so verification is a hash compare and the plaintext
//! is returned to the caller exactly once — at creation or refresh.

mod error;
mod store;

pub use error::KeyStoreError;
pub use store::{
    create_key, delete_key, get_key, hash_credential, list_keys, refresh_key, resolve_key,
    revoke_key, update_key, ApiKey, KeyPatch, Resolution,
};
