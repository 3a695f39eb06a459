//! Cryptographic primitives for the artifact vault.

pub mod envelope;
pub mod kek;

pub use envelope::{open_detached, seal_detached, unwrap_key, wrap_key};
pub use kek::{ContentKey, MasterSecret};
