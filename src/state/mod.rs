//! State that outlives a single run.
//!
//! The fingerprint store is the only thing kiln persists between runs; this
//! module also holds the fingerprinting used to fill it.

pub mod fingerprint;
pub mod store;

pub use fingerprint::{action_signature, snapshot, FileSnapshot, Fingerprint};
pub use store::{FingerprintStore, StoreEntry};
