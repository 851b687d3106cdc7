//! Concrete storage for Conflux: envelope encryption with AES-GCM, master keys
//! sourced from the OS keyring (or test doubles), file-backed persistence, and the
//! versioned entry store.

pub mod audit_file;
pub mod envelope;
pub mod file_store;
pub mod key_provider;
pub mod versioned;
