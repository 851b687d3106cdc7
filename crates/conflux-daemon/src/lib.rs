//! Composition of the Conflux core: the [`ConfigService`] facade that runs every
//! request through authorization, crypto, the versioned store and the audit log,
//! plus the daemon's configuration and component wiring.

pub mod config;
pub mod service;
pub mod storage;

pub use service::{ConfigService, EntryRead, PutRequest, ServiceOptions, VersionInfo};
