//! Core abstractions for Conflux: the configuration/secret data model, access
//! control, audit and persistence contracts shared by every other crate.
//! Kept free of crypto and I/O so the leaf crates stay cheap to depend on.

pub mod access;
pub mod audit;
pub mod blob;
pub mod error;
pub mod feed;
pub mod model;

pub use error::{CoreError, CoreResult};
