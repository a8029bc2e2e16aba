//! Storage contract for the rill stream engine
//!
//! This crate defines the minimal log-storage interface the engine
//! persists through, without imposing implementation details on
//! backends. A backend stores indexed byte sequences per namespace;
//! the engine treats it as an append log keyed by sequence number.

pub mod log;

pub use log::{LogStorage, StorageError, StorageNamespace, StorageResult};
