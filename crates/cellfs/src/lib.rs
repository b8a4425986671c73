#![forbid(unsafe_code)]
//! cellfs public API facade.
//!
//! Re-exports the storage engine from `cellfs-core` through one stable
//! interface. This is the crate downstream consumers (CLI tools, host
//! filesystem integrations) depend on.

pub use cellfs_core::*;
