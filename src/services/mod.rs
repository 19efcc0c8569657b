//! Backends, lock strategies and the migration engine.

pub mod clock;
pub mod engine;
pub mod local_store;
pub mod lock;
pub mod memory_store;
pub mod metadata_lease;
pub mod native_lease;
pub mod store;
