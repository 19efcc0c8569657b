//! Lease-coordinated migration of objects between two scopes of a blob store.
//!
//! Several workers may run the same job at once; each object is moved by at
//! most one of them at a time, guarded by either a native backend lease or an
//! advisory `lease_expiration` metadata field.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;
