//! Core data models for the migration job.
//!
//! Containers and object records map to the local backend's tables via
//! `sqlx::FromRow`; scopes and reports are plain values passed between the
//! driver and the engine.

pub mod container;
pub mod object;
pub mod report;
pub mod scope;
