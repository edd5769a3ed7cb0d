//! Core data models for the files API.
//!
//! These are read-only snapshots of what the object store reports. They
//! serialize naturally as JSON via `serde` and are never cached locally.

pub mod object;
pub mod page;
