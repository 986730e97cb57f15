//! Core data models for the copy proxy.
//!
//! Keys, object metadata and payloads, and the host identity used for tagging.
//! Metadata types serialize naturally as JSON via `serde` for logs and error
//! bodies.

pub mod host;
pub mod object;
pub mod object_key;
