//! Storage gateways, the fetch coordinator and the collaborators around them.

pub mod disk_gateway;
pub mod fetch_coordinator;
pub mod gateway;
pub mod host;
pub mod http_source;
pub mod memory_gateway;
pub mod metrics;
pub mod s3_gateway;
