//! Descriptive identity of the host running the proxy.

use serde::Serialize;

pub const UNKNOWN: &str = "unknown";

/// Fields used for startup logging and metric tags only.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct HostDetails {
    pub hostname: String,
    pub region: String,
    pub instance_id: String,
    pub instance_type: String,
}

impl Default for HostDetails {
    fn default() -> Self {
        Self {
            hostname: UNKNOWN.into(),
            region: UNKNOWN.into(),
            instance_id: UNKNOWN.into(),
            instance_type: UNKNOWN.into(),
        }
    }
}
