use std::time::{SystemTime, UNIX_EPOCH};

pub use hubmesh_transport::{NodeId, PeerId};

/// Separator between namespace and name in a device id (`light:kitchen`).
pub const DEVICE_ID_SEPARATOR: char = ':';

/// Prefix of the built-in metadata actions every device answers.
pub const METADATA_ACTION_PREFIX: &str = "metadata:";

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Check that a device id is `<namespace>:<name>` with a non-empty namespace.
pub fn is_valid_device_id(id: &str) -> bool {
    matches!(id.find(DEVICE_ID_SEPARATOR), Some(pos) if pos > 0 && pos + 1 < id.len())
}
