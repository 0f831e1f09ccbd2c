//! Database model types.

use serde::{Deserialize, Serialize};

/// A configured device as stored in the `devices` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    /// The target string exactly as configured.
    pub target: String,
}

/// A row of the `presence` table.
///
/// Dates are `YYYY-MM-DD`, `last_check` an ISO-8601 local timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub online_time: i64,
    pub last_date: String,
    pub is_online: bool,
    pub last_check: Option<String>,
}
