//! Redis resource models.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A Redis instance configured for access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Redis {
    /// Resource identifier (0 before insert).
    pub id: u64,
    /// Resource code used to relate authorization tags.
    pub code: String,
    /// Display name.
    pub name: String,
    /// `host:port`; port defaults to 6379.
    pub host: String,
    /// Encrypted password (never serialized in responses).
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    /// Allowed db indexes, comma separated. Empty allows db 0 only.
    pub db: String,
    /// Approval workflow definition key, if write commands need approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_procdef_key: Option<String>,
}
