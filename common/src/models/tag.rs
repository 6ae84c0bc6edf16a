//! Authorization tag models.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Kind of resource a tag relation points at.
///
/// The resolver must pass the kind matching the resource it resolves, since
/// resource codes are only unique per kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TagResourceType {
    /// Relational database resource.
    Db,
    /// Redis resource.
    Redis,
}

impl TagResourceType {
    /// Stored numeric code.
    pub fn code(self) -> i32 {
        match self {
            TagResourceType::Db => 2,
            TagResourceType::Redis => 3,
        }
    }
}
