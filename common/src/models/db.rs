//! Managed database models.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

/// A database resource configured on an instance.
///
/// `database` is the allow-list of database names this resource may open,
/// delimited by whitespace or commas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Db {
    /// Resource identifier (0 before insert).
    pub id: u64,
    /// Owning instance.
    pub instance_id: u64,
    /// Display name, unique per instance.
    pub name: String,
    /// Resource code used to relate authorization tags.
    pub code: String,
    /// Allowed database names.
    pub database: String,
    /// Approval workflow definition key, if write operations need approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_procdef_key: Option<String>,
}

/// A SQL snippet saved by a user against one database of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct DbSql {
    /// Snippet identifier.
    pub id: u64,
    /// Owning database resource.
    pub db_id: u64,
    /// Database name inside the resource.
    pub db: String,
    /// Snippet name.
    pub name: String,
    /// Snippet body.
    pub sql: String,
}

/// Query parameters of the dump endpoint.
#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DumpDbQuery {
    /// Database name inside the resource.
    #[validate(length(min = 1, message = "Database name is required"))]
    pub db: String,
    /// Comma separated table subset; all tables when absent.
    #[serde(default)]
    pub tables: Option<String>,
    /// Emit table structure.
    #[serde(default = "default_true")]
    pub ddl: bool,
    /// Emit table rows.
    #[serde(default = "default_true")]
    pub data: bool,
}

fn default_true() -> bool {
    true
}

impl DumpDbQuery {
    /// Table subset as a list, empty meaning "all tables".
    pub fn table_list(&self) -> Vec<String> {
        self.tables
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }
}
