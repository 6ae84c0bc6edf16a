//! Database instance models.
//!
//! An instance is one database server (host/port/credentials). Databases
//! managed on it are described by [`crate::models::Db`] records.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::{AppError, AppResult};

/// Relational database type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    /// MySQL database.
    MySQL,
    /// PostgreSQL database.
    Postgres,
    /// SQLite database.
    SQLite,
}

impl DbType {
    /// Returns the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            DbType::MySQL => Some(3306),
            DbType::Postgres => Some(5432),
            DbType::SQLite => None,
        }
    }

    /// Parses the stored type name.
    pub fn parse(s: &str) -> AppResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DbType::MySQL),
            "postgres" | "postgresql" | "pgsql" => Ok(DbType::Postgres),
            "sqlite" => Ok(DbType::SQLite),
            other => Err(AppError::UnsupportedDatabaseType(other.to_string())),
        }
    }
}

impl std::fmt::Display for DbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbType::MySQL => write!(f, "mysql"),
            DbType::Postgres => write!(f, "postgres"),
            DbType::SQLite => write!(f, "sqlite"),
        }
    }
}

/// Stored database instance record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DbInstance {
    /// Instance identifier.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Database type.
    pub db_type: DbType,
    /// Server host (network databases).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Server port; the type default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Login user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Encrypted password (never serialized in responses).
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    /// SQLite file path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Extra connection parameters, `k=v&k2=v2`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
}
