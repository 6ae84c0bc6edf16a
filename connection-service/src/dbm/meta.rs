//! Dialect-neutral table metadata and the per-dialect provider trait.

use std::fmt::Write as _;

use async_trait::async_trait;
use common::errors::{AppError, AppResult};
use futures::stream::BoxStream;
use sqlx::{ColumnIndex, Decode, Row, Type};

/// A table of the connected database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub comment: String,
}

/// A column, in declaration order within its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub table_name: String,
    pub name: String,
    /// Declared type as reported by the engine, e.g. `varchar(32)`.
    pub column_type: String,
    pub nullable: bool,
    /// 1-based position in the primary key.
    pub pk_ordinal: Option<u32>,
    /// Auto increment, serial or identity column.
    pub is_identity: bool,
    /// Default expression in the engine's own syntax.
    pub default: Option<String>,
    /// Computed column. It is recreated by the DDL and never inserted into.
    pub generated: Option<Generated>,
    pub comment: String,
}

impl Column {
    pub fn is_primary_key(&self) -> bool {
        self.pk_ordinal.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub expression: String,
    /// Stored rather than virtual.
    pub stored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    /// Indexed columns in key order.
    pub columns: Vec<String>,
    pub unique: bool,
    pub is_primary_key: bool,
}

/// How a column value is written into an `INSERT` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Number,
    String,
    Date,
    Time,
    DateTime,
    Blob,
}

/// A fetched cell. Non-binary columns are fetched as their text rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataValue {
    Null,
    Text(String),
    Bytes(Vec<u8>),
}

/// Access to the schema and rows of one live connection.
///
/// The dump engine only talks to this trait; every engine specific detail
/// (catalog queries, quoting, literal syntax, DDL) lives behind it.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Dialect name for logs.
    fn dialect(&self) -> &'static str;

    /// Tables of the current database. An empty `names` lists all of them.
    async fn get_tables(&self, names: &[String]) -> AppResult<Vec<Table>>;

    /// Columns of `tables` in one query, ordered by table then position.
    async fn get_columns(&self, tables: &[String]) -> AppResult<Vec<Column>>;

    async fn get_table_index(&self, table: &str) -> AppResult<Vec<Index>>;

    fn quote_identifier(&self, name: &str) -> String;

    /// Expression selecting `quoted_column` as text.
    fn cast_to_text(&self, quoted_column: &str) -> String;

    /// Streams rows of `sql`, decoding cell `i` according to `kinds[i]`.
    fn fetch_rows<'a>(
        &'a self,
        sql: &'a str,
        kinds: &'a [DataKind],
    ) -> BoxStream<'a, AppResult<Vec<DataValue>>>;

    /// `CREATE TABLE` (preceded by `DROP TABLE IF EXISTS` when asked), each
    /// statement terminated by `;`.
    fn generate_table_ddl(&self, table: &Table, columns: &[Column], drop_before_create: bool)
        -> String;

    fn data_kind(&self, column_type: &str) -> DataKind {
        let t = column_type.to_lowercase();
        if t.contains("blob") || t.contains("binary") || t.contains("bytea") {
            DataKind::Blob
        } else if t.contains("datetime") || t.contains("timestamp") {
            DataKind::DateTime
        } else if t.contains("date") {
            DataKind::Date
        } else if t.contains("time") {
            DataKind::Time
        } else if ["int", "decimal", "numeric", "float", "double", "real", "number", "serial"]
            .iter()
            .any(|n| t.contains(n))
        {
            DataKind::Number
        } else {
            DataKind::String
        }
    }

    /// `SELECT` of every column of `table`, blobs raw and the rest as text.
    fn select_rows_sql(&self, table: &str, columns: &[Column]) -> String {
        let exprs: Vec<String> = columns
            .iter()
            .map(|c| {
                let quoted = self.quote_identifier(&c.name);
                if self.data_kind(&c.column_type) == DataKind::Blob {
                    quoted
                } else {
                    self.cast_to_text(&quoted)
                }
            })
            .collect();
        format!(
            "SELECT {} FROM {}",
            exprs.join(", "),
            self.quote_identifier(table)
        )
    }

    /// `PRIMARY KEY (...)` table constraint with the columns in key order.
    fn primary_key_clause(&self, columns: &[Column]) -> Option<String> {
        let mut keys: Vec<(u32, &str)> = columns
            .iter()
            .filter_map(|c| c.pk_ordinal.map(|ord| (ord, c.name.as_str())))
            .collect();
        if keys.is_empty() {
            return None;
        }
        keys.sort_by_key(|(ord, _)| *ord);
        let names: Vec<String> = keys.iter().map(|(_, n)| self.quote_identifier(n)).collect();
        Some(format!("PRIMARY KEY ({})", names.join(", ")))
    }

    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }

    fn blob_literal(&self, bytes: &[u8]) -> String {
        format!("X'{}'", to_hex(bytes))
    }

    fn wrap_value(&self, value: &DataValue, kind: DataKind) -> String {
        match value {
            DataValue::Null => "NULL".to_string(),
            DataValue::Bytes(bytes) => self.blob_literal(bytes),
            DataValue::Text(s) if kind == DataKind::Number && is_numeric_literal(s) => s.clone(),
            DataValue::Text(s) => format!("'{}'", self.escape_string(s)),
        }
    }

    /// Statements written before the rows of `table`.
    fn before_insert(&self, _table: &str, _columns: &[Column]) -> Vec<String> {
        Vec::new()
    }

    /// Statements written after the rows of `table`.
    fn after_insert(&self, _table: &str, _columns: &[Column]) -> Vec<String> {
        Vec::new()
    }

    fn generate_index_ddl(&self, table: &str, indexes: &[Index]) -> Vec<String> {
        indexes
            .iter()
            .map(|index| {
                let columns: Vec<String> =
                    index.columns.iter().map(|c| self.quote_identifier(c)).collect();
                format!(
                    "CREATE {}INDEX {} ON {} ({});",
                    if index.unique { "UNIQUE " } else { "" },
                    self.quote_identifier(&index.name),
                    self.quote_identifier(table),
                    columns.join(", ")
                )
            })
            .collect()
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Whether `s` can be written unquoted as a numeric literal.
pub(crate) fn is_numeric_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty()
        && !digits.starts_with('.')
        && !digits.ends_with('.')
        && s.parse::<f64>().map(|f| f.is_finite()).unwrap_or(false)
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
}

/// Doubles embedded quote characters of an identifier.
pub(crate) fn quote_with(name: &str, quote: char) -> String {
    let escaped = name.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}

pub(crate) fn metadata_err(e: sqlx::Error) -> AppError {
    AppError::MetadataFetchFailed(e.to_string())
}

/// Decodes a row selected by [`MetadataProvider::select_rows_sql`].
pub(crate) fn decode_row<R>(row: &R, kinds: &[DataKind]) -> AppResult<Vec<DataValue>>
where
    R: Row,
    usize: ColumnIndex<R>,
    for<'r> String: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> Vec<u8>: Decode<'r, R::Database> + Type<R::Database>,
{
    kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            let value = if *kind == DataKind::Blob {
                row.try_get::<Option<Vec<u8>>, _>(i)
                    .map(|v| v.map_or(DataValue::Null, DataValue::Bytes))
            } else {
                row.try_get::<Option<String>, _>(i)
                    .map(|v| v.map_or(DataValue::Null, DataValue::Text))
            };
            value.map_err(|e| AppError::DatabaseQuery(e.to_string()))
        })
        .collect()
}
