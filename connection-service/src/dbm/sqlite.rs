//! SQLite metadata via `sqlite_master` and the table-valued pragmas.

use async_trait::async_trait;
use common::errors::{AppError, AppResult};
use futures::stream::{BoxStream, StreamExt};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::meta::{
    decode_row, metadata_err, quote_with, Column, DataKind, DataValue, Index, MetadataProvider,
    Table,
};

#[derive(sqlx::FromRow)]
struct ColumnRow {
    table_name: String,
    column_name: String,
    column_type: String,
    not_null: i64,
    column_default: Option<String>,
    pk: i64,
}

#[derive(sqlx::FromRow)]
struct IndexRow {
    index_name: String,
    is_unique: i64,
    origin: String,
    column_name: Option<String>,
}

const AUTOINDEX_PREFIX: &str = "sqlite_autoindex_";

pub struct SqliteMeta {
    pool: SqlitePool,
}

impl SqliteMeta {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn push_name_filter(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, names: &[String]) {
        qb.push(format!(" AND {} IN (", column));
        let mut separated = qb.separated(", ");
        for name in names {
            separated.push_bind(name.clone());
        }
        separated.push_unseparated(")");
    }
}

#[async_trait]
impl MetadataProvider for SqliteMeta {
    fn dialect(&self) -> &'static str {
        "sqlite"
    }

    async fn get_tables(&self, names: &[String]) -> AppResult<Vec<Table>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        );
        if !names.is_empty() {
            Self::push_name_filter(&mut qb, "name", names);
        }
        qb.push(" ORDER BY name");

        let rows: Vec<(String,)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(metadata_err)?;
        Ok(rows
            .into_iter()
            .map(|(name,)| Table {
                name,
                comment: String::new(),
            })
            .collect())
    }

    async fn get_columns(&self, tables: &[String]) -> AppResult<Vec<Column>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT m.name AS table_name, p.name AS column_name, p.type AS column_type, \
                    p.\"notnull\" AS not_null, p.dflt_value AS column_default, p.pk AS pk \
             FROM sqlite_master m JOIN pragma_table_info(m.name) p \
             WHERE m.type = 'table'",
        );
        Self::push_name_filter(&mut qb, "m.name", tables);
        qb.push(" ORDER BY m.name, p.cid");

        let rows: Vec<ColumnRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(metadata_err)?;

        let mut columns: Vec<Column> = rows
            .into_iter()
            .map(|r| Column {
                table_name: r.table_name,
                name: r.column_name,
                column_type: r.column_type,
                nullable: r.not_null == 0,
                pk_ordinal: u32::try_from(r.pk).ok().filter(|ord| *ord > 0),
                is_identity: false,
                default: r.column_default,
                generated: None,
                comment: String::new(),
            })
            .collect();

        // A single INTEGER primary key aliases the rowid.
        for table in tables {
            let pks: Vec<usize> = columns
                .iter()
                .enumerate()
                .filter(|(_, c)| &c.table_name == table && c.is_primary_key())
                .map(|(i, _)| i)
                .collect();
            if let [only] = pks[..] {
                if columns[only].column_type.eq_ignore_ascii_case("integer") {
                    columns[only].is_identity = true;
                }
            }
        }
        Ok(columns)
    }

    async fn get_table_index(&self, table: &str) -> AppResult<Vec<Index>> {
        let rows: Vec<IndexRow> = sqlx::query_as(
            "SELECT il.name AS index_name, il.\"unique\" AS is_unique, il.origin AS origin, \
                    ii.name AS column_name \
             FROM pragma_index_list(?1) il JOIN pragma_index_info(il.name) ii \
             ORDER BY il.name, ii.seqno",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(metadata_err)?;

        let mut indexes: Vec<Index> = Vec::new();
        let mut last_name = String::new();
        let mut renamed = 0;
        for row in rows {
            let Some(column) = row.column_name else {
                continue;
            };
            if row.index_name == last_name {
                if let Some(index) = indexes.last_mut() {
                    index.columns.push(column);
                }
                continue;
            }
            last_name = row.index_name.clone();

            // Reserved names of constraint indexes cannot be recreated as is.
            let name = if row.index_name.starts_with(AUTOINDEX_PREFIX) {
                renamed += 1;
                format!("{}_uk_{}", table, renamed)
            } else {
                row.index_name
            };
            indexes.push(Index {
                name,
                columns: vec![column],
                unique: row.is_unique != 0,
                is_primary_key: row.origin == "pk",
            });
        }
        Ok(indexes)
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '"')
    }

    /// `CAST(real AS TEXT)` keeps 15 significant digits; reals are printed
    /// with 17 so they read back bit for bit.
    fn cast_to_text(&self, quoted_column: &str) -> String {
        format!(
            "CASE typeof({col}) WHEN 'real' THEN printf('%!.17g', {col}) ELSE CAST({col} AS TEXT) END",
            col = quoted_column
        )
    }

    fn fetch_rows<'a>(
        &'a self,
        sql: &'a str,
        kinds: &'a [DataKind],
    ) -> BoxStream<'a, AppResult<Vec<DataValue>>> {
        sqlx::query(sql)
            .fetch(&self.pool)
            .map(move |row| {
                row.map_err(|e| AppError::DatabaseQuery(e.to_string()))
                    .and_then(|row| decode_row(&row, kinds))
            })
            .boxed()
    }

    fn generate_table_ddl(
        &self,
        table: &Table,
        columns: &[Column],
        drop_before_create: bool,
    ) -> String {
        let quoted = self.quote_identifier(&table.name);
        let mut ddl = String::new();
        if drop_before_create {
            ddl.push_str(&format!("DROP TABLE IF EXISTS {};\n", quoted));
        }

        let mut lines: Vec<String> = columns
            .iter()
            .map(|c| {
                let mut line = format!("  {}", self.quote_identifier(&c.name));
                if !c.column_type.is_empty() {
                    line.push(' ');
                    line.push_str(&c.column_type);
                }
                if !c.nullable {
                    line.push_str(" NOT NULL");
                }
                if let Some(default) = &c.default {
                    line.push_str(" DEFAULT ");
                    line.push_str(default);
                }
                line
            })
            .collect();
        if let Some(pk) = self.primary_key_clause(columns) {
            lines.push(format!("  {}", pk));
        }

        ddl.push_str(&format!("CREATE TABLE {} (\n{}\n);", quoted, lines.join(",\n")));
        ddl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reads_tables_columns_and_indexes() {
        let pool = memory_pool().await;
        sqlx::raw_sql(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE, name TEXT DEFAULT 'anon');
             CREATE INDEX idx_users_name ON users (name, email);
             CREATE TABLE audit (at DATETIME, body BLOB);",
        )
        .execute(&pool)
        .await
        .unwrap();
        let meta = SqliteMeta::new(pool);

        let tables = meta.get_tables(&[]).await.unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["audit", "users"]);
        assert_eq!(meta.get_tables(&["users".into()]).await.unwrap().len(), 1);

        let columns = meta.get_columns(&["users".into()]).await.unwrap();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].name, "id");
        assert!(columns[0].is_primary_key() && columns[0].is_identity);
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].default.as_deref(), Some("'anon'"));

        let indexes = meta.get_table_index("users").await.unwrap();
        let composite = indexes.iter().find(|i| i.name == "idx_users_name").unwrap();
        assert_eq!(composite.columns, vec!["name", "email"]);
        assert!(!composite.unique);
        let unique = indexes.iter().find(|i| i.unique).unwrap();
        assert_eq!(unique.name, "users_uk_1");
        assert_eq!(unique.columns, vec!["email"]);
    }

    #[tokio::test]
    async fn test_composite_key_keeps_key_order() {
        let pool = memory_pool().await;
        sqlx::raw_sql("CREATE TABLE pairs (a INTEGER NOT NULL, b TEXT NOT NULL, v REAL, PRIMARY KEY (b, a));")
            .execute(&pool)
            .await
            .unwrap();
        let meta = SqliteMeta::new(pool);

        let columns = meta.get_columns(&["pairs".into()]).await.unwrap();
        assert_eq!(columns[0].pk_ordinal, Some(2));
        assert_eq!(columns[1].pk_ordinal, Some(1));
        assert!(!columns[0].is_identity);

        let table = Table {
            name: "pairs".into(),
            comment: String::new(),
        };
        let ddl = meta.generate_table_ddl(&table, &columns, false);
        assert!(ddl.contains("  PRIMARY KEY (\"b\", \"a\")\n);"));
    }
}
