//! PostgreSQL metadata via `pg_catalog`, scoped to one schema.

use async_trait::async_trait;
use common::errors::{AppError, AppResult};
use futures::stream::{BoxStream, StreamExt};
use sqlx::PgPool;

use super::meta::{
    decode_row, metadata_err, quote_with, to_hex, Column, DataKind, DataValue, Generated, Index,
    MetadataProvider, Table,
};

#[derive(sqlx::FromRow)]
struct TableRow {
    table_name: String,
    table_comment: String,
}

#[derive(sqlx::FromRow)]
struct ColumnRow {
    table_name: String,
    column_name: String,
    column_type: String,
    nullable: bool,
    column_default: Option<String>,
    column_comment: String,
    pk_ordinal: Option<i32>,
    identity: String,
    generated: String,
}

#[derive(sqlx::FromRow)]
struct IndexRow {
    index_name: String,
    is_unique: bool,
    is_primary: bool,
    column_name: String,
}

pub struct PgMeta {
    pool: PgPool,
    schema: String,
}

impl PgMeta {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Serial columns are recreated as `serial` types, since the sequence named
    /// by their `nextval(...)` default does not exist in the target.
    fn column_ddl(&self, column: &Column) -> String {
        let serial_default = column
            .default
            .as_deref()
            .is_some_and(|d| d.starts_with("nextval("));

        let column_type = match (serial_default, column.column_type.as_str()) {
            (true, "integer") => "serial".to_string(),
            (true, "bigint") => "bigserial".to_string(),
            (true, "smallint") => "smallserial".to_string(),
            (_, other) => other.to_string(),
        };

        let mut ddl = format!("  {} {}", self.quote_identifier(&column.name), column_type);
        if let Some(generated) = &column.generated {
            ddl.push_str(&format!(" GENERATED ALWAYS AS ({}) STORED", generated.expression));
        }
        if column.is_identity && !serial_default {
            ddl.push_str(" GENERATED BY DEFAULT AS IDENTITY");
        }
        if !column.nullable {
            ddl.push_str(" NOT NULL");
        }
        if let Some(default) = column.default.as_deref().filter(|_| !serial_default) {
            ddl.push_str(" DEFAULT ");
            ddl.push_str(default);
        }
        ddl
    }
}

#[async_trait]
impl MetadataProvider for PgMeta {
    fn dialect(&self) -> &'static str {
        "postgres"
    }

    async fn get_tables(&self, names: &[String]) -> AppResult<Vec<Table>> {
        let rows: Vec<TableRow> = sqlx::query_as(
            "SELECT c.relname::text AS table_name, \
                    COALESCE(obj_description(c.oid, 'pg_class'), '') AS table_comment \
             FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relkind IN ('r', 'p') \
               AND (cardinality($2::text[]) = 0 OR c.relname::text = ANY($2)) \
             ORDER BY c.relname",
        )
        .bind(&self.schema)
        .bind(names)
        .fetch_all(&self.pool)
        .await
        .map_err(metadata_err)?;

        Ok(rows
            .into_iter()
            .map(|r| Table {
                name: r.table_name,
                comment: r.table_comment,
            })
            .collect())
    }

    async fn get_columns(&self, tables: &[String]) -> AppResult<Vec<Column>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<ColumnRow> = sqlx::query_as(
            "SELECT c.relname::text AS table_name, a.attname::text AS column_name, \
                    format_type(a.atttypid, a.atttypmod) AS column_type, \
                    NOT a.attnotnull AS nullable, \
                    pg_get_expr(d.adbin, d.adrelid) AS column_default, \
                    COALESCE(col_description(c.oid, a.attnum), '') AS column_comment, \
                    (SELECT array_position(i.indkey::int2[], a.attnum) - array_lower(i.indkey::int2[], 1) + 1 \
                     FROM pg_index i WHERE i.indrelid = c.oid AND i.indisprimary) AS pk_ordinal, \
                    a.attidentity::text AS identity, \
                    a.attgenerated::text AS generated \
             FROM pg_attribute a \
             JOIN pg_class c ON c.oid = a.attrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
             WHERE n.nspname = $1 AND c.relname::text = ANY($2) AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY c.relname, a.attnum",
        )
        .bind(&self.schema)
        .bind(tables)
        .fetch_all(&self.pool)
        .await
        .map_err(metadata_err)?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let serial = r
                    .column_default
                    .as_deref()
                    .is_some_and(|d| d.starts_with("nextval("));
                // The generation expression is stored as the column default.
                let (default, generated) = if r.generated.is_empty() {
                    (r.column_default, None)
                } else {
                    let expression = r.column_default.unwrap_or_default();
                    (None, Some(Generated { expression, stored: true }))
                };
                Column {
                    table_name: r.table_name,
                    name: r.column_name,
                    column_type: r.column_type,
                    nullable: r.nullable,
                    pk_ordinal: r.pk_ordinal.and_then(|ord| u32::try_from(ord).ok()),
                    is_identity: serial || !r.identity.is_empty(),
                    default,
                    generated,
                    comment: r.column_comment,
                }
            })
            .collect())
    }

    async fn get_table_index(&self, table: &str) -> AppResult<Vec<Index>> {
        let rows: Vec<IndexRow> = sqlx::query_as(
            "SELECT i.relname::text AS index_name, ix.indisunique AS is_unique, \
                    ix.indisprimary AS is_primary, a.attname::text AS column_name \
             FROM pg_index ix \
             JOIN pg_class t ON t.oid = ix.indrelid \
             JOIN pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) ON true \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
             WHERE n.nspname = $1 AND t.relname::text = $2 \
             ORDER BY i.relname, k.ord",
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(metadata_err)?;

        let mut indexes: Vec<Index> = Vec::new();
        for row in rows {
            match indexes.last_mut() {
                Some(index) if index.name == row.index_name => index.columns.push(row.column_name),
                _ => indexes.push(Index {
                    name: row.index_name,
                    columns: vec![row.column_name],
                    unique: row.is_unique,
                    is_primary_key: row.is_primary,
                }),
            }
        }
        Ok(indexes)
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '"')
    }

    fn cast_to_text(&self, quoted_column: &str) -> String {
        format!("{}::text", quoted_column)
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

    fn blob_literal(&self, bytes: &[u8]) -> String {
        format!("'\\x{}'::bytea", to_hex(bytes))
    }

    /// Moves identity sequences past the inserted keys.
    fn after_insert(&self, table: &str, columns: &[Column]) -> Vec<String> {
        let quoted_table = self.quote_identifier(table);
        columns
            .iter()
            .filter(|c| c.is_identity)
            .map(|c| {
                format!(
                    "SELECT setval(pg_get_serial_sequence('{}', '{}'), COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false);",
                    self.escape_string(&quoted_table),
                    self.escape_string(&c.name),
                    self.quote_identifier(&c.name),
                    quoted_table
                )
            })
            .collect()
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

        let mut lines: Vec<String> = columns.iter().map(|c| self.column_ddl(c)).collect();
        if let Some(pk) = self.primary_key_clause(columns) {
            lines.push(format!("  {}", pk));
        }
        ddl.push_str(&format!("CREATE TABLE {} (\n{}\n);", quoted, lines.join(",\n")));

        if !table.comment.is_empty() {
            ddl.push_str(&format!(
                "\nCOMMENT ON TABLE {} IS '{}';",
                quoted,
                self.escape_string(&table.comment)
            ));
        }
        for column in columns.iter().filter(|c| !c.comment.is_empty()) {
            ddl.push_str(&format!(
                "\nCOMMENT ON COLUMN {}.{} IS '{}';",
                quoted,
                self.quote_identifier(&column.name),
                self.escape_string(&column.comment)
            ));
        }
        ddl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn meta() -> PgMeta {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@127.0.0.1:5432/postgres")
            .unwrap();
        PgMeta::new(pool, "public")
    }

    fn column(name: &str, column_type: &str) -> Column {
        Column {
            table_name: "users".into(),
            name: name.into(),
            column_type: column_type.into(),
            nullable: false,
            pk_ordinal: None,
            is_identity: false,
            default: None,
            generated: None,
            comment: String::new(),
        }
    }

    #[tokio::test]
    async fn test_serial_column_is_recreated_as_serial() {
        let meta = meta();
        let mut id = column("id", "integer");
        id.pk_ordinal = Some(1);
        id.is_identity = true;
        id.default = Some("nextval('users_id_seq'::regclass)".into());
        let mut name = column("name", "character varying(32)");
        name.default = Some("'anon'::character varying".into());
        name.comment = "display name".into();

        let table = Table {
            name: "users".into(),
            comment: String::new(),
        };
        let ddl = meta.generate_table_ddl(&table, &[id.clone(), name], false);

        assert!(ddl.contains("\"id\" serial NOT NULL"));
        assert!(!ddl.contains("nextval"));
        assert!(ddl.contains("\"name\" character varying(32) NOT NULL DEFAULT 'anon'::character varying"));
        assert!(ddl.contains("COMMENT ON COLUMN \"users\".\"name\" IS 'display name';"));

        let reset = meta.after_insert("users", &[id]);
        assert_eq!(reset.len(), 1);
        assert!(reset[0].starts_with("SELECT setval(pg_get_serial_sequence('\"users\"', 'id')"));
    }

    #[tokio::test]
    async fn test_bytea_literal() {
        let meta = meta();
        assert_eq!(
            meta.wrap_value(&DataValue::Bytes(vec![0xde, 0xad]), DataKind::Blob),
            "'\\xdead'::bytea"
        );
        assert_eq!(meta.data_kind("bytea"), DataKind::Blob);
        assert_eq!(meta.data_kind("timestamp without time zone"), DataKind::DateTime);
    }

    #[tokio::test]
    async fn test_composite_key_and_generated_column() {
        let meta = meta();
        let mut tenant = column("tenant_id", "integer");
        tenant.pk_ordinal = Some(2);
        let mut code = column("code", "text");
        code.pk_ordinal = Some(1);
        let mut upper = column("code_upper", "text");
        upper.nullable = true;
        upper.generated = Some(Generated {
            expression: "upper(code)".into(),
            stored: true,
        });

        let table = Table {
            name: "items".into(),
            comment: String::new(),
        };
        let ddl = meta.generate_table_ddl(&table, &[tenant, code, upper], false);
        assert!(ddl.contains("  \"code_upper\" text GENERATED ALWAYS AS (upper(code)) STORED,\n"));
        assert!(ddl.contains("  PRIMARY KEY (\"code\", \"tenant_id\")\n);"));
    }
}
