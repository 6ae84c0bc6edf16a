//! MySQL metadata via `information_schema`.

use async_trait::async_trait;
use common::errors::AppResult;
use futures::stream::{BoxStream, StreamExt};
use sqlx::{MySql, MySqlPool, QueryBuilder};

use super::meta::{
    decode_row, metadata_err, quote_with, Column, DataKind, DataValue, Generated, Index,
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
    is_nullable: String,
    column_key: String,
    extra: String,
    column_default: Option<String>,
    column_comment: String,
    generation_expression: String,
    pk_ordinal: Option<i64>,
}

impl ColumnRow {
    fn into_column(self) -> Column {
        let extra = self.extra.to_uppercase();
        let generated = (extra.contains("VIRTUAL GENERATED") || extra.contains("STORED GENERATED"))
            .then(|| Generated {
                expression: self.generation_expression.clone(),
                stored: extra.contains("STORED GENERATED"),
            });
        let default = match (&generated, self.column_default) {
            (Some(_), _) | (None, None) => None,
            (None, Some(d)) => Some(default_literal(&d, extra.contains("DEFAULT_GENERATED"))),
        };
        Column {
            table_name: self.table_name,
            name: self.column_name,
            column_type: self.column_type,
            nullable: self.is_nullable.eq_ignore_ascii_case("YES"),
            pk_ordinal: self
                .pk_ordinal
                .and_then(|ord| u32::try_from(ord).ok())
                .filter(|_| self.column_key == "PRI"),
            is_identity: extra.contains("AUTO_INCREMENT"),
            default,
            generated,
            comment: self.column_comment,
        }
    }
}

/// DDL form of an `information_schema` default, which reports string
/// defaults unquoted and expression defaults without their parentheses.
fn default_literal(default: &str, is_expression: bool) -> String {
    let upper = default.to_uppercase();
    if upper.starts_with("CURRENT_TIMESTAMP") || upper == "NULL" {
        default.to_string()
    } else if is_expression {
        if default.starts_with('(') {
            default.to_string()
        } else {
            format!("({})", default)
        }
    } else if super::meta::is_numeric_literal(default)
        || ((upper.starts_with("B'") || upper.starts_with("X'")) && default.ends_with('\''))
        || upper.starts_with("0X")
    {
        default.to_string()
    } else {
        format!("'{}'", escape_mysql(default))
    }
}

fn escape_mysql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

#[derive(sqlx::FromRow)]
struct IndexRow {
    index_name: String,
    column_name: Option<String>,
    non_unique: i64,
}

pub struct MysqlMeta {
    pool: MySqlPool,
}

impl MysqlMeta {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    fn push_name_filter(qb: &mut QueryBuilder<'_, MySql>, column: &str, names: &[String]) {
        qb.push(format!(" AND {} IN (", column));
        let mut separated = qb.separated(", ");
        for name in names {
            separated.push_bind(name.clone());
        }
        separated.push_unseparated(")");
    }

    fn column_ddl(&self, column: &Column) -> String {
        let mut ddl = format!("  {} {}", self.quote_identifier(&column.name), column.column_type);
        if let Some(generated) = &column.generated {
            ddl.push_str(&format!(
                " GENERATED ALWAYS AS ({}) {}",
                generated.expression,
                if generated.stored { "STORED" } else { "VIRTUAL" }
            ));
        }
        if !column.nullable {
            ddl.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            ddl.push_str(" DEFAULT ");
            ddl.push_str(default);
        } else if column.nullable && column.generated.is_none() {
            ddl.push_str(" DEFAULT NULL");
        }
        if column.is_identity {
            ddl.push_str(" AUTO_INCREMENT");
        }
        if !column.comment.is_empty() {
            ddl.push_str(&format!(" COMMENT '{}'", self.escape_string(&column.comment)));
        }
        ddl
    }
}

#[async_trait]
impl MetadataProvider for MysqlMeta {
    fn dialect(&self) -> &'static str {
        "mysql"
    }

    async fn get_tables(&self, names: &[String]) -> AppResult<Vec<Table>> {
        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT CAST(TABLE_NAME AS CHAR) AS table_name, CAST(IFNULL(TABLE_COMMENT, '') AS CHAR) AS table_comment \
             FROM information_schema.TABLES WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'",
        );
        if !names.is_empty() {
            Self::push_name_filter(&mut qb, "TABLE_NAME", names);
        }
        qb.push(" ORDER BY TABLE_NAME");

        let rows: Vec<TableRow> = qb
            .build_query_as()
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
        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT CAST(c.TABLE_NAME AS CHAR) AS table_name, CAST(c.COLUMN_NAME AS CHAR) AS column_name, \
             CAST(c.COLUMN_TYPE AS CHAR) AS column_type, CAST(c.IS_NULLABLE AS CHAR) AS is_nullable, \
             CAST(c.COLUMN_KEY AS CHAR) AS column_key, CAST(c.EXTRA AS CHAR) AS extra, \
             CAST(c.COLUMN_DEFAULT AS CHAR) AS column_default, CAST(IFNULL(c.COLUMN_COMMENT, '') AS CHAR) AS column_comment, \
             CAST(IFNULL(c.GENERATION_EXPRESSION, '') AS CHAR) AS generation_expression, \
             (SELECT CAST(s.SEQ_IN_INDEX AS SIGNED) FROM information_schema.STATISTICS s \
              WHERE s.TABLE_SCHEMA = c.TABLE_SCHEMA AND s.TABLE_NAME = c.TABLE_NAME \
                AND s.COLUMN_NAME = c.COLUMN_NAME AND s.INDEX_NAME = 'PRIMARY') AS pk_ordinal \
             FROM information_schema.COLUMNS c WHERE c.TABLE_SCHEMA = DATABASE()",
        );
        Self::push_name_filter(&mut qb, "c.TABLE_NAME", tables);
        qb.push(" ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION");

        let rows: Vec<ColumnRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(metadata_err)?;
        Ok(rows.into_iter().map(ColumnRow::into_column).collect())
    }

    async fn get_table_index(&self, table: &str) -> AppResult<Vec<Index>> {
        let rows: Vec<IndexRow> = sqlx::query_as(
            "SELECT CAST(INDEX_NAME AS CHAR) AS index_name, CAST(COLUMN_NAME AS CHAR) AS column_name, \
             CAST(NON_UNIQUE AS SIGNED) AS non_unique \
             FROM information_schema.STATISTICS WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(metadata_err)?;

        let mut indexes: Vec<Index> = Vec::new();
        for row in rows {
            let Some(column) = row.column_name else {
                continue;
            };
            match indexes.last_mut() {
                Some(index) if index.name == row.index_name => index.columns.push(column),
                _ => indexes.push(Index {
                    is_primary_key: row.index_name == "PRIMARY",
                    name: row.index_name,
                    columns: vec![column],
                    unique: row.non_unique == 0,
                }),
            }
        }
        Ok(indexes)
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_with(name, '`')
    }

    fn cast_to_text(&self, quoted_column: &str) -> String {
        format!("CAST({} AS CHAR)", quoted_column)
    }

    fn fetch_rows<'a>(
        &'a self,
        sql: &'a str,
        kinds: &'a [DataKind],
    ) -> BoxStream<'a, AppResult<Vec<DataValue>>> {
        sqlx::query(sql)
            .fetch(&self.pool)
            .map(move |row| {
                row.map_err(|e| common::errors::AppError::DatabaseQuery(e.to_string()))
                    .and_then(|row| decode_row(&row, kinds))
            })
            .boxed()
    }

    fn escape_string(&self, s: &str) -> String {
        escape_mysql(s)
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

        ddl.push_str(&format!("CREATE TABLE {} (\n{}\n)", quoted, lines.join(",\n")));
        if !table.comment.is_empty() {
            ddl.push_str(&format!(" COMMENT='{}'", self.escape_string(&table.comment)));
        }
        ddl.push(';');
        ddl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::mysql::MySqlPoolOptions;

    fn meta() -> MysqlMeta {
        let pool = MySqlPoolOptions::new()
            .connect_lazy("mysql://root@127.0.0.1:3306/test")
            .unwrap();
        MysqlMeta::new(pool)
    }

    fn column(name: &str, column_type: &str) -> Column {
        Column {
            table_name: "orders".into(),
            name: name.into(),
            column_type: column_type.into(),
            nullable: true,
            pk_ordinal: None,
            is_identity: false,
            default: None,
            generated: None,
            comment: String::new(),
        }
    }

    #[tokio::test]
    async fn test_ddl_has_auto_increment_and_comments() {
        let meta = meta();
        let mut id = column("id", "bigint unsigned");
        id.nullable = false;
        id.pk_ordinal = Some(1);
        id.is_identity = true;
        let mut status = column("status", "varchar(16)");
        status.default = Some("'new'".into());
        status.comment = "order's state".into();

        let table = Table {
            name: "orders".into(),
            comment: "订单".into(),
        };
        let ddl = meta.generate_table_ddl(&table, &[id, status], true);

        assert!(ddl.starts_with("DROP TABLE IF EXISTS `orders`;\nCREATE TABLE `orders` (\n"));
        assert!(ddl.contains("`id` bigint unsigned NOT NULL AUTO_INCREMENT"));
        assert!(ddl.contains("`status` varchar(16) DEFAULT 'new' COMMENT 'order''s state'"));
        assert!(ddl.contains("PRIMARY KEY (`id`)"));
        assert!(ddl.ends_with(") COMMENT='订单';"));
    }

    #[tokio::test]
    async fn test_values_escape_backslashes() {
        let meta = meta();
        assert_eq!(
            meta.wrap_value(&DataValue::Text(r"a\'b".into()), DataKind::String),
            r"'a\\''b'"
        );
        assert_eq!(meta.wrap_value(&DataValue::Text("42".into()), DataKind::Number), "42");
        assert_eq!(meta.wrap_value(&DataValue::Bytes(vec![1, 255]), DataKind::Blob), "X'01ff'");
        assert_eq!(
            meta.select_rows_sql("t", &[column("a", "int"), column("b", "blob")]),
            "SELECT CAST(`a` AS CHAR), `b` FROM `t`"
        );
    }

    fn row(name: &str, default: Option<&str>, extra: &str) -> ColumnRow {
        ColumnRow {
            table_name: "orders".into(),
            column_name: name.into(),
            column_type: "varchar(36)".into(),
            is_nullable: "NO".into(),
            column_key: String::new(),
            extra: extra.into(),
            column_default: default.map(String::from),
            column_comment: String::new(),
            generation_expression: String::new(),
            pk_ordinal: None,
        }
    }

    #[test]
    fn test_defaults_follow_extra() {
        let plain = row("status", Some("new"), "").into_column();
        assert_eq!(plain.default.as_deref(), Some("'new'"));

        let expr = row("uid", Some("uuid()"), "DEFAULT_GENERATED").into_column();
        assert_eq!(expr.default.as_deref(), Some("(uuid())"));

        let now = row("at", Some("CURRENT_TIMESTAMP"), "DEFAULT_GENERATED").into_column();
        assert_eq!(now.default.as_deref(), Some("CURRENT_TIMESTAMP"));

        let bit = row("flag", Some("b'0'"), "").into_column();
        assert_eq!(bit.default.as_deref(), Some("b'0'"));

        let number = row("qty", Some("0"), "").into_column();
        assert_eq!(number.default.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_generated_column_ddl() {
        let meta = meta();
        let mut total = row("total", None, "STORED GENERATED");
        total.column_type = "decimal(10,2)".into();
        total.generation_expression = "(`price` * `qty`)".into();
        let total = total.into_column();
        assert_eq!(
            total.generated,
            Some(Generated {
                expression: "(`price` * `qty`)".into(),
                stored: true
            })
        );
        assert!(meta
            .column_ddl(&total)
            .contains("`total` decimal(10,2) GENERATED ALWAYS AS ((`price` * `qty`)) STORED NOT NULL"));

        let mut upper = row("code_upper", None, "VIRTUAL GENERATED");
        upper.is_nullable = "YES".into();
        upper.generation_expression = "upper(`code`)".into();
        let ddl = meta.column_ddl(&upper.into_column());
        assert!(ddl.ends_with("GENERATED ALWAYS AS (upper(`code`)) VIRTUAL"));
    }

    #[tokio::test]
    async fn test_primary_key_uses_index_order() {
        let meta = meta();
        let mut a = row("a", None, "");
        a.column_key = "PRI".into();
        a.pk_ordinal = Some(2);
        let mut b = row("b", None, "");
        b.column_key = "PRI".into();
        b.pk_ordinal = Some(1);
        let table = Table {
            name: "orders".into(),
            comment: String::new(),
        };
        let ddl = meta.generate_table_ddl(&table, &[a.into_column(), b.into_column()], false);
        assert!(ddl.contains("  PRIMARY KEY (`b`, `a`)\n)"));
    }
}
