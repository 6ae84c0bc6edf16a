//! SQL dump engine.
//!
//! Walks table metadata through a [`MetadataProvider`] and writes, per table in
//! name order: structure, rows, then secondary indexes. Rows are streamed and
//! the output is flushed in bounded chunks, so memory use does not depend on
//! table size.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use common::errors::{AppError, AppResult};
use futures::TryStreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::dbm::{Column, DataKind, Index, MetadataProvider};

/// Buffered SQL text sink.
pub struct SqlWriter<W> {
    inner: W,
    buf: String,
    flush_bytes: usize,
}

impl<W: AsyncWrite + Unpin + Send> SqlWriter<W> {
    /// `flush_bytes` is the buffered size that triggers a flush.
    pub fn new(inner: W, flush_bytes: usize) -> Self {
        Self {
            inner,
            buf: String::with_capacity(flush_bytes.min(1 << 20)),
            flush_bytes: flush_bytes.max(1),
        }
    }

    pub async fn write_str(&mut self, s: &str) -> AppResult<()> {
        self.buf.push_str(s);
        if self.buf.len() >= self.flush_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> AppResult<()> {
        if !self.buf.is_empty() {
            self.inner
                .write_all(self.buf.as_bytes())
                .await
                .map_err(io_err)?;
            self.buf.clear();
        }
        self.inner.flush().await.map_err(io_err)
    }

    /// Flushes and shuts the sink down.
    pub async fn finish(mut self) -> AppResult<W> {
        self.flush().await?;
        self.inner.shutdown().await.map_err(io_err)?;
        Ok(self.inner)
    }
}

fn io_err(e: std::io::Error) -> AppError {
    AppError::Internal(format!("写入导出数据失败: {}", e))
}

/// What to dump.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// Table subset; empty dumps every table.
    pub tables: Vec<String>,
    pub dump_ddl: bool,
    pub dump_data: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub tables: usize,
    pub rows: u64,
}

fn banner(title: &str, table: &str) -> String {
    format!(
        "\n-- ----------------------------\n-- {}: {} \n-- ----------------------------\n",
        title, table
    )
}

pub async fn write_header<W: AsyncWrite + Unpin + Send>(
    writer: &mut SqlWriter<W>,
    platform: &str,
    db_name: &str,
    now: NaiveDateTime,
) -> AppResult<()> {
    writer
        .write_str(&format!(
            "\n-- ----------------------------\n-- 导出平台: {}\n-- 导出时间: {} \n-- 导出数据库: {} \n-- ----------------------------\n\n",
            platform,
            now.format("%Y-%m-%d %H:%M:%S"),
            db_name
        ))
        .await
}

/// Dumps the selected tables.
///
/// Errors abort the dump; what was already written stays written.
/// Cancellation is observed between tables and between rows.
pub async fn dump_tables<W: AsyncWrite + Unpin + Send>(
    meta: &dyn MetadataProvider,
    opts: &DumpOptions,
    writer: &mut SqlWriter<W>,
    cancel: &CancellationToken,
) -> AppResult<DumpStats> {
    let mut tables = if opts.tables.is_empty() {
        let all = meta.get_tables(&[]).await?;
        if all.is_empty() {
            return Err(AppError::MetadataFetchFailed("数据库中没有可导出的表".into()));
        }
        all.into_iter().map(|t| t.name).collect()
    } else {
        opts.tables.clone()
    };
    tables.sort();
    tables.dedup();

    let mut column_map: HashMap<String, Vec<Column>> = HashMap::new();
    for column in meta.get_columns(&tables).await? {
        column_map
            .entry(column.table_name.clone())
            .or_default()
            .push(column);
    }

    let mut stats = DumpStats::default();
    for table_name in &tables {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        writer.flush().await?;

        let table = meta
            .get_tables(std::slice::from_ref(table_name))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::MetadataFetchFailed(format!("获取表信息失败：{}", table_name)))?;
        let columns = column_map
            .get(table_name)
            .map(Vec::as_slice)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::MetadataFetchFailed(format!("获取表列信息失败：{}", table_name)))?;

        if opts.dump_ddl {
            writer.write_str(&banner("表结构", table_name)).await?;
            writer
                .write_str(&meta.generate_table_ddl(&table, columns, true))
                .await?;
            writer.write_str("\n").await?;
        }

        // Rows go before indexes so the target does not maintain them per insert.
        if opts.dump_data {
            let insertable: Vec<Column> = columns
                .iter()
                .filter(|c| c.generated.is_none())
                .cloned()
                .collect();
            writer.write_str(&banner("表记录", table_name)).await?;
            stats.rows += dump_rows(meta, table_name, &insertable, writer, cancel).await?;
        }

        let indexes: Vec<Index> = meta
            .get_table_index(table_name)
            .await?
            .into_iter()
            .filter(|i| !i.is_primary_key)
            .collect();
        if !indexes.is_empty() {
            writer.write_str(&banner("表索引", table_name)).await?;
            for ddl in meta.generate_index_ddl(table_name, &indexes) {
                writer.write_str(&ddl).await?;
                writer.write_str("\n").await?;
            }
        }

        stats.tables += 1;
        tracing::debug!(table = %table_name, "表导出完成");
    }

    writer.flush().await?;
    Ok(stats)
}

async fn dump_rows<W: AsyncWrite + Unpin + Send>(
    meta: &dyn MetadataProvider,
    table_name: &str,
    columns: &[Column],
    writer: &mut SqlWriter<W>,
    cancel: &CancellationToken,
) -> AppResult<u64> {
    for stmt in meta.before_insert(table_name, columns) {
        writer.write_str(&stmt).await?;
        writer.write_str("\n").await?;
    }

    let quoted_table = meta.quote_identifier(table_name);
    let column_list = columns
        .iter()
        .map(|c| meta.quote_identifier(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let kinds: Vec<DataKind> = columns
        .iter()
        .map(|c| meta.data_kind(&c.column_type))
        .collect();
    let sql = meta.select_rows_sql(table_name, columns);

    let mut count = 0u64;
    let mut rows = meta.fetch_rows(&sql, &kinds);
    loop {
        let row = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            row = rows.try_next() => row?,
        };
        let Some(row) = row else {
            break;
        };

        let values: Vec<String> = row
            .iter()
            .zip(&kinds)
            .map(|(value, kind)| meta.wrap_value(value, *kind))
            .collect();
        writer
            .write_str(&format!(
                "INSERT INTO {} ({}) values({});\n",
                quoted_table,
                column_list,
                values.join(", ")
            ))
            .await?;
        count += 1;
    }
    drop(rows);

    for stmt in meta.after_insert(table_name, columns) {
        writer.write_str(&stmt).await?;
        writer.write_str("\n").await?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbm::meta::quote_with;
    use crate::dbm::{DataValue, Generated, SqliteMeta, Table};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use futures::stream::{self, BoxStream, StreamExt};
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    struct FakeMeta {
        tables: Vec<&'static str>,
        rows: HashMap<&'static str, Vec<Vec<DataValue>>>,
        /// Cancels the token once this many rows were handed out.
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl FakeMeta {
        fn new() -> Self {
            let mut rows = HashMap::new();
            rows.insert(
                "b_orders",
                vec![vec![DataValue::Text("1".into()), DataValue::Text("it's".into())]],
            );
            rows.insert(
                "a_users",
                vec![
                    vec![DataValue::Text("1".into()), DataValue::Null],
                    vec![DataValue::Text("2".into()), DataValue::Text("bob".into())],
                ],
            );
            Self {
                tables: vec!["b_orders", "a_users"],
                rows,
                cancel_after: None,
            }
        }
    }

    #[async_trait]
    impl MetadataProvider for FakeMeta {
        fn dialect(&self) -> &'static str {
            "fake"
        }

        async fn get_tables(&self, names: &[String]) -> AppResult<Vec<Table>> {
            Ok(self
                .tables
                .iter()
                .filter(|t| names.is_empty() || names.iter().any(|n| n == *t))
                .map(|t| Table {
                    name: t.to_string(),
                    comment: String::new(),
                })
                .collect())
        }

        async fn get_columns(&self, tables: &[String]) -> AppResult<Vec<Column>> {
            let mut columns = Vec::new();
            for table in tables {
                for (name, column_type) in [("id", "int"), ("label", "varchar(10)"), ("tag", "varchar(10)")] {
                    columns.push(Column {
                        table_name: table.clone(),
                        name: name.into(),
                        column_type: column_type.into(),
                        nullable: name != "id",
                        pk_ordinal: (name == "id").then_some(1),
                        is_identity: false,
                        default: None,
                        generated: (name == "tag").then(|| Generated {
                            expression: "upper(label)".into(),
                            stored: false,
                        }),
                        comment: String::new(),
                    });
                }
            }
            Ok(columns)
        }

        async fn get_table_index(&self, table: &str) -> AppResult<Vec<Index>> {
            Ok(vec![
                Index {
                    name: "PRIMARY".into(),
                    columns: vec!["id".into()],
                    unique: true,
                    is_primary_key: true,
                },
                Index {
                    name: format!("idx_{}_label", table),
                    columns: vec!["label".into()],
                    unique: false,
                    is_primary_key: false,
                },
            ])
        }

        fn quote_identifier(&self, name: &str) -> String {
            quote_with(name, '"')
        }

        fn cast_to_text(&self, quoted_column: &str) -> String {
            quoted_column.to_string()
        }

        fn fetch_rows<'a>(
            &'a self,
            sql: &'a str,
            _kinds: &'a [DataKind],
        ) -> BoxStream<'a, AppResult<Vec<DataValue>>> {
            let rows = self
                .rows
                .iter()
                .find(|(table, _)| sql.ends_with(&format!("\"{}\"", table)))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default();
            let cancel_after = self.cancel_after.clone();
            stream::iter(rows.into_iter().enumerate().map(move |(i, row)| {
                if let Some((n, token)) = &cancel_after {
                    if i + 1 >= *n {
                        token.cancel();
                    }
                }
                Ok(row)
            }))
            .boxed()
        }

        fn generate_table_ddl(&self, table: &Table, columns: &[Column], _drop: bool) -> String {
            format!("CREATE TABLE \"{}\" ({} columns);", table.name, columns.len())
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap()
    }

    fn all_tables() -> DumpOptions {
        DumpOptions {
            tables: Vec::new(),
            dump_ddl: true,
            dump_data: true,
        }
    }

    async fn dump_to_string(meta: &dyn MetadataProvider, opts: &DumpOptions) -> AppResult<String> {
        let mut writer = SqlWriter::new(Vec::new(), 64);
        write_header(&mut writer, "db-manager", "shop", now()).await?;
        dump_tables(meta, opts, &mut writer, &CancellationToken::new()).await?;
        let bytes = writer.finish().await?;
        Ok(String::from_utf8(bytes).unwrap())
    }

    #[tokio::test]
    async fn test_header_format() {
        let meta = FakeMeta::new();
        let out = dump_to_string(&meta, &all_tables()).await.unwrap();
        assert!(out.starts_with(
            "\n-- ----------------------------\n-- 导出平台: db-manager\n-- 导出时间: 2024-01-02 03:04:05 \n-- 导出数据库: shop \n-- ----------------------------\n\n"
        ));
    }

    #[tokio::test]
    async fn test_tables_sorted_and_blocks_ordered() {
        let meta = FakeMeta::new();
        let out = dump_to_string(&meta, &all_tables()).await.unwrap();

        let positions: Vec<usize> = [
            "-- 表结构: a_users ",
            "-- 表记录: a_users ",
            "-- 表索引: a_users ",
            "-- 表结构: b_orders ",
            "-- 表记录: b_orders ",
            "-- 表索引: b_orders ",
        ]
        .iter()
        .map(|marker| out.find(marker).unwrap_or_else(|| panic!("missing {marker}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        assert!(out.contains("INSERT INTO \"a_users\" (\"id\", \"label\") values(1, NULL);\n"));
        assert!(out.contains("INSERT INTO \"b_orders\" (\"id\", \"label\") values(1, 'it''s');\n"));
        assert!(out.contains("CREATE INDEX \"idx_a_users_label\" ON \"a_users\" (\"label\");"));
        assert!(!out.contains("\"PRIMARY\""));
    }

    #[tokio::test]
    async fn test_dump_is_deterministic() {
        let meta = FakeMeta::new();
        let first = dump_to_string(&meta, &all_tables()).await.unwrap();
        let second = dump_to_string(&meta, &all_tables()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_flags_select_blocks() {
        let meta = FakeMeta::new();
        let opts = DumpOptions {
            tables: vec!["b_orders".into()],
            dump_ddl: false,
            dump_data: true,
        };
        let out = dump_to_string(&meta, &opts).await.unwrap();
        assert!(!out.contains("表结构"));
        assert!(out.contains("-- 表记录: b_orders "));
        assert!(!out.contains("a_users"));
    }

    #[tokio::test]
    async fn test_no_tables_fails_fast() {
        let mut meta = FakeMeta::new();
        meta.tables.clear();
        let err = dump_to_string(&meta, &all_tables()).await.unwrap_err();
        assert!(matches!(err, AppError::MetadataFetchFailed(_)));
    }

    #[tokio::test]
    async fn test_unknown_table_is_fatal() {
        let meta = FakeMeta::new();
        let opts = DumpOptions {
            tables: vec!["ghost".into()],
            dump_ddl: true,
            dump_data: true,
        };
        let err = dump_to_string(&meta, &opts).await.unwrap_err();
        assert!(err.to_string().contains("获取表信息失败：ghost"));
    }

    #[tokio::test]
    async fn test_cancelled_dump_stops() {
        let meta = FakeMeta::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut writer = SqlWriter::new(Vec::new(), 64);
        let err = dump_tables(&meta, &all_tables(), &mut writer, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_between_rows_leaves_whole_statements() {
        let cancel = CancellationToken::new();
        let mut meta = FakeMeta::new();
        meta.rows.insert(
            "a_users",
            (1..=10)
                .map(|i| vec![DataValue::Text(i.to_string()), DataValue::Text(format!("user {i}"))])
                .collect(),
        );
        meta.cancel_after = Some((3, cancel.clone()));

        let mut writer = SqlWriter::new(Vec::new(), 16);
        let err = dump_tables(&meta, &all_tables(), &mut writer, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));

        writer.flush().await.unwrap();
        let out = String::from_utf8(writer.inner).unwrap();
        assert!(out.ends_with(";\n"));
        assert_eq!(out.matches("INSERT INTO").count(), 3);
        assert!(out.ends_with("INSERT INTO \"a_users\" (\"id\", \"label\") values(3, 'user 3');\n"));
        assert!(!out.contains("b_orders"));
    }

    #[tokio::test]
    async fn test_writer_flushes_at_threshold() {
        let mut writer = SqlWriter::new(Vec::new(), 4);
        writer.write_str("ab").await.unwrap();
        assert!(writer.inner.is_empty());
        writer.write_str("cdef").await.unwrap();
        assert_eq!(writer.inner, b"abcdef");
        assert!(writer.buf.is_empty());
    }

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    type UserRow = (i64, String, Option<f64>, Option<Vec<u8>>, Option<String>, Option<String>);

    async fn users(pool: &SqlitePool) -> Vec<UserRow> {
        sqlx::query_as("SELECT id, name, score, avatar, note, created_at FROM users ORDER BY id")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let source = memory_pool().await;
        sqlx::raw_sql(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT 'anon',
                email TEXT UNIQUE,
                score REAL,
                avatar BLOB,
                note TEXT,
                created_at DATETIME
             );
             CREATE INDEX idx_users_name ON users (name);
             INSERT INTO users (id, name, email, score, avatar, note, created_at) VALUES
                (1, 'O''Brien', 'ob@example.com', 2.5, X'0001ff', 'line1\nline2', '2024-01-02 03:04:05'),
                (2, 'plain', NULL, NULL, NULL, NULL, NULL),
                (7, 'neg', 'n@example.com', -10.25, X'10', '  padded  ', '2023-12-31 23:59:59'),
                (9, 'sum', 's@example.com', 0.1 + 0.2, NULL, NULL, NULL);
             CREATE TABLE pairs (a INTEGER NOT NULL, b TEXT NOT NULL, w REAL, PRIMARY KEY (b, a));
             INSERT INTO pairs VALUES (1, 'x', 1.0 / 3), (2, 'x', 100.0);",
        )
        .execute(&source)
        .await
        .unwrap();

        let meta = SqliteMeta::new(source.clone());
        let mut writer = SqlWriter::new(Vec::new(), 16);
        write_header(&mut writer, "db-manager", "main", now()).await.unwrap();
        let stats = dump_tables(&meta, &all_tables(), &mut writer, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, DumpStats { tables: 2, rows: 6 });
        let dump = String::from_utf8(writer.finish().await.unwrap()).unwrap();
        assert!(dump.contains("PRIMARY KEY (\"b\", \"a\")"));

        let target = memory_pool().await;
        sqlx::raw_sql(&dump).execute(&target).await.unwrap();

        let source_users = users(&source).await;
        assert_eq!(source_users[3].2, Some(0.1 + 0.2));
        assert_eq!(source_users, users(&target).await);

        let pairs_sql = "SELECT a, b, w FROM pairs ORDER BY a";
        let source_pairs: Vec<(i64, String, f64)> =
            sqlx::query_as(pairs_sql).fetch_all(&source).await.unwrap();
        let target_pairs: Vec<(i64, String, f64)> =
            sqlx::query_as(pairs_sql).fetch_all(&target).await.unwrap();
        assert_eq!(source_pairs, target_pairs);

        let key_order = "SELECT name FROM pragma_table_info('pairs') WHERE pk > 0 ORDER BY pk";
        let target_key: Vec<(String,)> = sqlx::query_as(key_order).fetch_all(&target).await.unwrap();
        assert_eq!(target_key, vec![("b".to_string(),), ("a".to_string(),)]);

        let target_indexes: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_index_list('users') ORDER BY name")
                .fetch_all(&target)
                .await
                .unwrap();
        let names: Vec<&str> = target_indexes.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["idx_users_name", "users_uk_1"]);
    }
}
