use super::{
    CatalogColumn, CatalogForeignKey, DataStoreError, DataStoreMapping, Row, SourceHandle,
    StatementId, TableDescription, Value,
};
use async_trait::async_trait;
use log::{debug, warn};
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags, ToSql};
use sqlparser::dialect::SQLiteDialect;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Aggregate registered on every connection; returns the first value of its group
pub const FIRST_VALUE_FUNCTION: &str = "chart_first";

pub struct SqliteMapping;

impl DataStoreMapping for SqliteMapping {
    fn get_dialect(&self) -> &dyn sqlparser::dialect::Dialect {
        &SQLiteDialect {}
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn first_value(&self, quoted_column: &str) -> String {
        format!("{}({})", FIRST_VALUE_FUNCTION, quoted_column)
    }
}

struct FirstValue;

impl Aggregate<Option<SqlValue>, SqlValue> for FirstValue {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Option<SqlValue>> {
        Ok(None)
    }

    fn step(&self, ctx: &mut Context<'_>, first: &mut Option<SqlValue>) -> rusqlite::Result<()> {
        if first.is_none() {
            *first = Some(ctx.get::<SqlValue>(0)?);
        }
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        first: Option<Option<SqlValue>>,
    ) -> rusqlite::Result<SqlValue> {
        Ok(first.flatten().unwrap_or(SqlValue::Null))
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn value_from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

/// Statements waiting for the connection and the one holding it
#[derive(Default)]
struct Statements {
    queued: HashSet<StatementId>,
    running: Option<StatementId>,
}

/// Read-only SQLite source.
///
/// The connection sits behind a mutex and every statement runs on tokio's
/// blocking pool, so one statement is in flight at a time. `Statements` is
/// only ever locked briefly, never while waiting for the connection.
pub struct SqliteSource {
    conn: Arc<Mutex<Connection>>,
    statements: Arc<Mutex<Statements>>,
    interrupt: InterruptHandle,
    mapping: SqliteMapping,
}

fn poisoned<T>(_: T) -> DataStoreError {
    DataStoreError::Unavailable("SQLite source lock poisoned".to_string())
}

impl SqliteSource {
    /// Open the database file at `path` read-only
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DataStoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            DataStoreError::ConnectionError(format!(
                "Failed to open {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!("Opened SQLite source at {}", path.display());
        Self::from_connection(conn)
    }

    /// Wrap an existing connection, switching it to query-only mode
    pub fn from_connection(conn: Connection) -> Result<Self, DataStoreError> {
        conn.execute_batch("PRAGMA query_only = ON;")
            .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;
        conn.create_aggregate_function(
            FIRST_VALUE_FUNCTION,
            1,
            FunctionFlags::SQLITE_UTF8,
            FirstValue,
        )
        .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;
        let interrupt = conn.get_interrupt_handle();

        Ok(SqliteSource {
            conn: Arc::new(Mutex::new(conn)),
            statements: Arc::new(Mutex::new(Statements::default())),
            interrupt,
            mapping: SqliteMapping,
        })
    }

    async fn with_connection<T, F>(&self, statement: StatementId, f: F) -> Result<T, DataStoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.statements.lock().map_err(poisoned)?.queued.insert(statement);

        let conn = Arc::clone(&self.conn);
        let statements = Arc::clone(&self.statements);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(poisoned)?;
            {
                let mut statements = statements.lock().map_err(poisoned)?;
                if !statements.queued.remove(&statement) {
                    debug!("Skipping statement {}, cancelled while queued", statement);
                    return Err(DataStoreError::Cancelled(statement));
                }
                statements.running = Some(statement);
            }

            let result = f(&conn).map_err(|e| {
                if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
                    warn!("SQLite statement {} interrupted", statement);
                }
                DataStoreError::QueryError(e.to_string())
            });

            // cleared before the connection is released
            if let Ok(mut statements) = statements.lock() {
                statements.running = None;
            }
            result
        })
        .await
        .map_err(|e| DataStoreError::Unavailable(e.to_string()))?
    }
}

fn catalog_error(e: DataStoreError) -> DataStoreError {
    match e {
        DataStoreError::QueryError(message) => DataStoreError::CatalogError(message),
        other => other,
    }
}

#[async_trait]
impl SourceHandle for SqliteSource {
    fn mapping(&self) -> &dyn DataStoreMapping {
        &self.mapping
    }

    async fn list_tables(&self) -> Result<Vec<String>, DataStoreError> {
        self.with_connection(StatementId::next(), |conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )?;
            let tables = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tables)
        })
        .await
        .map_err(catalog_error)
    }

    async fn describe_table(&self, table: &str) -> Result<TableDescription, DataStoreError> {
        let table = table.to_string();
        self.with_connection(StatementId::next(), move |conn| {
            let mut col_stmt = conn.prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
            )?;
            let columns = col_stmt
                .query_map([&table], |row| {
                    let notnull: i64 = row.get(2)?;
                    let pk: i64 = row.get(3)?;
                    Ok(CatalogColumn {
                        name: row.get(0)?,
                        declared_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        not_null: notnull != 0,
                        primary_key: pk != 0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut fk_stmt = conn.prepare(
                "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
            )?;
            let foreign_keys = fk_stmt
                .query_map([&table], |row| {
                    Ok(CatalogForeignKey {
                        column: row.get(0)?,
                        references_table: row.get(1)?,
                        // NULL when the parent's primary key is referenced implicitly
                        references_column: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(TableDescription {
                columns,
                foreign_keys,
            })
        })
        .await
        .map_err(catalog_error)
    }

    async fn query(
        &self,
        statement: StatementId,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, DataStoreError> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(statement, move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Arc<[String]> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();

            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let values = (0..columns.len())
                    .map(|i| row.get_ref(i).map(value_from_sqlite))
                    .collect::<Result<Vec<_>, _>>()?;
                out.push(Row::new(Arc::clone(&columns), values));
            }
            Ok(out)
        })
        .await
    }

    async fn cancel(&self, statement: StatementId) {
        let Ok(mut statements) = self.statements.lock() else {
            warn!("Cannot cancel statement {}, source lock poisoned", statement);
            return;
        };
        if statements.queued.remove(&statement) {
            debug!("Statement {} cancelled before it started", statement);
        } else if statements.running == Some(statement) {
            warn!("Interrupting SQLite statement {}", statement);
            self.interrupt.interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::time::Duration;

    #[fixture]
    fn source() -> SqliteSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE regions (id INTEGER PRIMARY KEY, label TEXT NOT NULL);
             CREATE TABLE sales (
                 id INTEGER PRIMARY KEY,
                 region_id INTEGER REFERENCES regions(id),
                 amount REAL,
                 sold_on DATE
             );
             INSERT INTO regions VALUES (1, 'East'), (2, 'West');
             INSERT INTO sales VALUES (1, 1, 10.0, '2024-01-01'), (2, 1, 5.5, '2024-01-02'),
                                      (3, 2, 7.0, '2024-01-03');",
        )
        .unwrap();
        SqliteSource::from_connection(conn).unwrap()
    }

    #[test]
    fn test_placeholder_is_numbered() {
        assert_eq!(SqliteMapping.placeholder(3), "?3");
        assert_eq!(SqliteMapping.quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[rstest]
    #[tokio::test]
    async fn test_list_tables(source: SqliteSource) {
        assert_eq!(source.list_tables().await.unwrap(), vec!["regions", "sales"]);
    }

    #[rstest]
    #[tokio::test]
    async fn test_describe_table_keeps_declaration_order(source: SqliteSource) {
        let description = source.describe_table("sales").await.unwrap();
        let names: Vec<_> = description.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "region_id", "amount", "sold_on"]);
        assert!(description.columns[0].primary_key);
        assert_eq!(description.columns[3].declared_type, "DATE");
        assert_eq!(
            description.foreign_keys,
            vec![CatalogForeignKey {
                column: "region_id".to_string(),
                references_table: "regions".to_string(),
                references_column: "id".to_string(),
            }]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_query_binds_parameters(source: SqliteSource) {
        let rows = source
            .query(
                StatementId::next(),
                "SELECT id, amount FROM sales WHERE amount > ?1 ORDER BY id",
                &[Value::Float(6.0)],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("amount"), Some(&Value::Float(7.0)));
    }

    #[rstest]
    #[tokio::test]
    async fn test_first_value_aggregate(source: SqliteSource) {
        let rows = source
            .query(
                StatementId::next(),
                "SELECT region_id, chart_first(amount) AS amount FROM sales GROUP BY region_id ORDER BY region_id",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(rows[0].get("amount"), Some(&Value::Float(10.0)));
        assert_eq!(rows[1].get("amount"), Some(&Value::Float(7.0)));
    }

    #[rstest]
    #[tokio::test]
    async fn test_writes_are_refused_by_the_connection(source: SqliteSource) {
        let result = source.query(StatementId::next(), "DELETE FROM sales", &[]).await;
        assert!(matches!(result, Err(DataStoreError::QueryError(_))));
    }

    const SLOW_COUNT_SQL: &str = "SELECT count(*) AS n FROM grid a, grid b, grid c";

    /// 300 rows; joining three copies takes a noticeable while
    fn slow_source() -> Arc<SqliteSource> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE grid (i INTEGER);
             WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 300)
             INSERT INTO grid SELECT i FROM n;",
        )
        .unwrap();
        Arc::new(SqliteSource::from_connection(conn).unwrap())
    }

    fn spawn_query(
        source: &Arc<SqliteSource>,
        statement: StatementId,
        sql: &'static str,
    ) -> tokio::task::JoinHandle<Result<Vec<Row>, DataStoreError>> {
        let source = Arc::clone(source);
        tokio::spawn(async move { source.query(statement, sql, &[]).await })
    }

    #[tokio::test]
    async fn test_cancel_interrupts_the_running_statement() {
        let source = slow_source();
        let statement = StatementId::next();
        let slow = spawn_query(&source, statement, SLOW_COUNT_SQL);
        tokio::time::sleep(Duration::from_millis(50)).await;

        source.cancel(statement).await;
        assert!(matches!(slow.await.unwrap(), Err(DataStoreError::QueryError(_))));
    }

    #[tokio::test]
    async fn test_cancel_of_a_queued_statement_leaves_the_running_one_alone() {
        let source = slow_source();
        let slow = spawn_query(&source, StatementId::next(), SLOW_COUNT_SQL);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queued = StatementId::next();
        let fast = spawn_query(&source, queued, "SELECT 1 AS one");
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel(queued).await;

        let rows = slow.await.unwrap().unwrap();
        assert_eq!(rows[0].get("n"), Some(&Value::Int(27_000_000)));
        assert!(matches!(
            fast.await.unwrap(),
            Err(DataStoreError::Cancelled(id)) if id == queued
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_cancel_after_completion_is_harmless(source: SqliteSource) {
        let statement = StatementId::next();
        source.query(statement, "SELECT 1", &[]).await.unwrap();
        source.cancel(statement).await;

        let rows = source.query(StatementId::next(), "SELECT 2 AS two", &[]).await.unwrap();
        assert_eq!(rows[0].get("two"), Some(&Value::Int(2)));
    }
}
