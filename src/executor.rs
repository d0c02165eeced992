use crate::config::QueryConfig;
use crate::data_store::{Row, SourceHandle, StatementId, Value};
use log::{debug, warn};
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::Dialect;
use sqlparser::parser::Parser;
use std::time::Duration;
use thiserror::Error;

/// Leading keywords of statements that can only read
const READ_ONLY_KEYWORDS: &[&str] = &["SELECT", "PRAGMA"];

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Only read-only statements are allowed, got {0}")]
    WriteNotAllowed(String),

    #[error("Store failure: {0}")]
    StoreFailure(String),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::WriteNotAllowed(_) => "WriteNotAllowed",
            ExecutionError::StoreFailure(_) => "StoreFailure",
            ExecutionError::Timeout(_) => "Timeout",
        }
    }
}

/// First keyword of `sql`, uppercased, after whitespace and comments
fn leading_keyword(sql: &str) -> String {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }
    rest.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase()
}

/// Reject anything that is not a single read-only statement.
///
/// The keyword check is static; the parse catches stacked statements and
/// `SELECT ... INTO`, which would create a table.
pub fn ensure_read_only(sql: &str, dialect: &dyn Dialect) -> Result<(), ExecutionError> {
    let keyword = leading_keyword(sql);
    if !READ_ONLY_KEYWORDS.contains(&keyword.as_str()) {
        warn!("Rejected statement starting with {:?}", keyword);
        let keyword = if keyword.is_empty() {
            "an empty statement".to_string()
        } else {
            keyword
        };
        return Err(ExecutionError::WriteNotAllowed(keyword));
    }

    let statements = Parser::parse_sql(dialect, sql)
        .map_err(|e| ExecutionError::StoreFailure(format!("Statement could not be parsed: {}", e)))?;

    match statements.as_slice() {
        [Statement::Query(query)] => match query.body.as_ref() {
            SetExpr::Select(select) if select.into.is_some() => {
                warn!("Rejected SELECT ... INTO statement");
                Err(ExecutionError::WriteNotAllowed("SELECT INTO".to_string()))
            }
            _ => Ok(()),
        },
        [Statement::Pragma { is_eq: false, .. }] => Ok(()),
        [Statement::Pragma { .. }] => Err(ExecutionError::WriteNotAllowed("PRAGMA assignment".to_string())),
        [_] => Err(ExecutionError::WriteNotAllowed(keyword)),
        _ => {
            warn!("Rejected {} stacked statements", statements.len());
            Err(ExecutionError::WriteNotAllowed("multiple statements".to_string()))
        }
    }
}

/// Runs built statements against a handle with read-only, timeout and row-count protection.
/// Nothing is retried here.
pub struct QueryExecutor {
    timeout: Duration,
    max_rows: usize,
}

impl QueryExecutor {
    pub fn new(config: &QueryConfig) -> Self {
        QueryExecutor {
            timeout: config.timeout(),
            max_rows: config.max_rows,
        }
    }

    pub async fn execute(
        &self,
        handle: &dyn SourceHandle,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, ExecutionError> {
        ensure_read_only(sql, handle.mapping().get_dialect())?;

        let statement = StatementId::next();
        let pending = handle.query(statement, sql, params);
        let mut rows = match tokio::time::timeout(self.timeout, pending).await {
            Ok(result) => result.map_err(|e| ExecutionError::StoreFailure(e.to_string()))?,
            Err(_) => {
                warn!("Statement {} exceeded {:?}, cancelling", statement, self.timeout);
                handle.cancel(statement).await;
                return Err(ExecutionError::Timeout(self.timeout));
            }
        };

        if rows.len() > self.max_rows {
            warn!(
                "Query returned {} rows, truncating to {}",
                rows.len(),
                self.max_rows
            );
            rows.truncate(self.max_rows);
        }
        debug!("Query returned {} rows", rows.len());
        Ok(rows)
    }

    /// Run a single-value count statement and read its total
    pub async fn count(
        &self,
        handle: &dyn SourceHandle,
        sql: &str,
        params: &[Value],
    ) -> Result<u64, ExecutionError> {
        let rows = self.execute(handle, sql, params).await?;
        let total = rows
            .first()
            .and_then(|row| row.values.first())
            .and_then(|value| match value {
                Value::Int(i) => u64::try_from(*i).ok(),
                Value::Float(f) if *f >= 0.0 => Some(*f as u64),
                _ => None,
            });
        total.ok_or_else(|| ExecutionError::StoreFailure("Count query returned no total".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::{
        DataStoreError, DataStoreMapping, SqliteMapping, TableDescription,
    };
    use async_trait::async_trait;
    use rstest::*;
    use sqlparser::dialect::{PostgreSqlDialect, SQLiteDialect};
    use std::sync::{Arc, Mutex};

    struct ScriptedSource {
        delay: Duration,
        rows: usize,
        fail: bool,
        submitted: Mutex<Vec<StatementId>>,
        cancelled: Mutex<Vec<StatementId>>,
    }

    impl ScriptedSource {
        fn new(delay: Duration, rows: usize) -> Self {
            ScriptedSource {
                delay,
                rows,
                fail: false,
                submitted: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
            }
        }

        fn submitted(&self) -> Vec<StatementId> {
            self.submitted.lock().unwrap().clone()
        }

        fn cancelled(&self) -> Vec<StatementId> {
            self.cancelled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SourceHandle for ScriptedSource {
        fn mapping(&self) -> &dyn DataStoreMapping {
            &SqliteMapping
        }

        async fn list_tables(&self) -> Result<Vec<String>, DataStoreError> {
            Ok(vec![])
        }

        async fn describe_table(&self, _table: &str) -> Result<TableDescription, DataStoreError> {
            Ok(TableDescription::default())
        }

        async fn query(
            &self,
            statement: StatementId,
            _sql: &str,
            _params: &[Value],
        ) -> Result<Vec<Row>, DataStoreError> {
            self.submitted.lock().unwrap().push(statement);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(DataStoreError::QueryError("disk I/O error".to_string()));
            }
            let columns: Arc<[String]> = vec!["n".to_string()].into();
            Ok((0..self.rows)
                .map(|i| Row::new(Arc::clone(&columns), vec![Value::Int(i as i64)]))
                .collect())
        }

        async fn cancel(&self, statement: StatementId) {
            self.cancelled.lock().unwrap().push(statement);
        }
    }

    fn executor(timeout_ms: u64, max_rows: usize) -> QueryExecutor {
        QueryExecutor::new(&QueryConfig {
            timeout_ms,
            max_rows,
            ..QueryConfig::default()
        })
    }

    #[rstest]
    #[case::select("SELECT \"a\" FROM \"t\" WHERE \"a\" = ?1 LIMIT ?2 OFFSET ?3")]
    #[case::lowercase("select a from t")]
    #[case::comment_first("-- page 2\n/* chart */ SELECT a FROM t")]
    #[case::pragma("PRAGMA table_info('t')")]
    fn test_read_only_statements_pass(#[case] sql: &str) {
        assert!(ensure_read_only(sql, &SQLiteDialect {}).is_ok());
    }

    #[rstest]
    #[case::update("UPDATE employees SET salary = 60000 WHERE employee_id = 101;", "UPDATE")]
    #[case::insert("INSERT INTO t VALUES (1)", "INSERT")]
    #[case::delete("  delete from t", "DELETE")]
    #[case::drop("DROP TABLE t", "DROP")]
    #[case::cte("WITH x AS (SELECT 1) SELECT * FROM x", "WITH")]
    #[case::stacked("SELECT 1; DROP TABLE t", "multiple statements")]
    #[case::pragma_assignment("PRAGMA query_only = 0", "PRAGMA assignment")]
    #[case::empty("   ", "an empty statement")]
    fn test_writes_are_rejected(#[case] sql: &str, #[case] reported: &str) {
        match ensure_read_only(sql, &SQLiteDialect {}) {
            Err(ExecutionError::WriteNotAllowed(keyword)) => assert_eq!(keyword, reported),
            other => panic!("expected WriteNotAllowed, got {:?}", other),
        }
    }

    #[test]
    fn test_select_into_is_rejected() {
        let result = ensure_read_only("SELECT * INTO backup FROM t", &PostgreSqlDialect {});
        assert!(matches!(result, Err(ExecutionError::WriteNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_write_never_reaches_the_store() {
        let source = ScriptedSource::new(Duration::from_secs(5), 1);
        let result = executor(50, 10).execute(&source, "DELETE FROM t", &[]).await;
        assert!(matches!(result, Err(ExecutionError::WriteNotAllowed(_))));
        assert!(source.submitted().is_empty());
        assert!(source.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_cancels_the_statement() {
        let source = ScriptedSource::new(Duration::from_secs(5), 1);
        let result = executor(20, 10).execute(&source, "SELECT n FROM t", &[]).await;
        assert!(matches!(result, Err(ExecutionError::Timeout(_))));
        assert_eq!(source.cancelled(), source.submitted());
        assert_eq!(source.cancelled().len(), 1);
    }

    #[tokio::test]
    async fn test_each_execution_is_a_new_statement() {
        let source = ScriptedSource::new(Duration::ZERO, 1);
        let executor = executor(1_000, 10);
        executor.execute(&source, "SELECT n FROM t", &[]).await.unwrap();
        executor.execute(&source, "SELECT n FROM t", &[]).await.unwrap();

        let submitted = source.submitted();
        assert_eq!(submitted.len(), 2);
        assert_ne!(submitted[0], submitted[1]);
        assert!(source.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_rows_are_capped() {
        let source = ScriptedSource::new(Duration::ZERO, 25);
        let rows = executor(1_000, 10)
            .execute(&source, "SELECT n FROM t", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 10);
    }

    #[tokio::test]
    async fn test_store_errors_are_propagated() {
        let mut source = ScriptedSource::new(Duration::ZERO, 0);
        source.fail = true;
        let result = executor(1_000, 10).execute(&source, "SELECT n FROM t", &[]).await;
        match result {
            Err(ExecutionError::StoreFailure(message)) => assert!(message.contains("disk I/O error")),
            other => panic!("expected StoreFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_count_reads_first_cell() {
        let source = ScriptedSource::new(Duration::ZERO, 1);
        let total = executor(1_000, 10)
            .count(&source, "SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap();
        assert_eq!(total, 0);
    }
}
