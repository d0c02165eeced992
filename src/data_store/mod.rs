pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use postgres::{PostgresMapping, PostgresSource};
pub use sqlite::{SqliteMapping, SqliteSource};

/// Store-specific pieces of SQL text.
///
/// The query builder only ever asks the mapping how to spell things; it never
/// decides on syntax by itself.
pub trait DataStoreMapping: Send + Sync {
    /// Dialect used by the executor's read-only guard
    fn get_dialect(&self) -> &dyn sqlparser::dialect::Dialect;

    /// Positional placeholder for the 1-based parameter `index`
    fn placeholder(&self, index: usize) -> String;

    /// Quote an identifier that has already been checked against the catalog
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Aggregate expression returning the first value seen in a group
    fn first_value(&self, quoted_column: &str) -> String;

    /// Cast used by `contains` filters so LIKE works on any column type
    fn text_cast(&self, quoted_column: &str) -> String {
        format!("CAST({} AS TEXT)", quoted_column)
    }

    /// Pattern operator for `contains`; matches ignoring ASCII case
    fn like_operator(&self) -> &'static str {
        "LIKE"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// Raw catalog rows for one table, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDescription {
    pub columns: Vec<CatalogColumn>,
    pub foreign_keys: Vec<CatalogForeignKey>,
}

/// Identifies one statement submitted through a [`SourceHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementId(u64);

impl StatementId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        StatementId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A live, read-only connection to one data source.
///
/// Implementations must keep at most one statement in flight at a time; every
/// method takes the handle's internal lock for the duration of its statement.
#[async_trait]
pub trait SourceHandle: Send + Sync {
    fn mapping(&self) -> &dyn DataStoreMapping;

    /// User tables visible through this handle
    async fn list_tables(&self) -> Result<Vec<String>, DataStoreError>;

    /// Catalog metadata for `table`. Callers check the name against
    /// [`SourceHandle::list_tables`] first.
    async fn describe_table(&self, table: &str) -> Result<TableDescription, DataStoreError>;

    async fn query(
        &self,
        statement: StatementId,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, DataStoreError>;

    /// Abort `statement` only. One still waiting for the handle never starts,
    /// one that already finished is left alone.
    async fn cancel(&self, _statement: StatementId) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Numeric reading of the cell. Strings count when they parse as a finite number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if f.is_finite() => Some(*f),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// One result row. Column names are shared by every row of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Arc<[String]>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Row { columns, values }
    }

    /// Cell for `column`, `None` when the result set has no such column
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(self.values.iter()) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Catalog error: {0}")]
    CatalogError(String),

    #[error("Handle unavailable: {0}")]
    Unavailable(String),

    #[error("Statement {0} was cancelled")]
    Cancelled(StatementId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::int(Value::Int(7), Some(7.0))]
    #[case::float(Value::Float(2.5), Some(2.5))]
    #[case::numeric_string(Value::from(" 42 "), Some(42.0))]
    #[case::text(Value::from("n/a"), None)]
    #[case::nan_string(Value::from("NaN"), None)]
    #[case::null(Value::Null, None)]
    #[case::boolean(Value::Boolean(true), None)]
    fn test_as_f64(#[case] value: Value, #[case] expected: Option<f64>) {
        assert_eq!(value.as_f64(), expected);
    }

    #[test]
    fn test_float_display_drops_trailing_zero() {
        assert_eq!(Value::Float(30.0).to_string(), "30");
        assert_eq!(Value::Float(10.5).to_string(), "10.5");
    }

    #[test]
    fn test_row_lookup_and_serialization() {
        let columns: Arc<[String]> = vec!["name".to_string(), "revenue".to_string()].into();
        let row = Row::new(columns, vec![Value::from("A"), Value::Int(10)]);

        assert_eq!(row.get("revenue"), Some(&Value::Int(10)));
        assert_eq!(row.get("missing"), None);
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"name":"A","revenue":10}"#
        );
    }

    #[test]
    fn test_statement_ids_are_unique() {
        let first = StatementId::next();
        let second = StatementId::next();
        assert_ne!(first, second);
    }

    #[test]
    fn test_value_deserializes_untagged() {
        let values: Vec<Value> = serde_json::from_str(r#"[null, true, 3, 1.5, "x"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Boolean(true),
                Value::Int(3),
                Value::Float(1.5),
                Value::from("x"),
            ]
        );
    }
}
