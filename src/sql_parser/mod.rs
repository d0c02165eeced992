pub mod builder;
pub mod validator;

use crate::data_store::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use builder::{BuilderError, BuiltQuery, QueryBuilder};
pub use validator::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl FilterOperator {
    /// Comparison operator, `None` for operators that need their own shape
    fn comparison(&self) -> Option<&'static str> {
        match self {
            FilterOperator::Eq => Some("="),
            FilterOperator::Neq => Some("<>"),
            FilterOperator::Gt => Some(">"),
            FilterOperator::Gte => Some(">="),
            FilterOperator::Lt => Some("<"),
            FilterOperator::Lte => Some("<="),
            FilterOperator::Contains => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub column: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl FilterClause {
    pub fn new(column: &str, operator: FilterOperator, value: impl Into<Value>) -> Self {
        FilterClause {
            column: column.to_string(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn keyword(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateFunction {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Count => "COUNT",
        }
    }

    /// Reduce already-numeric values. `None` when there is nothing to reduce
    /// (except `count`, which is 0).
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        match self {
            AggregateFunction::Count => Some(values.len() as f64),
            _ if values.is_empty() => None,
            AggregateFunction::Sum => Some(values.iter().sum()),
            AggregateFunction::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
            AggregateFunction::Min => values.iter().copied().reduce(f64::min),
            AggregateFunction::Max => values.iter().copied().reduce(f64::max),
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.sql_name().to_lowercase())
    }
}

impl FromStr for AggregateFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(AggregateFunction::Sum),
            "avg" => Ok(AggregateFunction::Avg),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "count" => Ok(AggregateFunction::Count),
            _ => Err(format!("Unknown aggregate function: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub column: String,
    pub function: AggregateFunction,
}

/// A single-table read request. Every column named here must exist in the
/// schema fetched for `table` during the same request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub table: String,
    /// Output columns in request order; empty selects every column
    #[serde(default)]
    pub select_columns: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub aggregate: Option<AggregateSpec>,
    /// Falls back to the configured default limit
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: u64,
}

impl QuerySpec {
    pub fn new(table: &str) -> Self {
        QuerySpec {
            table: table.to_string(),
            select_columns: Vec::new(),
            filters: Vec::new(),
            sort: None,
            group_by: None,
            aggregate: None,
            limit: None,
            offset: 0,
        }
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.select_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter(mut self, column: &str, operator: FilterOperator, value: impl Into<Value>) -> Self {
        self.filters.push(FilterClause::new(column, operator, value));
        self
    }

    pub fn sort_by(mut self, column: &str, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            column: column.to_string(),
            direction,
        });
        self
    }

    pub fn group_by(mut self, column: &str) -> Self {
        self.group_by = Some(column.to_string());
        self
    }

    pub fn aggregate(mut self, column: &str, function: AggregateFunction) -> Self {
        self.aggregate = Some(AggregateSpec {
            column: column.to_string(),
            function,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Every column identifier this spec mentions, in a stable order
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self.select_columns.iter().map(String::as_str).collect();
        columns.extend(self.filters.iter().map(|f| f.column.as_str()));
        columns.extend(self.sort.iter().map(|s| s.column.as_str()));
        columns.extend(self.group_by.as_deref());
        columns.extend(self.aggregate.iter().map(|a| a.column.as_str()));
        columns
    }

    pub fn is_grouped(&self) -> bool {
        self.group_by.is_some() || self.aggregate.is_some()
    }
}
