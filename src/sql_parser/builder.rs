use super::validator::{self, ValidationError};
use super::{FilterClause, FilterOperator, QuerySpec};
use crate::config::QueryConfig;
use crate::data_store::{DataStoreMapping, Value};
use crate::schema::TableSchema;
use log::debug;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuilderError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Limit {requested} exceeds the maximum of {max}")]
    LimitExceeded { requested: u64, max: u64 },

    #[error("Missing required field: {0}")]
    MissingRequiredField(String),
}

impl BuilderError {
    pub fn code(&self) -> &'static str {
        match self {
            BuilderError::InvalidIdentifier(_) => "InvalidIdentifier",
            BuilderError::LimitExceeded { .. } => "LimitExceeded",
            BuilderError::MissingRequiredField(_) => "MissingRequiredField",
        }
    }
}

impl From<ValidationError> for BuilderError {
    fn from(e: ValidationError) -> Self {
        BuilderError::InvalidIdentifier(e.identifier().to_string())
    }
}

/// SQL text plus the values bound to its placeholders, in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<Value>,
    /// Names of the result columns, in select-list order
    pub columns: Vec<String>,
}

impl BuiltQuery {
    fn bind(&mut self, mapping: &dyn DataStoreMapping, value: Value) -> String {
        self.params.push(value);
        mapping.placeholder(self.params.len())
    }
}

/// Turns a [`QuerySpec`] into parameterized SQL for one table.
///
/// Only identifiers present in `schema` are ever written into the SQL text, quoted
/// through the store mapping. Values, including limit and offset, are always bound.
pub struct QueryBuilder<'a> {
    mapping: &'a dyn DataStoreMapping,
    schema: &'a TableSchema,
    default_limit: u64,
    max_limit: u64,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(
        mapping: &'a dyn DataStoreMapping,
        schema: &'a TableSchema,
        config: &QueryConfig,
    ) -> Self {
        QueryBuilder {
            mapping,
            schema,
            default_limit: config.default_limit,
            max_limit: config.max_limit,
        }
    }

    pub fn build(&self, spec: &QuerySpec) -> Result<BuiltQuery, BuilderError> {
        self.check_identifiers(spec)?;

        let limit = spec.limit.unwrap_or(self.default_limit);
        if limit > self.max_limit {
            return Err(BuilderError::LimitExceeded {
                requested: limit,
                max: self.max_limit,
            });
        }

        let columns = self.output_columns(spec);
        let mut query = BuiltQuery {
            sql: String::new(),
            params: Vec::new(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        };
        if let Some(alias) = self.group_metric_alias(spec) {
            query.columns.push(alias);
        }

        let select_list = self.select_list(spec, &columns).join(", ");
        let where_clause = self.where_clause(&spec.filters, &mut query)?;

        let mut sql = format!("SELECT {} FROM {}", select_list, self.quoted_table());
        sql.push_str(&where_clause);
        if let Some(group_by) = &spec.group_by {
            sql.push_str(&format!(" GROUP BY {}", self.quote(group_by)));
        }
        sql.push_str(&self.order_by(spec, &columns));

        let limit_placeholder = query.bind(self.mapping, Value::Int(clamp_i64(limit)));
        let offset_placeholder = query.bind(self.mapping, Value::Int(clamp_i64(spec.offset)));
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            limit_placeholder, offset_placeholder
        ));

        debug!("Built query: {}", sql);
        query.sql = sql;
        Ok(query)
    }

    /// Total row count for `spec`, ignoring limit and offset and sharing the
    /// filter logic of [`QueryBuilder::build`]. Grouped specs count groups.
    ///
    /// Returns `None` for a whole-table aggregate, which always yields exactly one row.
    pub fn build_count(&self, spec: &QuerySpec) -> Result<Option<BuiltQuery>, BuilderError> {
        self.check_identifiers(spec)?;
        if spec.aggregate.is_some() && spec.group_by.is_none() {
            return Ok(None);
        }

        let mut query = BuiltQuery {
            sql: String::new(),
            params: Vec::new(),
            columns: vec![COUNT_ALIAS.to_string()],
        };
        let where_clause = self.where_clause(&spec.filters, &mut query)?;

        let count_expr = match &spec.group_by {
            Some(group_by) => {
                let quoted = self.quote(group_by);
                format!(
                    "COUNT(DISTINCT {q}) + COALESCE(MAX(CASE WHEN {q} IS NULL THEN 1 ELSE 0 END), 0)",
                    q = quoted
                )
            }
            None => "COUNT(*)".to_string(),
        };

        query.sql = format!(
            "SELECT {} AS {} FROM {}{}",
            count_expr,
            self.mapping.quote_identifier(COUNT_ALIAS),
            self.quoted_table(),
            where_clause
        );
        debug!("Built count query: {}", query.sql);
        Ok(Some(query))
    }

    fn check_identifiers(&self, spec: &QuerySpec) -> Result<(), BuilderError> {
        if spec.table.is_empty() {
            return Err(BuilderError::MissingRequiredField("table".to_string()));
        }
        validator::validate_spec(self.schema, spec)?;
        Ok(())
    }

    fn quote(&self, ident: &str) -> String {
        self.mapping.quote_identifier(ident)
    }

    fn quoted_table(&self) -> String {
        self.quote(&self.schema.table_name)
    }

    /// Requested columns without duplicates. The group column leads when it was
    /// not requested; the aggregate column trails.
    fn output_columns<'s>(&'s self, spec: &'s QuerySpec) -> Vec<&'s str> {
        let mut columns: Vec<&str> = Vec::new();
        if spec.select_columns.is_empty() {
            columns.extend(self.schema.column_names());
        } else {
            for column in &spec.select_columns {
                if !columns.contains(&column.as_str()) {
                    columns.push(column);
                }
            }
        }

        if let Some(group_by) = spec.group_by.as_deref() {
            if !columns.contains(&group_by) {
                columns.insert(0, group_by);
            }
        }
        if let Some(aggregate) = &spec.aggregate {
            if spec.group_by.as_deref() != Some(aggregate.column.as_str())
                && !columns.contains(&aggregate.column.as_str())
            {
                columns.push(&aggregate.column);
            }
        }
        columns
    }

    fn select_list(&self, spec: &QuerySpec, columns: &[&str]) -> Vec<String> {
        if !spec.is_grouped() {
            return columns.iter().map(|c| self.quote(c)).collect();
        }

        let group_by = spec.group_by.as_deref();
        let mut items: Vec<String> = columns
            .iter()
            .map(|column| {
                let quoted = self.quote(column);
                match &spec.aggregate {
                    _ if Some(*column) == group_by => quoted,
                    Some(aggregate) if aggregate.column == *column => {
                        format!("{}({}) AS {}", aggregate.function.sql_name(), quoted, quoted)
                    }
                    // Degenerate aggregate for columns that are neither grouped nor measured
                    _ => format!("{} AS {}", self.mapping.first_value(&quoted), quoted),
                }
            })
            .collect();

        if let (Some(aggregate), Some(alias)) = (&spec.aggregate, self.group_metric_alias(spec)) {
            items.push(format!(
                "{}({}) AS {}",
                aggregate.function.sql_name(),
                self.quote(&aggregate.column),
                self.quote(&alias)
            ));
        }
        items
    }

    /// Aggregating the group column itself needs a distinct alias
    fn group_metric_alias(&self, spec: &QuerySpec) -> Option<String> {
        spec.aggregate
            .as_ref()
            .filter(|aggregate| spec.group_by.as_deref() == Some(aggregate.column.as_str()))
            .map(|aggregate| format!("{}_{}", aggregate.function, aggregate.column))
    }

    fn where_clause(
        &self,
        filters: &[FilterClause],
        query: &mut BuiltQuery,
    ) -> Result<String, BuilderError> {
        if filters.is_empty() {
            return Ok(String::new());
        }

        let predicates = filters
            .iter()
            .map(|filter| self.predicate(filter, query))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!(" WHERE {}", predicates.join(" AND ")))
    }

    fn predicate(&self, filter: &FilterClause, query: &mut BuiltQuery) -> Result<String, BuilderError> {
        let column = self.quote(&filter.column);
        match (filter.operator, &filter.value) {
            (FilterOperator::Eq, Value::Null) => Ok(format!("{} IS NULL", column)),
            (FilterOperator::Neq, Value::Null) => Ok(format!("{} IS NOT NULL", column)),
            (_, Value::Null) => Err(BuilderError::MissingRequiredField(format!(
                "filter value for {}",
                filter.column
            ))),
            (FilterOperator::Contains, value) => {
                let pattern = format!("%{}%", escape_like(&value.to_string()));
                let placeholder = query.bind(self.mapping, Value::String(pattern));
                Ok(format!(
                    "{} {} {} ESCAPE '\\'",
                    self.mapping.text_cast(&column),
                    self.mapping.like_operator(),
                    placeholder
                ))
            }
            (operator, value) => {
                let placeholder = query.bind(self.mapping, value.clone());
                // Every operator except `contains` has a comparison symbol
                let symbol = operator.comparison().unwrap_or("=");
                Ok(format!("{} {} {}", column, symbol, placeholder))
            }
        }
    }

    fn order_by(&self, spec: &QuerySpec, columns: &[&str]) -> String {
        let (column, direction) = match &spec.sort {
            Some(sort) => (sort.column.as_str(), sort.direction),
            None => match columns.first() {
                Some(first) => (*first, Default::default()),
                None => return String::new(),
            },
        };

        let quoted = self.quote(column);
        let expr = if spec.is_grouped()
            && spec.group_by.as_deref() != Some(column)
            && !columns.contains(&column)
        {
            self.mapping.first_value(&quoted)
        } else {
            quoted
        };
        format!(" ORDER BY {} {}", expr, direction.keyword())
    }
}

const COUNT_ALIAS: &str = "total";

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
