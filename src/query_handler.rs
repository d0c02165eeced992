use crate::chart::{self, ChartData, ChartKind, ChartSpec, ShapeError};
use crate::config::QueryConfig;
use crate::data_store::{Row, SourceHandle};
use crate::executor::{ExecutionError, QueryExecutor};
use crate::field_mapping;
use crate::schema::{self, ColumnDescriptor, SchemaError, TableSchema};
use crate::sql_parser::validator;
use crate::sql_parser::{BuilderError, QueryBuilder, QuerySpec};
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Unknown data source: {0}")]
    UnknownSource(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Shape(#[from] ShapeError),
}

impl HandlerError {
    pub fn code(&self) -> &'static str {
        match self {
            HandlerError::UnknownSource(_) => "UnknownSource",
            HandlerError::Schema(e) => e.code(),
            HandlerError::Builder(e) => e.code(),
            HandlerError::Execution(e) => e.code(),
            HandlerError::Shape(e) => e.code(),
        }
    }
}

/// One page of rows plus the row count of the unpaged result
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub total: u64,
}

/// Entry point for callers: schema lookup, query runs, chart shaping and
/// mapping suggestions over a set of named sources.
///
/// Every call re-reads the catalog; nothing is kept between requests except the
/// registered handles themselves.
pub struct QueryHandler {
    sources: HashMap<String, Arc<dyn SourceHandle>>,
    config: QueryConfig,
    executor: QueryExecutor,
}

impl QueryHandler {
    pub fn new(config: QueryConfig) -> Self {
        Self {
            sources: HashMap::new(),
            executor: QueryExecutor::new(&config),
            config,
        }
    }

    pub fn register_source(&mut self, source_id: &str, handle: Arc<dyn SourceHandle>) {
        info!("Registered data source {}", source_id);
        self.sources.insert(source_id.to_string(), handle);
    }

    fn source(&self, source_id: &str) -> Result<&dyn SourceHandle, HandlerError> {
        self.sources
            .get(source_id)
            .map(|handle| handle.as_ref())
            .ok_or_else(|| HandlerError::UnknownSource(source_id.to_string()))
    }

    pub async fn list_tables(&self, source_id: &str) -> Result<Vec<String>, HandlerError> {
        let handle = self.source(source_id)?;
        let tables = handle.list_tables().await.map_err(SchemaError::from)?;
        Ok(tables)
    }

    pub async fn get_schema(&self, source_id: &str, table: &str) -> Result<TableSchema, HandlerError> {
        let handle = self.source(source_id)?;
        Ok(schema::inspect(handle, table).await?)
    }

    /// Inspect, validate, build, execute and count in one request.
    ///
    /// The schema is fetched fresh and every identifier in `spec` is checked
    /// against it before any SQL reaches the store.
    pub async fn run_query(&self, source_id: &str, spec: &QuerySpec) -> Result<QueryResult, HandlerError> {
        let handle = self.source(source_id)?;
        debug!("Running query on {}: {:?}", source_id, spec);

        let schema = schema::inspect(handle, &spec.table).await?;
        validator::validate_spec(&schema, spec).map_err(BuilderError::from)?;

        let builder = QueryBuilder::new(handle.mapping(), &schema, &self.config);
        let query = builder.build(spec)?;
        let count = builder.build_count(spec)?;

        let rows = self
            .executor
            .execute(handle, &query.sql, &query.params)
            .await?;
        let total = match count {
            Some(count) => {
                self.executor
                    .count(handle, &count.sql, &count.params)
                    .await?
            }
            None => 1,
        };

        debug!("Query on {} returned {} of {} rows", spec.table, rows.len(), total);
        Ok(QueryResult {
            columns: query.columns,
            rows,
            total,
        })
    }

    pub fn shape_for_chart(&self, rows: &[Row], spec: &ChartSpec) -> Result<ChartData, HandlerError> {
        Ok(chart::shape(rows, spec)?)
    }

    pub fn suggest_mapping(&self, schema: &TableSchema, role: &str) -> Vec<ColumnDescriptor> {
        field_mapping::suggest(schema, role)
    }

    pub fn auto_map(&self, schema: &TableSchema, kind: ChartKind) -> Result<ChartSpec, HandlerError> {
        Ok(field_mapping::auto_map(schema, kind)?)
    }
}
