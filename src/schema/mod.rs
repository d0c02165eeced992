pub mod classifier;

use crate::data_store::{DataStoreError, SourceHandle, TableDescription};
use crate::sql_parser::validator;
use log::debug;
use serde::Serialize;
use thiserror::Error;

pub use classifier::classify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SemanticType {
    Numeric,
    Text,
    Date,
    /// Not safe to aggregate numerically nor guaranteed to order as text
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    pub declared_type: String,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub foreign_key: Option<ForeignKeyRef>,
}

impl ColumnDescriptor {
    pub fn new(name: &str, declared_type: &str) -> Self {
        ColumnDescriptor {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
            semantic_type: classify(declared_type),
            nullable: true,
            is_primary_key: false,
            foreign_key: None,
        }
    }

    pub fn with_primary_key(mut self, is_primary_key: bool) -> Self {
        self.is_primary_key = is_primary_key;
        self
    }
}

/// Columns of one table in catalog order. Built fresh for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Normalize raw catalog rows
    pub fn from_description(table_name: &str, description: TableDescription) -> Self {
        let TableDescription {
            columns,
            foreign_keys,
        } = description;

        let columns = columns
            .into_iter()
            .map(|raw| {
                let foreign_key = foreign_keys
                    .iter()
                    .find(|fk| fk.column == raw.name)
                    .map(|fk| ForeignKeyRef {
                        table: fk.references_table.clone(),
                        column: fk.references_column.clone(),
                    });
                ColumnDescriptor {
                    semantic_type: classify(&raw.declared_type),
                    nullable: !raw.not_null,
                    is_primary_key: raw.primary_key,
                    foreign_key,
                    name: raw.name,
                    declared_type: raw.declared_type,
                }
            })
            .collect();

        TableSchema {
            table_name: table_name.to_string(),
            columns,
        }
    }
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table has no columns: {0}")]
    EmptySchema(String),

    #[error("Catalog lookup failed: {0}")]
    Store(#[from] DataStoreError),
}

impl SchemaError {
    pub fn code(&self) -> &'static str {
        match self {
            SchemaError::TableNotFound(_) => "TableNotFound",
            SchemaError::EmptySchema(_) => "EmptySchema",
            SchemaError::Store(_) => "StoreFailure",
        }
    }
}

/// Fetch and classify the live schema of `table`.
///
/// The table name is checked against the handle's table list before any
/// per-table catalog query runs. Nothing is cached: every call goes to the catalog.
pub async fn inspect(handle: &dyn SourceHandle, table: &str) -> Result<TableSchema, SchemaError> {
    let tables = handle.list_tables().await?;
    validator::validate_table(&tables, table)
        .map_err(|_| SchemaError::TableNotFound(table.to_string()))?;

    let description = handle.describe_table(table).await?;
    if description.columns.is_empty() {
        return Err(SchemaError::EmptySchema(table.to_string()));
    }

    let schema = TableSchema::from_description(table, description);
    debug!(
        "Inspected {}: {} columns",
        schema.table_name,
        schema.columns.len()
    );
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::{CatalogColumn, CatalogForeignKey};

    fn raw(name: &str, declared_type: &str, not_null: bool, primary_key: bool) -> CatalogColumn {
        CatalogColumn {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
            not_null,
            primary_key,
        }
    }

    #[test]
    fn test_from_description_normalizes_catalog_rows() {
        let description = TableDescription {
            columns: vec![
                raw("order_id", "INTEGER", true, true),
                raw("customer_id", "INTEGER", false, false),
                raw("placed_at", "TIMESTAMP", false, false),
            ],
            foreign_keys: vec![CatalogForeignKey {
                column: "customer_id".to_string(),
                references_table: "customers".to_string(),
                references_column: "id".to_string(),
            }],
        };

        let schema = TableSchema::from_description("orders", description);

        assert_eq!(schema.table_name, "orders");
        assert_eq!(
            schema.column_names().collect::<Vec<_>>(),
            vec!["order_id", "customer_id", "placed_at"]
        );
        let order_id = schema.column("order_id").unwrap();
        assert!(order_id.is_primary_key);
        assert!(!order_id.nullable);
        assert_eq!(order_id.semantic_type, SemanticType::Numeric);
        assert_eq!(
            schema.column("customer_id").unwrap().foreign_key,
            Some(ForeignKeyRef {
                table: "customers".to_string(),
                column: "id".to_string(),
            })
        );
        assert_eq!(schema.column("placed_at").unwrap().semantic_type, SemanticType::Date);
    }

    #[test]
    fn test_column_lookup_is_case_sensitive() {
        let schema = TableSchema {
            table_name: "t".to_string(),
            columns: vec![ColumnDescriptor::new("Revenue", "REAL")],
        };
        assert!(schema.has_column("Revenue"));
        assert!(!schema.has_column("revenue"));
    }

    #[test]
    fn test_schema_serializes_camel_case() {
        let schema = TableSchema {
            table_name: "t".to_string(),
            columns: vec![ColumnDescriptor::new("id", "INTEGER").with_primary_key(true)],
        };
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["tableName"], "t");
        assert_eq!(json["columns"][0]["semanticType"], "Numeric");
        assert_eq!(json["columns"][0]["isPrimaryKey"], true);
    }
}
