//! Allow-listing of table and column identifiers.
//!
//! Identifiers cannot be bound as parameters, so these checks against the live
//! catalog are the only thing standing between user input and SQL text.
//! Errors carry the offending identifier and nothing else.

use super::QuerySpec;
use crate::schema::TableSchema;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::UnknownColumn(_) => "UnknownColumn",
            ValidationError::UnknownTable(_) => "UnknownTable",
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            ValidationError::UnknownColumn(name) | ValidationError::UnknownTable(name) => name,
        }
    }
}

/// Every identifier must appear verbatim (case-sensitive) among the schema's columns
pub fn validate<'a>(
    schema: &TableSchema,
    identifiers: impl IntoIterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    match identifiers.into_iter().find(|ident| !schema.has_column(ident)) {
        Some(unknown) => Err(ValidationError::UnknownColumn(unknown.to_string())),
        None => Ok(()),
    }
}

/// `table` must be one of the names returned by the live table listing
pub fn validate_table(tables: &[String], table: &str) -> Result<(), ValidationError> {
    if tables.iter().any(|t| t == table) {
        Ok(())
    } else {
        Err(ValidationError::UnknownTable(table.to_string()))
    }
}

/// Check the spec's table and every column it references against `schema`
pub fn validate_spec(schema: &TableSchema, spec: &QuerySpec) -> Result<(), ValidationError> {
    if spec.table != schema.table_name {
        return Err(ValidationError::UnknownTable(spec.table.clone()));
    }
    validate(schema, spec.referenced_columns())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDescriptor;
    use crate::sql_parser::{FilterOperator, SortDirection};
    use rstest::*;

    #[fixture]
    fn schema() -> TableSchema {
        TableSchema {
            table_name: "sales".to_string(),
            columns: vec![
                ColumnDescriptor::new("id", "INTEGER").with_primary_key(true),
                ColumnDescriptor::new("name", "TEXT"),
                ColumnDescriptor::new("revenue", "REAL"),
            ],
        }
    }

    #[rstest]
    fn test_known_identifiers_pass(schema: TableSchema) {
        assert_eq!(validate(&schema, ["id", "name", "revenue"]), Ok(()));
        assert_eq!(validate(&schema, []), Ok(()));
    }

    #[rstest]
    #[case::wrong_case("Name")]
    #[case::injection("name; DROP TABLE sales")]
    #[case::quoted("\"name\"")]
    #[case::qualified("sales.name")]
    #[case::star("*")]
    fn test_unknown_identifier_is_rejected(schema: TableSchema, #[case] ident: &str) {
        assert_eq!(
            validate(&schema, ["id", ident]),
            Err(ValidationError::UnknownColumn(ident.to_string()))
        );
    }

    #[rstest]
    fn test_validate_spec_reports_first_unknown_column(schema: TableSchema) {
        let spec = QuerySpec::new("sales")
            .select(&["name"])
            .filter("region", FilterOperator::Eq, "East")
            .sort_by("profit", SortDirection::Desc);
        let err = validate_spec(&schema, &spec).unwrap_err();
        assert_eq!(err, ValidationError::UnknownColumn("region".to_string()));
        assert_eq!(err.identifier(), "region");
    }

    #[rstest]
    fn test_validate_spec_rejects_other_table(schema: TableSchema) {
        let spec = QuerySpec::new("customers").select(&["name"]);
        assert_eq!(
            validate_spec(&schema, &spec),
            Err(ValidationError::UnknownTable("customers".to_string()))
        );
    }

    #[test]
    fn test_validate_table() {
        let tables = vec!["orders".to_string(), "sales".to_string()];
        assert!(validate_table(&tables, "sales").is_ok());
        assert_eq!(
            validate_table(&tables, "SALES"),
            Err(ValidationError::UnknownTable("SALES".to_string()))
        );
    }
}
