pub mod chart;
pub mod config;
pub mod data_store;
pub mod executor;
pub mod field_mapping;
pub mod query_handler;
pub mod schema;
pub mod sql_parser;


pub use chart::{ChartData, ChartKind, ChartSpec, ShapeError};
pub use query_handler::{HandlerError, QueryHandler, QueryResult};
pub use sql_parser::QuerySpec;
