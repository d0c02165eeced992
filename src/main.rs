use chart_query::config::{Config, PostgresConfig, QueryConfig, SqliteConfig};
use chart_query::data_store::{PostgresSource, SourceHandle, SqliteSource};
use chart_query::QueryHandler;
use log::{error, info};
use serde_json::json;
use std::sync::Arc;
use std::{env, process};

const SOURCE_ID: &str = "default";
const DEFAULT_ROLES: &[&str] = &["x", "y"];

async fn open_source(config: &Config) -> Result<Arc<dyn SourceHandle>, Box<dyn std::error::Error>> {
    match config.data_source.as_str() {
        "sqlite" => {
            info!("Using SqliteSource");
            let sqlite_config = SqliteConfig::new()?;
            Ok(Arc::new(SqliteSource::open(&sqlite_config.path)?))
        }
        "postgres" => {
            info!("Using PostgresSource");
            let postgres_config = PostgresConfig::new()?;
            Ok(Arc::new(PostgresSource::new(postgres_config).await?))
        }
        other => Err(format!("Incorrect data source type: {}", other).into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let Some(table) = args.next() else {
        eprintln!("usage: chart-query <table> [role ...]");
        process::exit(2);
    };
    let mut roles: Vec<String> = args.collect();
    if roles.is_empty() {
        roles = DEFAULT_ROLES.iter().map(|r| r.to_string()).collect();
    }

    let config = Config::new().map_err(|e| {
        error!("Failed to initialize config: {}", e);
        e
    })?;
    let query_config = QueryConfig::new().map_err(|e| {
        error!("Failed to initialize query config: {}", e);
        e
    })?;

    let source = open_source(&config).await.map_err(|e| {
        error!("Failed to open data source: {}", e);
        e
    })?;

    let mut handler = QueryHandler::new(query_config);
    handler.register_source(SOURCE_ID, source);

    let schema = match handler.get_schema(SOURCE_ID, &table).await {
        Ok(schema) => schema,
        Err(e) => {
            error!("{}: {}", e.code(), e);
            process::exit(1);
        }
    };

    let mut suggestions = serde_json::Map::new();
    for role in &roles {
        let ranked: Vec<String> = handler
            .suggest_mapping(&schema, role)
            .into_iter()
            .map(|column| column.name)
            .collect();
        suggestions.insert(role.clone(), json!(ranked));
    }

    let output = json!({
        "schema": schema,
        "suggestions": suggestions,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
