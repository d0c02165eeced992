use super::{
    CatalogColumn, CatalogForeignKey, DataStoreError, DataStoreMapping, Row, SourceHandle,
    StatementId, TableDescription, Value,
};
use crate::config::PostgresConfig;
use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, error, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlparser::dialect::PostgreSqlDialect;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{CancelToken, Client, NoTls};

const LIST_TABLES_SQL: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = current_schema() AND table_type IN ('BASE TABLE', 'VIEW') \
     ORDER BY table_name";

const DESCRIBE_COLUMNS_SQL: &str = "SELECT c.column_name::text, c.data_type::text, \
     c.is_nullable = 'NO' AS not_null, \
     EXISTS ( \
         SELECT 1 FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage k \
           ON k.constraint_name = tc.constraint_name AND k.table_schema = tc.table_schema \
         WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = c.table_schema \
           AND tc.table_name = c.table_name AND k.column_name = c.column_name \
     ) AS primary_key \
     FROM information_schema.columns c \
     WHERE c.table_schema = current_schema() AND c.table_name = $1 \
     ORDER BY c.ordinal_position";

const DESCRIBE_FOREIGN_KEYS_SQL: &str = "SELECT kcu.column_name::text, ccu.table_name::text, ccu.column_name::text \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     JOIN information_schema.constraint_column_usage ccu \
       ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
     WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = current_schema() \
       AND tc.table_name = $1 \
     ORDER BY kcu.ordinal_position";

pub struct PostgresMapping;

impl DataStoreMapping for PostgresMapping {
    fn get_dialect(&self) -> &dyn sqlparser::dialect::Dialect {
        &PostgreSqlDialect {}
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn first_value(&self, quoted_column: &str) -> String {
        format!("(ARRAY_AGG({}))[1]", quoted_column)
    }

    fn like_operator(&self) -> &'static str {
        "ILIKE"
    }
}

type BindResult = Result<IsNull, Box<dyn Error + Sync + Send>>;

/// A parameter whose value has no faithful encoding for the placeholder's type
#[derive(thiserror::Error, Debug)]
#[error("Cannot bind {kind} parameter to a {ty} placeholder")]
struct BindError {
    kind: &'static str,
    ty: Type,
}

fn mismatch(kind: &'static str, ty: &Type) -> BindResult {
    Err(Box::new(BindError {
        kind,
        ty: ty.clone(),
    }))
}

fn accepts_text(ty: &Type) -> bool {
    <&str as ToSql>::accepts(ty)
}

/// Bound values adapt to whatever type the server inferred for the placeholder.
/// Conversions that would change the value are refused.
impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> BindResult {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::String(s) if accepts_text(ty) => s.as_str().to_sql(ty, out),
            Value::String(s) => bind_parsed(s.trim(), ty, out),
            // text parameters take the rendered value of any scalar
            _ if accepts_text(ty) => self.to_string().as_str().to_sql(ty, out),
            Value::Boolean(b) => bind_bool(*b, ty, out),
            Value::Int(i) => bind_int(*i, ty, out),
            Value::Float(f) => bind_float(*f, ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_bool(b: bool, ty: &Type, out: &mut BytesMut) -> BindResult {
    if *ty == Type::BOOL {
        b.to_sql(ty, out)
    } else {
        mismatch("boolean", ty)
    }
}

fn bind_int(i: i64, ty: &Type, out: &mut BytesMut) -> BindResult {
    if *ty == Type::INT2 {
        i16::try_from(i)?.to_sql(ty, out)
    } else if *ty == Type::INT4 {
        i32::try_from(i)?.to_sql(ty, out)
    } else if *ty == Type::INT8 {
        i.to_sql(ty, out)
    } else if *ty == Type::FLOAT4 {
        (i as f32).to_sql(ty, out)
    } else if *ty == Type::FLOAT8 {
        (i as f64).to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        Decimal::from(i).to_sql(ty, out)
    } else {
        mismatch("integer", ty)
    }
}

fn bind_float(f: f64, ty: &Type, out: &mut BytesMut) -> BindResult {
    if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 {
        // integer placeholders only take whole numbers that fit in an i64
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            bind_int(f as i64, ty, out)
        } else {
            mismatch("fractional or out-of-range float", ty)
        }
    } else if *ty == Type::FLOAT4 {
        (f as f32).to_sql(ty, out)
    } else if *ty == Type::FLOAT8 {
        f.to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        Decimal::try_from(f)?.to_sql(ty, out)
    } else {
        mismatch("float", ty)
    }
}

/// String parameter bound to a non-text placeholder
fn bind_parsed(s: &str, ty: &Type, out: &mut BytesMut) -> BindResult {
    if *ty == Type::BOOL {
        bind_bool(s.parse::<bool>()?, ty, out)
    } else if *ty == Type::DATE {
        s.parse::<chrono::NaiveDate>()?.to_sql(ty, out)
    } else if *ty == Type::TIMESTAMP {
        s.parse::<chrono::NaiveDateTime>()?.to_sql(ty, out)
    } else if *ty == Type::TIMESTAMPTZ {
        s.parse::<chrono::DateTime<chrono::Utc>>()?.to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        s.parse::<Decimal>()?.to_sql(ty, out)
    } else if let Ok(i) = s.parse::<i64>() {
        bind_int(i, ty, out)
    } else if let Ok(f) = s.parse::<f64>() {
        bind_float(f, ty, out)
    } else {
        mismatch("text", ty)
    }
}

/// Result types read by `value_from_postgres` without a text cast
fn decodes_natively(ty: &Type) -> bool {
    [
        Type::BOOL,
        Type::INT2,
        Type::INT4,
        Type::INT8,
        Type::FLOAT4,
        Type::FLOAT8,
        Type::NUMERIC,
        Type::DATE,
        Type::TIMESTAMP,
        Type::TIMESTAMPTZ,
        Type::TIME,
    ]
    .contains(ty)
        || <String as FromSql>::accepts(ty)
}

/// Wraps `sql` so result columns of other types (uuid, json, arrays, ...) come
/// back in their text form. `None` when every column decodes as is.
fn with_text_fallback(
    mapping: &dyn DataStoreMapping,
    sql: &str,
    columns: &[(&str, &Type)],
) -> Option<String> {
    if columns.iter().all(|(_, ty)| decodes_natively(ty)) {
        return None;
    }
    let select_list = columns
        .iter()
        .map(|(name, ty)| {
            let quoted = mapping.quote_identifier(name);
            if decodes_natively(ty) {
                quoted
            } else {
                format!("{q}::text AS {q}", q = quoted)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("SELECT {} FROM ({}) AS source_rows", select_list, sql))
}

fn value_from_postgres(row: &tokio_postgres::Row, idx: usize) -> Result<Value, tokio_postgres::Error> {
    let ty = row.columns()[idx].type_().clone();
    let value = if ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Boolean)
    } else if ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v.into()))
    } else if ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v.into()))
    } else if ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
    } else if ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v.into()))
    } else if ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
    } else if ty == Type::NUMERIC {
        row.try_get::<_, Option<Decimal>>(idx)?
            .map(|d| d.to_f64().map(Value::Float).unwrap_or_else(|| Value::String(d.to_string())))
    } else if ty == Type::DATE {
        row.try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(|d| Value::String(d.to_string()))
    } else if ty == Type::TIMESTAMP {
        row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(|d| Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
    } else if ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(|d| Value::String(d.to_rfc3339()))
    } else if ty == Type::TIME {
        row.try_get::<_, Option<chrono::NaiveTime>>(idx)?
            .map(|d| Value::String(d.to_string()))
    } else {
        row.try_get::<_, Option<String>>(idx)?.map(Value::String)
    };
    Ok(value.unwrap_or(Value::Null))
}

/// The client plus the statement that last took it
struct Session {
    client: Client,
    /// Set while a statement runs; left behind when its caller gave up mid-flight
    running: Option<StatementId>,
}

pub struct PostgresSource {
    session: Mutex<Session>,
    cancel_token: CancelToken,
    mapping: PostgresMapping,
}

impl PostgresSource {
    pub async fn new(config: PostgresConfig) -> Result<Self, DataStoreError> {
        let connection_string = format!(
            "postgres://{}:{}@{}/{}",
            config.user, config.password, config.host, config.dbname
        );

        let (client, connection) = tokio_postgres::connect(&connection_string, NoTls)
            .await
            .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;

        // Spawn a task to manage the connection
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {}", e);
            }
        });

        client
            .batch_execute("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
            .await
            .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;
        debug!("Connected to Postgres at {}/{}", config.host, config.dbname);

        let cancel_token = client.cancel_token();
        Ok(PostgresSource {
            session: Mutex::new(Session {
                client,
                running: None,
            }),
            cancel_token,
            mapping: PostgresMapping,
        })
    }

    async fn run(&self, client: &Client, sql: &str, params: &[Value]) -> Result<Vec<Row>, DataStoreError> {
        let query_error = |e: tokio_postgres::Error| DataStoreError::QueryError(e.to_string());
        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        let mut stmt = client.prepare(sql).await.map_err(query_error)?;
        let result_columns: Vec<(&str, &Type)> = stmt
            .columns()
            .iter()
            .map(|c| (c.name(), c.type_()))
            .collect();
        if let Some(wrapped) = with_text_fallback(&self.mapping, sql, &result_columns) {
            debug!("Reading undecodable result columns as text: {}", wrapped);
            stmt = client.prepare(&wrapped).await.map_err(query_error)?;
        }

        let rows = client.query(&stmt, &bound).await.map_err(query_error)?;

        let columns: Arc<[String]> = stmt
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        rows.iter()
            .map(|r| {
                let values = (0..columns.len())
                    .map(|i| value_from_postgres(r, i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Row::new(Arc::clone(&columns), values))
            })
            .collect::<Result<Vec<_>, tokio_postgres::Error>>()
            .map_err(query_error)
    }
}

#[async_trait]
impl SourceHandle for PostgresSource {
    fn mapping(&self) -> &dyn DataStoreMapping {
        &self.mapping
    }

    async fn list_tables(&self) -> Result<Vec<String>, DataStoreError> {
        let mut session = self.session.lock().await;
        session.running = None;
        let rows = session
            .client
            .query(LIST_TABLES_SQL, &[])
            .await
            .map_err(|e| DataStoreError::CatalogError(e.to_string()))?;
        rows.iter()
            .map(|r| r.try_get::<_, String>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DataStoreError::CatalogError(e.to_string()))
    }

    async fn describe_table(&self, table: &str) -> Result<TableDescription, DataStoreError> {
        let mut session = self.session.lock().await;
        session.running = None;
        let client = &session.client;
        let catalog = |e: tokio_postgres::Error| DataStoreError::CatalogError(e.to_string());

        let columns = client
            .query(DESCRIBE_COLUMNS_SQL, &[&table])
            .await
            .map_err(catalog)?
            .iter()
            .map(|r| {
                Ok(CatalogColumn {
                    name: r.try_get(0)?,
                    declared_type: r.try_get(1)?,
                    not_null: r.try_get(2)?,
                    primary_key: r.try_get(3)?,
                })
            })
            .collect::<Result<Vec<_>, tokio_postgres::Error>>()
            .map_err(catalog)?;

        let foreign_keys = client
            .query(DESCRIBE_FOREIGN_KEYS_SQL, &[&table])
            .await
            .map_err(catalog)?
            .iter()
            .map(|r| {
                Ok(CatalogForeignKey {
                    column: r.try_get(0)?,
                    references_table: r.try_get(1)?,
                    references_column: r.try_get(2)?,
                })
            })
            .collect::<Result<Vec<_>, tokio_postgres::Error>>()
            .map_err(catalog)?;

        Ok(TableDescription {
            columns,
            foreign_keys,
        })
    }

    async fn query(
        &self,
        statement: StatementId,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, DataStoreError> {
        // a caller that gives up while waiting here never reaches the server
        let mut session = self.session.lock().await;
        session.running = Some(statement);
        let result = self.run(&session.client, sql, params).await;
        session.running = None;
        result
    }

    async fn cancel(&self, statement: StatementId) {
        let mut session = self.session.lock().await;
        if session.running != Some(statement) {
            debug!("Statement {} is not running, nothing to cancel", statement);
            return;
        }

        warn!("Cancelling Postgres statement {}", statement);
        if let Err(e) = self.cancel_token.cancel_query(NoTls).await {
            warn!("Failed to cancel Postgres statement {}: {}", statement, e);
        }
        // hold the session until the server is done with the cancelled statement
        if let Err(e) = session.client.batch_execute("SELECT 1").await {
            warn!("Postgres session did not recover after cancel: {}", e);
        }
        session.running = None;
    }
}
