// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL Driver
//!
//! Implements the DataEngine trait for PostgreSQL databases using SQLx.
//!
//! Every federated query opens its own `PgConnection` per backend and closes
//! it when the query finishes; nothing is pooled between queries.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, Postgres};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, TypeInfo};
use tracing::debug;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{expand_in_lists, BackendConnection, DataEngine};
use crate::engine::types::{ColumnInfo, ConnectParams, InList, QueryResult, Row as QRow, Value};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// PostgreSQL driver implementation
#[derive(Debug, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }

    fn connect_options(params: &ConnectParams) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.user)
            .password(params.password.expose())
            .database(&params.database)
            .application_name("vfdw")
    }

    /// Helper to bind a Value to a Postgres query
    fn bind_param<'q>(
        query: sqlx::query::Query<'q, Postgres, PgArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, Postgres, PgArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j),
        }
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(pg_row: &PgRow) -> QRow {
        let values: Vec<Value> = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // try_get with Option<T> so NULLs of any type come back as Value::Null
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }

        // numeric, uuid, enums and other types without a decoder here
        Value::Null
    }

    /// Gets column info from a PgRow
    fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
            .collect()
    }
}

#[async_trait]
impl DataEngine for PostgresDriver {
    fn driver_id(&self) -> &'static str {
        "postgres"
    }

    fn driver_name(&self) -> &'static str {
        "PostgreSQL"
    }

    async fn connect(&self, params: &ConnectParams) -> EngineResult<Box<dyn BackendConnection>> {
        let options = Self::connect_options(params);
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, options.connect())
            .await
            .map_err(|_| {
                EngineError::connection_failed(&params.database, "timed out while connecting")
            })?
            .map_err(|e| EngineError::connection_failed(&params.database, e.to_string()))?;

        debug!(host = %params.host, database = %params.database, "postgres connection opened");
        Ok(Box::new(PostgresConnection { conn }))
    }
}

struct PostgresConnection {
    conn: PgConnection,
}

#[async_trait]
impl BackendConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, in_lists: &[InList]) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let (sql, values) = expand_in_lists(sql, in_lists, |n| format!("${n}"))?;

        let mut query = sqlx::query(&sql);
        for value in values {
            query = PostgresDriver::bind_param(query, value);
        }

        let pg_rows: Vec<PgRow> = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let columns = match pg_rows.first() {
            Some(first) => PostgresDriver::get_column_info(first),
            // no rows: ask the prepared statement for its columns; statements
            // without a result set (DDL) simply have none
            None => (&mut self.conn)
                .describe(&sql)
                .await
                .map(|described| {
                    described
                        .columns()
                        .iter()
                        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                        .collect()
                })
                .unwrap_or_default(),
        };
        let rows = pg_rows.iter().map(PostgresDriver::convert_row).collect();

        Ok(QueryResult {
            columns,
            rows,
            execution_time_ms: start.elapsed().as_micros() as f64 / 1000.0,
        })
    }

    async fn close(self: Box<Self>) -> EngineResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::Sensitive;

    #[test]
    fn connect_options_carry_profile_fields() {
        let params = ConnectParams {
            host: "db.internal".to_string(),
            port: 6543,
            database: "sales".to_string(),
            user: "report".to_string(),
            password: Sensitive::new("p@ss/word".to_string()),
        };

        let options = PostgresDriver::connect_options(&params);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("sales"));
        assert_eq!(options.get_username(), "report");
    }

    #[test]
    fn driver_identity() {
        let driver = PostgresDriver::new();
        assert_eq!(driver.driver_id(), "postgres");
        assert_eq!(driver.driver_name(), "PostgreSQL");
    }
}
