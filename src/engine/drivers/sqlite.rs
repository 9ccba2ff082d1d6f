// SPDX-License-Identifier: Apache-2.0

//! SQLite Driver
//!
//! Implements the DataEngine trait for SQLite databases using SQLx.
//!
//! ## SQLite Specifics
//!
//! - SQLite is a file-based database, so `host` in the connection profile holds the file path
//! - Supports `:memory:` for in-memory databases
//! - Tables live in the `main` schema; map them as `main.<table>`

use std::time::Instant;

use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, TypeInfo};
use tracing::debug;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{expand_in_lists, BackendConnection, DataEngine};
use crate::engine::types::{ColumnInfo, ConnectParams, InList, QueryResult, Row as QRow, Value};

/// SQLite driver implementation
#[derive(Debug, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    /// Validates the SQLite connection path
    fn validate_path(path: &str) -> EngineResult<()> {
        let path = path.trim();
        if path == ":memory:" {
            return Ok(());
        }
        if path.is_empty() {
            return Err(EngineError::connection_failed(
                path,
                "SQLite path cannot be empty.",
            ));
        }
        if path.eq_ignore_ascii_case("localhost") {
            return Err(EngineError::connection_failed(
                path,
                "Invalid SQLite path: 'localhost'. Set host to a database file path.",
            ));
        }
        Ok(())
    }

    fn connect_options(params: &ConnectParams) -> SqliteConnectOptions {
        let path = params.host.trim();
        if path == ":memory:" {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new().filename(path).read_only(true)
        }
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j.to_string()),
        }
    }

    fn convert_row(row: &SqliteRow) -> QRow {
        let values: Vec<Value> = row
            .columns()
            .iter()
            .map(|col| Self::extract_value(row, col.ordinal()))
            .collect();

        QRow { values }
    }

    fn extract_value(row: &SqliteRow, idx: usize) -> Value {
        // Try integer first (most common)
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        // SQLite stores booleans as 0/1, so this only hits declared BOOLEAN columns
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }

        Value::Null
    }

    fn get_column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
            .collect()
    }
}

#[async_trait]
impl DataEngine for SqliteDriver {
    fn driver_id(&self) -> &'static str {
        "sqlite"
    }

    fn driver_name(&self) -> &'static str {
        "SQLite"
    }

    async fn connect(&self, params: &ConnectParams) -> EngineResult<Box<dyn BackendConnection>> {
        Self::validate_path(&params.host)?;
        let conn = Self::connect_options(params)
            .connect()
            .await
            .map_err(|e| EngineError::connection_failed(&params.host, e.to_string()))?;

        debug!(path = %params.host, "sqlite connection opened");
        Ok(Box::new(SqliteBackendConnection { conn }))
    }
}

struct SqliteBackendConnection {
    conn: SqliteConnection,
}

#[async_trait]
impl BackendConnection for SqliteBackendConnection {
    async fn execute(&mut self, sql: &str, in_lists: &[InList]) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let (sql, values) = expand_in_lists(sql, in_lists, |_| "?".to_string())?;

        let mut query = sqlx::query(&sql);
        for value in values {
            query = SqliteDriver::bind_param(query, value);
        }

        let sqlite_rows: Vec<SqliteRow> = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let columns = match sqlite_rows.first() {
            Some(first) => SqliteDriver::get_column_info(first),
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
        let rows = sqlite_rows.iter().map(SqliteDriver::convert_row).collect();

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
