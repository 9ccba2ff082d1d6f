// SPDX-License-Identifier: Apache-2.0

//! In-memory Driver
//!
//! Serves fixed tables from process memory. Used for dry runs and by the test
//! suites: it records every statement it receives and counts connects and
//! closes, so callers can verify connection hygiene.
//!
//! ## Supported SQL
//!
//! Only the single-table statements the federation executor generates:
//! `SELECT <cols|*> FROM <schema.table> [AS <alias>] [WHERE <cond> [AND <cond>]...]`
//! where each condition is `<col> IN (?)`, `<col> <op> <literal>`,
//! `<col> IS [NOT] NULL` or `1 = 0`. Other conditions are ignored (the
//! post-merge filter re-applies the full predicate anyway). Anything else,
//! joins included, must be scripted with [`MemoryDriver::respond_to`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{BackendConnection, DataEngine, IN_LIST_MARKER};
use crate::engine::types::{ColumnInfo, ConnectParams, InList, QueryResult, Row, Value};

/// A table held by the in-memory driver
#[derive(Debug, Clone)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// A statement as received by a memory connection
#[derive(Debug, Clone)]
pub struct RecordedStatement {
    pub database: String,
    pub sql: String,
    pub in_lists: Vec<InList>,
}

enum Scripted {
    Respond(QueryResult),
    Fail(String),
}

#[derive(Default)]
struct MemoryState {
    databases: RwLock<HashMap<String, HashMap<String, MemoryTable>>>,
    scripted: Mutex<Vec<(String, Scripted)>>,
    connect_failures: Mutex<HashMap<String, String>>,
    statements: Mutex<Vec<RecordedStatement>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

/// In-memory driver. Cloning shares the same tables and counters.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) `table` (e.g. `public.users`) in `database`
    pub fn add_table(&self, database: &str, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        let table_data = MemoryTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        };
        self.state
            .databases
            .write()
            .entry(database.to_string())
            .or_default()
            .insert(table.to_lowercase(), table_data);
    }

    /// Any statement containing `pattern` returns `result` verbatim
    pub fn respond_to(&self, pattern: &str, result: QueryResult) {
        self.state
            .scripted
            .lock()
            .push((pattern.to_string(), Scripted::Respond(result)));
    }

    /// Any statement containing `pattern` fails with `message`
    pub fn fail_on(&self, pattern: &str, message: &str) {
        self.state
            .scripted
            .lock()
            .push((pattern.to_string(), Scripted::Fail(message.to_string())));
    }

    /// Connecting to `database` fails with `message`
    pub fn fail_connect(&self, database: &str, message: &str) {
        self.state
            .connect_failures
            .lock()
            .insert(database.to_string(), message.to_string());
    }

    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.state.statements.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataEngine for MemoryDriver {
    fn driver_id(&self) -> &'static str {
        "memory"
    }

    fn driver_name(&self) -> &'static str {
        "In-memory"
    }

    async fn connect(&self, params: &ConnectParams) -> EngineResult<Box<dyn BackendConnection>> {
        if let Some(message) = self.state.connect_failures.lock().get(&params.database) {
            return Err(EngineError::connection_failed(&params.database, message.clone()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            database: params.database.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn test_connection(&self, params: &ConnectParams) -> EngineResult<()> {
        self.connect(params).await?.close().await
    }
}

struct MemoryConnection {
    database: String,
    state: Arc<MemoryState>,
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, in_lists: &[InList]) -> EngineResult<QueryResult> {
        let start = Instant::now();
        self.state.statements.lock().push(RecordedStatement {
            database: self.database.clone(),
            sql: sql.to_string(),
            in_lists: in_lists.to_vec(),
        });

        {
            let scripted = self.state.scripted.lock();
            if let Some((_, response)) = scripted.iter().find(|(pattern, _)| sql.contains(pattern.as_str())) {
                return match response {
                    Scripted::Respond(result) => Ok(result.clone()),
                    Scripted::Fail(message) => Err(EngineError::execution_error(message.clone())),
                };
            }
        }

        let statement = SelectStatement::parse(sql)?;
        let databases = self.state.databases.read();
        let table = databases
            .get(&self.database)
            .and_then(|tables| tables.get(&statement.table.to_lowercase()))
            .ok_or_else(|| {
                EngineError::execution_error(format!(
                    "relation \"{}\" does not exist",
                    statement.table
                ))
            })?;

        let mut result = statement.run(table, in_lists)?;
        result.execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;
        Ok(result)
    }

    async fn close(self: Box<Self>) -> EngineResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The subset of SELECT understood by the memory driver
struct SelectStatement {
    columns: Vec<String>,
    table: String,
    conditions: Vec<String>,
}

impl SelectStatement {
    fn parse(sql: &str) -> EngineResult<Self> {
        let upper = sql.to_uppercase();
        if upper.contains(" JOIN ") {
            return Err(EngineError::execution_error(
                "memory driver cannot execute joins; script the response",
            ));
        }
        let select = upper
            .find("SELECT ")
            .ok_or_else(|| EngineError::execution_error("syntax error: expected SELECT"))?;
        let from = upper
            .find(" FROM ")
            .ok_or_else(|| EngineError::execution_error("syntax error: expected FROM"))?;
        let where_pos = upper.find(" WHERE ");

        let columns = sql[select + 7..from]
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let from_clause = &sql[from + 6..where_pos.unwrap_or(sql.len())];
        let table = from_clause
            .split_whitespace()
            .next()
            .ok_or_else(|| EngineError::execution_error("syntax error: missing table"))?
            .to_string();

        let conditions = match where_pos {
            Some(pos) => split_on_and(&sql[pos + 7..]),
            None => Vec::new(),
        };

        Ok(Self {
            columns,
            table,
            conditions,
        })
    }

    fn run(&self, table: &MemoryTable, in_lists: &[InList]) -> EngineResult<QueryResult> {
        let mut lists = in_lists.iter();
        let mut filters: Vec<Box<dyn Fn(&[Value]) -> bool>> = Vec::new();

        for condition in &self.conditions {
            if condition.replace(' ', "") == "1=0" {
                filters.push(Box::new(|_| false));
                continue;
            }
            if let Some(column) = condition.strip_suffix(&format!(" IN {IN_LIST_MARKER}")) {
                let idx = column_index(table, column)?;
                let list = lists.next().cloned().unwrap_or_default();
                filters.push(Box::new(move |row| {
                    !row[idx].is_null()
                        && list
                            .iter()
                            .any(|v| row[idx].sql_cmp(v) == Some(std::cmp::Ordering::Equal))
                }));
                continue;
            }
            if let Some(filter) = simple_condition(table, condition) {
                filters.push(filter);
            }
        }

        let projection: Vec<(usize, String)> = if self.columns.iter().any(|c| c == "*") {
            table.columns.iter().cloned().enumerate().collect()
        } else {
            self.columns
                .iter()
                .map(|expr| {
                    let (source, output) = match split_keyword(expr, " AS ") {
                        Some((source, alias)) => (source, alias.to_string()),
                        None => (expr.as_str(), unqualified(expr).to_string()),
                    };
                    column_index(table, source).map(|idx| (idx, output))
                })
                .collect::<EngineResult<_>>()?
        };

        let rows = table
            .rows
            .iter()
            .filter(|row| filters.iter().all(|f| f(row)))
            .map(|row| Row::new(projection.iter().map(|(idx, _)| row[*idx].clone()).collect()))
            .collect();

        Ok(QueryResult {
            columns: projection
                .iter()
                .map(|(_, name)| ColumnInfo::new(name.clone(), "unknown"))
                .collect(),
            rows,
            execution_time_ms: 0.0,
        })
    }
}

fn unqualified(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column).trim()
}

fn column_index(table: &MemoryTable, column: &str) -> EngineResult<usize> {
    let name = unqualified(column);
    table
        .columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(name))
        .ok_or_else(|| EngineError::execution_error(format!("column \"{name}\" does not exist")))
}

fn split_keyword<'a>(text: &'a str, keyword: &str) -> Option<(&'a str, &'a str)> {
    let pos = text.to_uppercase().find(keyword)?;
    Some((text[..pos].trim(), text[pos + keyword.len()..].trim()))
}

fn split_on_and(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some((head, tail)) = split_keyword(rest, " AND ") {
        parts.push(head.to_string());
        rest = tail;
    }
    parts.push(rest.trim().to_string());
    parts
}

fn parse_literal(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Some(Value::Text(inner.replace("''", "'")));
    }
    if text.eq_ignore_ascii_case("null") {
        return Some(Value::Null);
    }
    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false") {
        return Some(Value::Bool(text.eq_ignore_ascii_case("true")));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::Int(i));
    }
    text.parse::<f64>().ok().map(Value::Float)
}

type RowFilter = Box<dyn Fn(&[Value]) -> bool>;

fn strip_suffix_ignore_case<'a>(text: &'a str, suffix: &str) -> Option<&'a str> {
    let start = text.len().checked_sub(suffix.len())?;
    let tail = text.get(start..)?;
    tail.eq_ignore_ascii_case(suffix).then(|| &text[..start])
}

fn simple_condition(table: &MemoryTable, condition: &str) -> Option<RowFilter> {
    // grouped disjunctions are left to the caller
    if condition.starts_with('(') {
        return None;
    }
    if let Some(column) = strip_suffix_ignore_case(condition, " IS NOT NULL") {
        let idx = column_index(table, column).ok()?;
        return Some(Box::new(move |row| !row[idx].is_null()));
    }
    if let Some(column) = strip_suffix_ignore_case(condition, " IS NULL") {
        let idx = column_index(table, column).ok()?;
        return Some(Box::new(move |row| row[idx].is_null()));
    }

    use std::cmp::Ordering::*;
    const OPERATORS: [(&str, &[std::cmp::Ordering]); 7] = [
        ("<>", &[Less, Greater]),
        ("!=", &[Less, Greater]),
        ("<=", &[Less, Equal]),
        (">=", &[Greater, Equal]),
        ("=", &[Equal]),
        ("<", &[Less]),
        (">", &[Greater]),
    ];
    let (op, accepted) = OPERATORS.iter().find(|(op, _)| condition.contains(op))?;
    let (column, literal) = condition.split_once(op)?;
    let idx = column_index(table, column).ok()?;
    let literal = parse_literal(literal)?;
    let accepted: Vec<std::cmp::Ordering> = accepted.to_vec();
    Some(Box::new(move |row| {
        row[idx]
            .sql_cmp(&literal)
            .map(|ordering| accepted.contains(&ordering))
            .unwrap_or(false)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::Sensitive;

    fn params(database: &str) -> ConnectParams {
        ConnectParams {
            host: "localhost".into(),
            port: 0,
            database: database.into(),
            user: String::new(),
            password: Sensitive::new(String::new()),
        }
    }

    fn driver() -> MemoryDriver {
        let driver = MemoryDriver::new();
        driver.add_table(
            "crm",
            "public.users",
            &["id", "name", "age"],
            vec![
                vec![Value::Int(1), "Alice".into(), Value::Int(34)],
                vec![Value::Int(2), "Bob".into(), Value::Int(25)],
                vec![Value::Int(3), "Carol".into(), Value::Null],
            ],
        );
        driver
    }

    #[tokio::test]
    async fn serves_projection_and_filters() {
        let driver = driver();
        let mut conn = driver.connect(&params("crm")).await.unwrap();

        let result = conn
            .execute(
                "SELECT u.name, u.age FROM public.users AS u WHERE u.age > 30",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.columns[0].name, "name");
        assert_eq!(result.rows, vec![Row::new(vec!["Alice".into(), Value::Int(34)])]);
        conn.close().await.unwrap();
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(driver.close_count(), 1);
    }

    #[tokio::test]
    async fn applies_in_lists_and_null_tests() {
        let driver = driver();
        let mut conn = driver.connect(&params("crm")).await.unwrap();

        let result = conn
            .execute(
                "SELECT * FROM public.users AS u WHERE u.age IS NOT NULL AND u.id IN (?)",
                &[vec![Value::Int(2), Value::Int(3)]],
            )
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].values[1], Value::from("Bob"));

        let probe = conn
            .execute("SELECT * FROM public.users AS u WHERE 1 = 0", &[])
            .await
            .unwrap();
        assert!(probe.rows.is_empty());
        assert_eq!(probe.columns.len(), 3);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn scripted_failures_and_unknown_tables_error() {
        let driver = driver();
        driver.fail_on("public.users", "permission denied for table users");
        let mut conn = driver.connect(&params("crm")).await.unwrap();

        let err = conn.execute("SELECT * FROM public.users", &[]).await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));

        let err = conn.execute("SELECT * FROM public.missing", &[]).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        conn.close().await.unwrap();
        assert_eq!(driver.statements().len(), 2);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let driver = driver();
        driver.fail_connect("crm", "connection refused");
        let err = driver.connect(&params("crm")).await.err().unwrap();
        assert!(matches!(err, EngineError::ConnectionFailed { .. }));
        assert_eq!(driver.connect_count(), 0);
    }
}
