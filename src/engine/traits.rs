// SPDX-License-Identifier: Apache-2.0

//! DataEngine trait definition
//!
//! This is the backend collaborator of the federation engine. A driver opens
//! connections; a connection executes statements and is closed explicitly by
//! whoever opened it.

use async_trait::async_trait;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{ConnectParams, InList, QueryResult, Value};

/// Marker for a parameterised `IN` list inside generated SQL.
///
/// Drivers replace each occurrence, in order, with their own placeholder
/// syntax for the matching [`InList`]. An empty list becomes `(NULL)`.
pub const IN_LIST_MARKER: &str = "(?)";

/// Core trait that all backend drivers implement
#[async_trait]
pub trait DataEngine: Send + Sync {
    /// Returns the unique identifier for this driver (e.g., "postgres", "sqlite")
    fn driver_id(&self) -> &'static str;

    /// Returns a human-readable name for this driver
    fn driver_name(&self) -> &'static str;

    /// Opens a new connection. Connections are never pooled.
    async fn connect(&self, params: &ConnectParams) -> EngineResult<Box<dyn BackendConnection>>;

    /// Opens a connection, runs a trivial statement and closes it again
    async fn test_connection(&self, params: &ConnectParams) -> EngineResult<()> {
        let mut conn = self.connect(params).await?;
        let outcome = conn.execute("SELECT 1", &[]).await.map(|_| ());
        conn.close().await?;
        outcome
    }
}

/// One open connection to a backend
#[async_trait]
pub trait BackendConnection: Send {
    /// Executes one statement. `in_lists` binds the `(?)` markers in order.
    async fn execute(&mut self, sql: &str, in_lists: &[InList]) -> EngineResult<QueryResult>;

    /// Releases the connection
    async fn close(self: Box<Self>) -> EngineResult<()>;
}

/// Byte offset of the first `(?)` marker outside quoted literals and
/// identifiers. A doubled quote (`''`) leaves and re-enters the literal.
fn next_marker(sql: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (pos, c) in sql.char_indices() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if sql[pos..].starts_with(IN_LIST_MARKER) => return Some(pos),
            None => {}
        }
    }
    None
}

/// Expands every `(?)` marker of `sql` with `placeholder(n)` for the n-th
/// bound value (1-based). Returns the rewritten SQL and the flattened values.
pub fn expand_in_lists<'a>(
    sql: &str,
    in_lists: &'a [InList],
    placeholder: impl Fn(usize) -> String,
) -> EngineResult<(String, Vec<&'a Value>)> {
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut rest = sql;
    let mut lists = in_lists.iter();

    while let Some(pos) = next_marker(rest) {
        out.push_str(&rest[..pos]);
        let list = lists.next().ok_or_else(|| {
            EngineError::execution_error(
                "Statement has more IN markers than bound lists",
            )
        })?;
        if list.is_empty() {
            out.push_str("(NULL)");
        } else {
            let placeholders: Vec<String> = list
                .iter()
                .map(|value| {
                    values.push(value);
                    placeholder(values.len())
                })
                .collect();
            out.push('(');
            out.push_str(&placeholders.join(", "));
            out.push(')');
        }
        rest = &rest[pos + IN_LIST_MARKER.len()..];
    }
    out.push_str(rest);

    if lists.next().is_some() {
        return Err(EngineError::execution_error(
            "More IN lists bound than markers in statement",
        ));
    }
    Ok((out, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_markers_with_numbered_placeholders() {
        let lists = vec![vec![Value::Int(1), Value::Int(2)], vec![Value::from("a")]];
        let (sql, values) = expand_in_lists(
            "SELECT * FROM t AS t WHERE t.a IN (?) AND t.b IN (?)",
            &lists,
            |n| format!("${n}"),
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t AS t WHERE t.a IN ($1, $2) AND t.b IN ($3)");
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn empty_list_matches_nothing() {
        let lists = vec![Vec::new()];
        let (sql, values) =
            expand_in_lists("SELECT * FROM t WHERE t.a IN (?)", &lists, |_| "?".into()).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE t.a IN (NULL)");
        assert!(values.is_empty());
    }

    #[test]
    fn markers_inside_literals_are_left_alone() {
        let (sql, values) =
            expand_in_lists("SELECT * FROM t AS u WHERE u.name = 'what(?)'", &[], |_| "?".into())
                .unwrap();
        assert_eq!(sql, "SELECT * FROM t AS u WHERE u.name = 'what(?)'");
        assert!(values.is_empty());

        let lists = vec![vec![Value::Int(7)]];
        let (sql, values) = expand_in_lists(
            "SELECT * FROM t AS u WHERE u.note <> 'it''s (?)' AND \"u\".\"(?)\" = 1 AND u.id IN (?)",
            &lists,
            |n| format!("${n}"),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM t AS u WHERE u.note <> 'it''s (?)' AND \"u\".\"(?)\" = 1 AND u.id IN ($1)"
        );
        assert_eq!(values, vec![&Value::Int(7)]);
    }

    #[test]
    fn mismatched_marker_count_is_an_error() {
        assert!(expand_in_lists("SELECT 1", &[vec![Value::Int(1)]], |_| "?".into()).is_err());
        assert!(expand_in_lists("SELECT * FROM t WHERE a IN (?)", &[], |_| "?".into()).is_err());
    }
}
