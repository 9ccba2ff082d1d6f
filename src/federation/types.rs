// SPDX-License-Identifier: Apache-2.0

//! Types for the cross-backend federation engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::engine::types::Value;

use super::planner::join_sql;
use super::rules::JoinType;

/// An explicit `JOIN <table> [AS alias] ON <condition>` of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClause {
    /// Table identifier as written
    pub table: String,
    pub alias: Option<String>,
    /// Raw boolean expression text after `ON`
    pub condition: String,
}

/// Structured description of one SELECT statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedQuery {
    /// Projection expressions, in order
    pub columns: Vec<String>,
    /// True when any projection expression contains `*`
    pub select_all: bool,
    /// Table identifiers, in first-appearance order, without duplicates
    pub tables: Vec<String>,
    /// Alias → table identifier
    pub aliases: BTreeMap<String, String>,
    pub joins: Vec<JoinClause>,
    /// Raw WHERE predicate text, `None` when the statement has no WHERE
    pub where_clause: Option<String>,
}

impl ParsedQuery {
    /// Explicit alias bound to `table`, if the query declared one
    pub fn alias_of(&self, table: &str) -> Option<&str> {
        self.aliases
            .iter()
            .find(|(_, t)| t.as_str() == table)
            .map(|(alias, _)| alias.as_str())
    }
}

/// Which columns a table fetch selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelection {
    All,
    Named(Vec<String>),
}

impl ColumnSelection {
    /// Adds `column` to a named list unless already present
    pub fn include(&mut self, column: &str) {
        if let ColumnSelection::Named(columns) = self {
            if !columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                columns.push(column.to_string());
            }
        }
    }
}

/// A query table resolved to its owning backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    /// Identifier as written in the query
    pub identifier: String,
    /// Key of the table mapping this identifier resolved to
    pub mapped_as: String,
    pub backend: String,
    pub schema: String,
    pub table_name: String,
    pub alias: String,
    pub columns: ColumnSelection,
}

impl TableBinding {
    /// `schema.table` as emitted in generated SQL
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table_name)
    }

    /// True when `qualifier` (the part before a column) names this table
    pub fn answers_to(&self, qualifier: &str) -> bool {
        qualifier == self.alias || qualifier == self.identifier || qualifier == self.mapped_as
    }
}

/// Tabular data flowing between pipeline stages. Column names are prefixed
/// `alias.column`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Distinct non-null values of one column, in first-seen order
    pub fn distinct_values(&self, column: usize) -> Vec<Value> {
        let mut seen: Vec<Value> = Vec::new();
        for row in &self.rows {
            let value = &row[column];
            if !value.is_null() && !seen.contains(value) {
                seen.push(value.clone());
            }
        }
        seen
    }
}

/// How one backend group is fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStrategy {
    /// One table on its own
    Single,
    /// One backend-native join statement, plus client-side fetches for the
    /// group tables no pushdown rule covers
    Pushdown,
    ClientSide,
}

impl fmt::Display for GroupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupStrategy::Single => write!(f, "single"),
            GroupStrategy::Pushdown => write!(f, "pushdown"),
            GroupStrategy::ClientSide => write!(f, "client-side"),
        }
    }
}

/// One `alias.key IN (?)` filter of a table fetch, bound to the distinct
/// values of a column fetched earlier in the same group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFilter {
    /// Filtered column of this table (`alias.key`)
    pub column: String,
    /// Binding whose result supplies the values
    pub source: usize,
    /// Prefixed column (`other_alias.key`) whose values are bound
    pub source_column: String,
}

/// Single-table statement. Binding indices refer to `FederationPlan::bindings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFetch {
    pub binding: usize,
    pub sql: String,
    /// One entry per `IN (?)` marker of `sql`, in order
    pub in_filters: Vec<InFilter>,
}

/// `left.left_key = right.right_key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinEdge {
    pub left: usize,
    pub left_key: String,
    pub right_key: String,
}

/// A table joined into a pushdown statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    pub binding: usize,
    pub join_type: JoinType,
    /// Edges to tables joined before this one
    pub on: Vec<JoinEdge>,
}

/// Backend-native join of several tables. The SQL is rendered at execution
/// time, once the column list of every `*` table is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFetch {
    pub root: usize,
    pub targets: Vec<JoinTarget>,
    /// Conjunction pushed into the WHERE clause
    pub predicates: Vec<String>,
}

impl JoinFetch {
    /// Root first, then targets in join order
    pub fn bindings(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(self.root).chain(self.targets.iter().map(|t| t.binding))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStep {
    Table(TableFetch),
    Join(JoinFetch),
}

/// Fetch plan for all tables owned by one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendGroup {
    pub backend: String,
    /// Indices into `FederationPlan::bindings`, in FROM order
    pub members: Vec<usize>,
    pub strategy: GroupStrategy,
    /// Executed in order on one connection
    pub steps: Vec<FetchStep>,
}

/// The complete execution plan for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationPlan {
    pub query: ParsedQuery,
    /// All bindings in FROM order
    pub bindings: Vec<TableBinding>,
    pub groups: Vec<BackendGroup>,
}

impl fmt::Display for FederationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tables:")?;
        for binding in &self.bindings {
            writeln!(
                f,
                "  {} AS {} -> {} ({})",
                binding.identifier,
                binding.alias,
                binding.backend,
                binding.qualified_name()
            )?;
        }
        for group in &self.groups {
            writeln!(f, "Backend '{}' [{}]:", group.backend, group.strategy)?;
            for step in &group.steps {
                match step {
                    FetchStep::Table(fetch) => {
                        writeln!(f, "  {}", fetch.sql)?;
                        for filter in &fetch.in_filters {
                            writeln!(
                                f,
                                "    {} IN <values of {}>",
                                filter.column, filter.source_column
                            )?;
                        }
                    }
                    FetchStep::Join(fetch) => {
                        let columns = vec![None; self.bindings.len()];
                        writeln!(f, "  {}", join_sql(&self.bindings, fetch, &columns))?;
                    }
                }
            }
        }
        if let Some(predicate) = &self.query.where_clause {
            writeln!(f, "Post-merge filter: {predicate}")?;
        }
        Ok(())
    }
}

/// Rows fetched by one step. A pushdown join yields one part covering all of
/// its tables, whose rows are already aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPart {
    /// Binding indices, root first
    pub bindings: Vec<usize>,
    pub result: ResultSet,
}

/// Final answer of a federated query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FederatedResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Wall-clock seconds from parse to final result
    pub elapsed_secs: f64,
}

impl FederatedResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

impl fmt::Display for FederatedResult {
    /// Plain text grid
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(|v| v.to_string()).collect())
            .collect();
        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                cells
                    .iter()
                    .map(|row| row[i].chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |f: &mut fmt::Formatter<'_>, values: &[String]| -> fmt::Result {
            let padded: Vec<String> = values
                .iter()
                .zip(&widths)
                .map(|(v, w)| format!("{v:<w$}"))
                .collect();
            writeln!(f, "| {} |", padded.join(" | "))
        };
        let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();

        line(f, &self.columns)?;
        writeln!(f, "|-{}-|", separator.join("-|-"))?;
        for row in &cells {
            line(f, row)?;
        }
        write!(
            f,
            "({} rows, {:.2}s)",
            self.rows.len(),
            self.elapsed_secs
        )
    }
}
