// SPDX-License-Identifier: Apache-2.0

//! Join rule registry.
//!
//! A join rule is a preconfigured join key between two or more mapped tables,
//! tagged with a placement hint: `pushdown` rules may be executed as one
//! backend-native join when all their tables live on the same backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// SQL join flavour of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    /// Keyword used when the join is pushed down to a backend
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Full => "FULL JOIN",
        }
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Right => "right",
            JoinType::Full => "full",
        };
        write!(f, "{name}")
    }
}

impl FromStr for JoinType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inner" => Ok(JoinType::Inner),
            "left" => Ok(JoinType::Left),
            "right" => Ok(JoinType::Right),
            "full" => Ok(JoinType::Full),
            other => Err(EngineError::configuration(format!(
                "Unknown join type '{other}' (expected inner, left, right or full)"
            ))),
        }
    }
}

/// A persisted join key between mapped tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRule {
    /// Table identifiers as they appear in the table mapping
    pub tables: Vec<String>,
    pub key: String,
    #[serde(default)]
    pub join_type: JoinType,
    #[serde(default)]
    pub pushdown: bool,
    /// Per-table key column when it differs from `key`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub key_columns: BTreeMap<String, String>,
}

impl JoinRule {
    pub fn new<S: Into<String>>(tables: impl IntoIterator<Item = S>, key: impl Into<String>) -> Self {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            key: key.into(),
            join_type: JoinType::default(),
            pushdown: false,
            key_columns: BTreeMap::new(),
        }
    }

    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    pub fn with_pushdown(mut self, pushdown: bool) -> Self {
        self.pushdown = pushdown;
        self
    }

    pub fn with_key_column(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.key_columns.insert(table.into(), column.into());
        self
    }

    /// Key column of `table` under this rule
    pub fn key_for(&self, table: &str) -> &str {
        self.key_columns
            .get(table)
            .map(String::as_str)
            .unwrap_or(&self.key)
    }

    pub fn involves(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }

    /// True iff every table of the rule is among `tables`
    pub fn applies_to(&self, tables: &[&str]) -> bool {
        self.tables.iter().all(|t| tables.contains(&t.as_str()))
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.tables.len() < 2 {
            return Err(EngineError::configuration(
                "A join rule needs at least two tables",
            ));
        }
        if self.key.trim().is_empty() {
            return Err(EngineError::configuration("A join rule needs a key column"));
        }
        for (i, table) in self.tables.iter().enumerate() {
            if self.tables[..i].contains(table) {
                return Err(EngineError::configuration(format!(
                    "Table '{table}' appears twice in the join rule"
                )));
            }
        }
        if let Some(stray) = self.key_columns.keys().find(|t| !self.involves(t)) {
            return Err(EngineError::configuration(format!(
                "Key column override for '{stray}', which is not part of the rule"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for JoinRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ON {} ({}{})",
            self.tables.join(" + "),
            self.key,
            self.join_type,
            if self.pushdown { ", pushdown" } else { "" }
        )?;
        for (table, column) in &self.key_columns {
            write!(f, " [{table}.{column}]")?;
        }
        Ok(())
    }
}

/// Rules whose tables are all among the query's resolved `tables`, in
/// registry order
pub fn applicable_rules<'a>(rules: &'a [JoinRule], tables: &[&str]) -> Vec<&'a JoinRule> {
    rules.iter().filter(|rule| rule.applies_to(tables)).collect()
}
