// SPDX-License-Identifier: Apache-2.0

//! Cross-backend merger.
//!
//! Folds the fetched parts into one result, in FROM order. Each new part is
//! left-joined on the keys of an explicit `JOIN ... ON` condition, else on
//! the keys of an applicable join rule. When neither yields a key, the part is
//! appended column-wise by row position: rows are paired by index and the
//! shorter side is padded with NULLs. That fallback is only meaningful when
//! both sides already list corresponding rows in the same order.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::engine::types::Value;

use super::parser::split_on_keywords;
use super::rules::{applicable_rules, JoinRule};
use super::types::{FederationPlan, FetchedPart, ResultSet};

/// Column index pairs `(accumulator, joined part)`
type KeyPairs = Vec<(usize, usize)>;

/// Merges `parts` into one result. A single part is returned unchanged.
pub fn merge(plan: &FederationPlan, rules: &[JoinRule], mut parts: Vec<FetchedPart>) -> ResultSet {
    parts.sort_by_key(|part| part.bindings.iter().min().copied().unwrap_or(usize::MAX));
    let mut parts = parts.into_iter();
    let Some(first) = parts.next() else {
        return ResultSet::default();
    };

    let tables: Vec<&str> = plan.bindings.iter().map(|b| b.mapped_as.as_str()).collect();
    let rules = applicable_rules(rules, &tables);

    let mut merged = first.bindings;
    let mut acc = first.result;
    for part in parts {
        let keys = explicit_keys(plan, &part, &acc)
            .or_else(|| rule_keys(plan, &rules, &merged, &part, &acc));
        acc = match keys {
            Some(keys) => {
                let names: Vec<String> = keys
                    .iter()
                    .map(|&(l, r)| format!("{} = {}", acc.columns[l], part.result.columns[r]))
                    .collect();
                debug!(on = %names.join(" AND "), "left-merging part");
                left_merge(acc, part.result, &keys)
            }
            None => {
                let tables: Vec<&str> = part
                    .bindings
                    .iter()
                    .map(|&idx| plan.bindings[idx].identifier.as_str())
                    .collect();
                warn!(
                    tables = %tables.join(", "),
                    "no join condition or rule links these tables; concatenating rows by position"
                );
                concat(acc, part.result)
            }
        };
        merged.extend(part.bindings);
    }
    acc
}

/// `alias.column` of a qualified column reference, with the binding index
fn merged_name(plan: &FederationPlan, expr: &str) -> Option<(usize, String)> {
    let (qualifier, column) = expr.trim().rsplit_once('.')?;
    plan.bindings
        .iter()
        .position(|b| b.answers_to(qualifier))
        .map(|idx| (idx, format!("{}.{}", plan.bindings[idx].alias, column)))
}

/// Both sides of the first `=` that is not part of `!=`, `<=`, `>=` or `<>`
fn split_equality(comparison: &str) -> Option<(&str, &str)> {
    let text = comparison.trim().trim_start_matches('(').trim_end_matches(')');
    let bytes = text.as_bytes();
    let pos = (0..bytes.len()).find(|&i| {
        bytes[i] == b'='
            && (i == 0 || !matches!(bytes[i - 1], b'!' | b'<' | b'>'))
            && bytes.get(i + 1) != Some(&b'=')
    })?;
    Some((text[..pos].trim(), text[pos + 1..].trim()))
}

/// Key pairs from the explicit `ON` condition of a table in `part`
fn explicit_keys(plan: &FederationPlan, part: &FetchedPart, acc: &ResultSet) -> Option<KeyPairs> {
    for join in &plan.query.joins {
        let names_part = part.bindings.iter().any(|&idx| {
            let binding = &plan.bindings[idx];
            binding.identifier == join.table || join.alias.as_deref() == Some(binding.alias.as_str())
        });
        if !names_part {
            continue;
        }

        let mut keys = KeyPairs::new();
        for comparison in split_on_keywords(&join.condition, &["AND", "OR"]) {
            let Some((lhs, rhs)) = split_equality(&comparison) else {
                continue;
            };
            let (Some(lhs), Some(rhs)) = (merged_name(plan, lhs), merged_name(plan, rhs)) else {
                continue;
            };
            // the side qualified by this part is the right key
            let (this, other) = if part.bindings.contains(&lhs.0) {
                (lhs.1, rhs.1)
            } else if part.bindings.contains(&rhs.0) {
                (rhs.1, lhs.1)
            } else {
                continue;
            };
            if let (Some(l), Some(r)) = (acc.column_index(&other), part.result.column_index(&this)) {
                keys.push((l, r));
            }
        }
        if !keys.is_empty() {
            return Some(keys);
        }
    }
    None
}

/// Key pair of the first rule linking a table of `part` to a merged table
fn rule_keys(
    plan: &FederationPlan,
    rules: &[&JoinRule],
    merged: &[usize],
    part: &FetchedPart,
    acc: &ResultSet,
) -> Option<KeyPairs> {
    for rule in rules {
        for &idx in &part.bindings {
            let this = &plan.bindings[idx];
            if !rule.involves(&this.mapped_as) {
                continue;
            }
            for &other_idx in merged {
                let other = &plan.bindings[other_idx];
                if !rule.involves(&other.mapped_as) {
                    continue;
                }
                let left = format!("{}.{}", other.alias, rule.key_for(&other.mapped_as));
                let right = format!("{}.{}", this.alias, rule.key_for(&this.mapped_as));
                if let (Some(l), Some(r)) = (acc.column_index(&left), part.result.column_index(&right)) {
                    return Some(vec![(l, r)]);
                }
            }
        }
    }
    None
}

/// Hashable form of a join key cell. Integral floats share the integer form.
#[derive(Debug, PartialEq, Eq, Hash)]
enum KeyPart {
    Int(i64),
    Float(u64),
    Text(String),
    Bool(bool),
    Bytes(Vec<u8>),
}

fn key_part(value: &Value) -> Option<KeyPart> {
    match value {
        Value::Null => None,
        Value::Int(i) => Some(KeyPart::Int(*i)),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                Some(KeyPart::Int(*f as i64))
            } else {
                Some(KeyPart::Float(f.to_bits()))
            }
        }
        Value::Text(s) => Some(KeyPart::Text(s.clone())),
        Value::Bool(b) => Some(KeyPart::Bool(*b)),
        Value::Bytes(b) => Some(KeyPart::Bytes(b.clone())),
        Value::Json(j) => Some(KeyPart::Text(j.to_string())),
    }
}

/// Key of one row; `None` when any key cell is NULL
fn row_key(row: &[Value], columns: impl Iterator<Item = usize>) -> Option<Vec<KeyPart>> {
    columns.map(|c| key_part(&row[c])).collect()
}

/// Columns of `right` whose names the accumulator does not already carry
fn new_columns(acc: &ResultSet, right: &ResultSet) -> Vec<usize> {
    (0..right.columns.len())
        .filter(|&i| acc.column_index(&right.columns[i]).is_none())
        .collect()
}

fn left_merge(acc: ResultSet, right: ResultSet, keys: &[(usize, usize)]) -> ResultSet {
    let keep = new_columns(&acc, &right);

    let mut index: HashMap<Vec<KeyPart>, Vec<usize>> = HashMap::new();
    for (r, row) in right.rows.iter().enumerate() {
        if let Some(key) = row_key(row, keys.iter().map(|k| k.1)) {
            index.entry(key).or_default().push(r);
        }
    }

    let mut rows = Vec::with_capacity(acc.rows.len());
    for left in acc.rows {
        let matches = row_key(&left, keys.iter().map(|k| k.0)).and_then(|key| index.get(&key));
        match matches {
            Some(matches) => {
                for &r in matches {
                    let mut row = left.clone();
                    row.extend(keep.iter().map(|&i| right.rows[r][i].clone()));
                    rows.push(row);
                }
            }
            None => {
                let mut row = left;
                row.extend(keep.iter().map(|_| Value::Null));
                rows.push(row);
            }
        }
    }

    let mut columns = acc.columns;
    columns.extend(keep.iter().map(|&i| right.columns[i].clone()));
    ResultSet::new(columns, rows)
}

fn concat(acc: ResultSet, right: ResultSet) -> ResultSet {
    let keep = new_columns(&acc, &right);
    let width = acc.columns.len();
    let height = acc.rows.len().max(right.rows.len());

    let mut left_rows = acc.rows.into_iter();
    let mut right_rows = right.rows.into_iter();
    let rows = (0..height)
        .map(|_| {
            let mut row = left_rows
                .next()
                .unwrap_or_else(|| vec![Value::Null; width]);
            match right_rows.next() {
                Some(right_row) => row.extend(keep.iter().map(|&i| right_row[i].clone())),
                None => row.extend(keep.iter().map(|_| Value::Null)),
            }
            row
        })
        .collect();

    let mut columns = acc.columns;
    columns.extend(keep.iter().map(|&i| right.columns[i].clone()));
    ResultSet::new(columns, rows)
}
