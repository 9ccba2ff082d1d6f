// SPDX-License-Identifier: Apache-2.0

//! Table resolver.
//!
//! Maps each table identifier of a parsed query to the backend that owns it,
//! using the persisted table mapping (table identifier → backend name).

use std::collections::BTreeMap;

use crate::engine::error::{EngineError, EngineResult};

use super::parser::identifier_chains;
use super::types::{ColumnSelection, ParsedQuery, TableBinding};

const DEFAULT_SCHEMA: &str = "public";

fn last_segment(identifier: &str) -> &str {
    identifier.rsplit('.').next().unwrap_or(identifier)
}

/// Mapping key for `identifier`: the identifier itself, or the single mapped
/// table sharing its unqualified name.
pub fn resolve_identifier<'m>(
    identifier: &str,
    mapping: &'m BTreeMap<String, String>,
) -> EngineResult<(&'m str, &'m str)> {
    if let Some((key, backend)) = mapping.get_key_value(identifier) {
        return Ok((key.as_str(), backend.as_str()));
    }

    let name = last_segment(identifier);
    let candidates: Vec<(&String, &String)> = mapping
        .iter()
        .filter(|(key, _)| last_segment(key) == name)
        .collect();

    match candidates.as_slice() {
        [] => Err(EngineError::unknown_table(identifier)),
        [(key, backend)] => Ok((key.as_str(), backend.as_str())),
        many => Err(EngineError::ambiguous_table(
            identifier,
            many.iter().map(|(key, _)| key.to_string()).collect(),
        )),
    }
}

/// Columns of the projection that reference the table bound as
/// `alias`/`identifier`
fn column_selection(query: &ParsedQuery, names: &[&str]) -> ColumnSelection {
    let mut selection = ColumnSelection::Named(Vec::new());

    for item in &query.columns {
        if item.trim() == "*" {
            return ColumnSelection::All;
        }
        let chains = identifier_chains(item);
        if chains.is_empty() {
            // unqualified column (or a literal): it could belong to any table
            return ColumnSelection::All;
        }
        for chain in chains {
            let Some((column, qualifier)) = chain.split_last() else {
                continue;
            };
            let qualifier = qualifier.join(".");
            if !names.contains(&qualifier.as_str()) {
                continue;
            }
            if column == "*" {
                return ColumnSelection::All;
            }
            selection.include(column);
        }
    }

    match selection {
        ColumnSelection::Named(columns) if columns.is_empty() => ColumnSelection::All,
        named => named,
    }
}

/// Resolves every table of `query` to a [`TableBinding`], in FROM order.
pub fn resolve(
    query: &ParsedQuery,
    mapping: &BTreeMap<String, String>,
) -> EngineResult<Vec<TableBinding>> {
    let mut bindings: Vec<TableBinding> = Vec::with_capacity(query.tables.len());

    for identifier in &query.tables {
        let (mapped_as, backend) = resolve_identifier(identifier, mapping)?;

        let (schema, table_name) = match mapped_as.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => (DEFAULT_SCHEMA.to_string(), mapped_as.to_string()),
        };
        let alias = query
            .alias_of(identifier)
            .map(str::to_string)
            .unwrap_or_else(|| table_name.clone());

        if let Some(other) = bindings
            .iter()
            .find(|b| b.alias == alias || b.mapped_as == mapped_as)
        {
            return Err(EngineError::parse(format!(
                "'{}' and '{}' both bind '{}' as '{}'; give one of them a distinct alias",
                other.identifier, identifier, mapped_as, alias
            )));
        }

        let columns = column_selection(query, &[alias.as_str(), identifier.as_str(), mapped_as]);
        bindings.push(TableBinding {
            identifier: identifier.clone(),
            mapped_as: mapped_as.to_string(),
            backend: backend.to_string(),
            schema,
            table_name,
            alias,
            columns,
        });
    }

    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::parser::parse;

    fn mapping() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("public.users".to_string(), "crm".to_string()),
            ("public.orders".to_string(), "shop".to_string()),
            ("sales.orders".to_string(), "warehouse".to_string()),
            ("events".to_string(), "analytics".to_string()),
        ])
    }

    #[test]
    fn exact_identifier_wins() {
        let query = parse("SELECT * FROM public.orders").unwrap();
        let bindings = resolve(&query, &mapping()).unwrap();
        assert_eq!(bindings[0].backend, "shop");
        assert_eq!(bindings[0].schema, "public");
        assert_eq!(bindings[0].table_name, "orders");
        assert_eq!(bindings[0].alias, "orders");
        assert_eq!(bindings[0].columns, ColumnSelection::All);
    }

    #[test]
    fn single_candidate_substitutes_silently() {
        let query = parse("SELECT u.name FROM users u").unwrap();
        let bindings = resolve(&query, &mapping()).unwrap();
        assert_eq!(bindings[0].mapped_as, "public.users");
        assert_eq!(bindings[0].identifier, "users");
        assert_eq!(bindings[0].alias, "u");
        assert_eq!(bindings[0].columns, ColumnSelection::Named(vec!["name".into()]));
    }

    #[test]
    fn ambiguous_name_lists_all_candidates() {
        let query = parse("SELECT * FROM orders").unwrap();
        let err = resolve(&query, &mapping()).unwrap_err();
        match &err {
            EngineError::AmbiguousTable { candidates, .. } => {
                assert_eq!(candidates, &vec!["public.orders".to_string(), "sales.orders".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("public.orders") && message.contains("sales.orders"));
    }

    #[test]
    fn unknown_table_fails() {
        let query = parse("SELECT * FROM public.invoices").unwrap();
        assert!(matches!(
            resolve(&query, &mapping()),
            Err(EngineError::UnknownTable { .. })
        ));
    }

    #[test]
    fn unqualified_mapping_defaults_to_public_schema() {
        let query = parse("SELECT e.kind FROM events e").unwrap();
        let bindings = resolve(&query, &mapping()).unwrap();
        assert_eq!(bindings[0].qualified_name(), "public.events");
    }

    #[test]
    fn column_selection_follows_projection() {
        let query = parse(
            "SELECT u.name, o.* FROM public.users u JOIN public.orders o ON u.id = o.user_id",
        )
        .unwrap();
        let bindings = resolve(&query, &mapping()).unwrap();
        assert_eq!(bindings[0].columns, ColumnSelection::Named(vec!["name".into()]));
        assert_eq!(bindings[1].columns, ColumnSelection::All);

        let query = parse("SELECT name FROM public.users u").unwrap();
        let bindings = resolve(&query, &mapping()).unwrap();
        assert_eq!(bindings[0].columns, ColumnSelection::All);
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let query = parse("SELECT * FROM public.orders, sales.orders").unwrap();
        assert!(resolve(&query, &mapping()).is_err());
    }
}
