// SPDX-License-Identifier: Apache-2.0

//! Federation query planner (backend grouper).
//!
//! Partitions resolved tables by owning backend and decides, per backend,
//! whether the group's join is pushed down as one backend-native statement or
//! stitched client-side from single-table fetches with key propagation.
//! Also builds every statement the executor sends.

use crate::engine::traits::IN_LIST_MARKER;

use super::parser::{identifier_chains, map_unquoted, split_conjuncts, split_on_keywords};
use super::rules::{applicable_rules, JoinRule};
use super::types::{
    BackendGroup, ColumnSelection, FederationPlan, FetchStep, GroupStrategy, InFilter, JoinEdge,
    JoinFetch, JoinTarget, ParsedQuery, TableBinding, TableFetch,
};

/// Columns of `binding` referenced through a qualifier anywhere in `text`
fn referenced_columns(binding: &TableBinding, text: &str) -> Vec<String> {
    identifier_chains(text)
        .into_iter()
        .filter_map(|chain| {
            let (column, qualifier) = chain.split_last()?;
            (column != "*" && binding.answers_to(&qualifier.join("."))).then(|| column.clone())
        })
        .collect()
}

/// Extends named column lists with everything merging and post-merge
/// filtering will look up: rule keys, explicit ON columns and WHERE columns.
fn extend_selections(query: &ParsedQuery, bindings: &mut [TableBinding], rules: &[&JoinRule]) {
    // a bare column in WHERE could belong to any table
    if query.where_clause.as_deref().is_some_and(has_bare_column) {
        for binding in bindings.iter_mut() {
            binding.columns = ColumnSelection::All;
        }
        return;
    }
    for binding in bindings.iter_mut() {
        if binding.columns == ColumnSelection::All {
            continue;
        }
        let mut extra: Vec<String> = rules
            .iter()
            .filter(|rule| rule.involves(&binding.mapped_as))
            .map(|rule| rule.key_for(&binding.mapped_as).to_string())
            .collect();
        for join in &query.joins {
            extra.extend(referenced_columns(binding, &join.condition));
        }
        if let Some(predicate) = &query.where_clause {
            extra.extend(referenced_columns(binding, predicate));
        }
        for column in extra {
            binding.columns.include(&column);
        }
    }
}

const PREDICATE_KEYWORDS: [&str; 11] = [
    "AND", "OR", "NOT", "IS", "NULL", "IN", "LIKE", "ILIKE", "BETWEEN", "TRUE", "FALSE",
];

/// True when `predicate` references a column without a qualifier
fn has_bare_column(predicate: &str) -> bool {
    let mut bare = false;
    map_unquoted(predicate, |run| {
        let mut rest = run;
        while let Some(start) = rest.find(|c: char| c.is_ascii_alphabetic() || c == '_') {
            let preceded_by_ident = rest[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '.');
            let tail = &rest[start..];
            let len = tail
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(tail.len());
            let word = &tail[..len];
            let qualified = tail[len..].starts_with('.');
            let call = tail[len..].trim_start().starts_with('(');
            if !preceded_by_ident
                && !qualified
                && !call
                && !PREDICATE_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
            {
                bare = true;
            }
            rest = &tail[len..];
        }
        String::new()
    });
    bare
}

/// True when `fragment` mentions `alias.` as a qualifier
fn mentions_alias(fragment: &str, alias: &str) -> bool {
    identifier_chains(fragment)
        .iter()
        .any(|chain| chain.len() >= 2 && chain[0] == alias)
}

/// WHERE fragments that can run on the backend of `binding`.
///
/// A fragment qualified with this binding's alias is pushed unless it also
/// references another table of the query. Fragments without any `.` are
/// pushed to every table; the post-merge filter re-applies the whole predicate
/// anyway.
pub fn pushdown_predicates(
    where_clause: Option<&str>,
    binding: &TableBinding,
    all: &[TableBinding],
) -> Vec<String> {
    let Some(predicate) = where_clause else {
        return Vec::new();
    };

    split_conjuncts(predicate)
        .into_iter()
        .filter(|fragment| {
            let mut dotted = false;
            map_unquoted(fragment, |run| {
                dotted |= run.contains('.');
                String::new()
            });
            if !dotted {
                return true;
            }
            mentions_alias(fragment, &binding.alias)
                && !all
                    .iter()
                    .filter(|other| other.alias != binding.alias)
                    .any(|other| mentions_alias(fragment, &other.alias))
        })
        .collect()
}

/// A pushed fragment as one WHERE conjunct; a top-level `OR` is wrapped so
/// that it keeps its meaning next to the other conjuncts
fn conjunct(fragment: &str) -> String {
    if split_on_keywords(fragment, &["OR"]).len() > 1 {
        format!("({fragment})")
    } else {
        fragment.to_string()
    }
}

/// `SELECT <cols> FROM schema.table AS alias [WHERE ...]` with one `IN (?)`
/// marker per filter
pub fn table_sql(binding: &TableBinding, predicates: &[String], in_filters: &[InFilter]) -> String {
    let columns = match &binding.columns {
        ColumnSelection::All => "*".to_string(),
        ColumnSelection::Named(columns) => columns
            .iter()
            .map(|c| format!("{}.{}", binding.alias, c))
            .collect::<Vec<_>>()
            .join(", "),
    };

    let mut sql = format!(
        "SELECT {columns} FROM {} AS {}",
        binding.qualified_name(),
        binding.alias
    );
    let conditions: Vec<String> = predicates
        .iter()
        .map(|fragment| conjunct(fragment))
        .chain(
            in_filters
                .iter()
                .map(|filter| format!("{} IN {IN_LIST_MARKER}", filter.column)),
        )
        .collect();
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql
}

/// Zero-row statement used to discover the columns of a `*` table
pub fn probe_sql(binding: &TableBinding) -> String {
    format!(
        "SELECT * FROM {} AS {} WHERE 1 = 0",
        binding.qualified_name(),
        binding.alias
    )
}

/// Synthetic result column name of `column` in a pushdown statement
pub fn synthetic_name(alias: &str, column: &str) -> String {
    format!("{alias}_{column}")
}

/// Renders a pushdown statement. `columns[i]` is the discovered column list of
/// binding `i`; when absent, named selections are used and `*` tables render
/// as `alias.*`.
pub fn join_sql(bindings: &[TableBinding], fetch: &JoinFetch, columns: &[Option<Vec<String>>]) -> String {
    let mut select_items = Vec::new();
    for idx in fetch.bindings() {
        let binding = &bindings[idx];
        let known = columns.get(idx).and_then(Option::as_ref);
        match (known, &binding.columns) {
            (Some(cols), _) | (None, ColumnSelection::Named(cols)) => {
                select_items.extend(cols.iter().map(|c| {
                    format!("{}.{} AS {}", binding.alias, c, synthetic_name(&binding.alias, c))
                }));
            }
            (None, ColumnSelection::All) => select_items.push(format!("{}.*", binding.alias)),
        }
    }

    let root = &bindings[fetch.root];
    let mut sql = format!(
        "SELECT {} FROM {} AS {}",
        select_items.join(", "),
        root.qualified_name(),
        root.alias
    );
    for target in &fetch.targets {
        let binding = &bindings[target.binding];
        let on: Vec<String> = target
            .on
            .iter()
            .map(|edge| {
                format!(
                    "{}.{} = {}.{}",
                    bindings[edge.left].alias, edge.left_key, binding.alias, edge.right_key
                )
            })
            .collect();
        sql.push_str(&format!(
            " {} {} AS {} ON {}",
            target.join_type.sql_keyword(),
            binding.qualified_name(),
            binding.alias,
            on.join(" AND ")
        ));
    }
    if !fetch.predicates.is_empty() {
        sql.push_str(" WHERE ");
        let conditions: Vec<String> = fetch.predicates.iter().map(|f| conjunct(f)).collect();
        sql.push_str(&conditions.join(" AND "));
    }
    sql
}

/// Rule-based `IN` filters of `idx` against the tables already `fetched`
fn in_filters_for(
    idx: usize,
    fetched: &[usize],
    bindings: &[TableBinding],
    rules: &[&JoinRule],
) -> Vec<InFilter> {
    let binding = &bindings[idx];
    let mut filters: Vec<InFilter> = Vec::new();
    for rule in rules.iter().filter(|r| r.involves(&binding.mapped_as)) {
        for &source in fetched {
            let other = &bindings[source];
            if !rule.involves(&other.mapped_as) {
                continue;
            }
            let filter = InFilter {
                column: format!("{}.{}", binding.alias, rule.key_for(&binding.mapped_as)),
                source,
                source_column: format!("{}.{}", other.alias, rule.key_for(&other.mapped_as)),
            };
            if !filters.contains(&filter) {
                filters.push(filter);
            }
        }
    }
    filters
}

fn table_step(
    idx: usize,
    fetched: &[usize],
    query: &ParsedQuery,
    bindings: &[TableBinding],
    rules: &[&JoinRule],
) -> FetchStep {
    let binding = &bindings[idx];
    let predicates = pushdown_predicates(query.where_clause.as_deref(), binding, bindings);
    let in_filters = in_filters_for(idx, fetched, bindings, rules);
    FetchStep::Table(TableFetch {
        binding: idx,
        sql: table_sql(binding, &predicates, &in_filters),
        in_filters,
    })
}

/// Largest set of group members connected by pushdown rules, starting from
/// the first pushdown rule that fits entirely inside the group
fn pushdown_join(
    members: &[usize],
    query: &ParsedQuery,
    bindings: &[TableBinding],
    rules: &[&JoinRule],
) -> Option<JoinFetch> {
    let in_group = |table: &str| members.iter().any(|&m| bindings[m].mapped_as == table);
    let candidates: Vec<&JoinRule> = rules
        .iter()
        .copied()
        .filter(|rule| rule.pushdown && rule.tables.iter().all(|t| in_group(t.as_str())))
        .collect();
    let first = candidates.first()?;

    let member_of = |table: &str| members.iter().copied().find(|&m| bindings[m].mapped_as == table);
    let root = first.tables.iter().filter_map(|t| member_of(t.as_str())).min()?;

    let mut joined = vec![root];
    let mut targets: Vec<JoinTarget> = Vec::new();
    loop {
        // earliest (FROM order) member with an edge into the joined set
        let next = members.iter().copied().filter(|m| !joined.contains(m)).find_map(|m| {
            let table = &bindings[m].mapped_as;
            let mut on = Vec::new();
            let mut join_type = None;
            for rule in candidates.iter().filter(|r| r.involves(table)) {
                for &left in &joined {
                    let left_table = &bindings[left].mapped_as;
                    if rule.involves(left_table) {
                        on.push(JoinEdge {
                            left,
                            left_key: rule.key_for(left_table).to_string(),
                            right_key: rule.key_for(table).to_string(),
                        });
                        join_type.get_or_insert(rule.join_type);
                    }
                }
            }
            join_type.map(|join_type| JoinTarget {
                binding: m,
                join_type,
                on,
            })
        });
        match next {
            Some(target) => {
                joined.push(target.binding);
                targets.push(target);
            }
            None => break,
        }
    }

    let mut predicates: Vec<String> = Vec::new();
    for &idx in &joined {
        for fragment in pushdown_predicates(query.where_clause.as_deref(), &bindings[idx], bindings) {
            if !predicates.contains(&fragment) {
                predicates.push(fragment);
            }
        }
    }

    Some(JoinFetch {
        root,
        targets,
        predicates,
    })
}

fn plan_group(
    backend: String,
    members: Vec<usize>,
    query: &ParsedQuery,
    bindings: &[TableBinding],
    rules: &[&JoinRule],
) -> BackendGroup {
    if let [only] = members.as_slice() {
        let step = table_step(*only, &[], query, bindings, rules);
        return BackendGroup {
            backend,
            members,
            strategy: GroupStrategy::Single,
            steps: vec![step],
        };
    }

    let mut steps = Vec::new();
    let mut fetched: Vec<usize> = Vec::new();
    let strategy = match pushdown_join(&members, query, bindings, rules) {
        Some(join) => {
            fetched.extend(join.bindings());
            steps.push(FetchStep::Join(join));
            GroupStrategy::Pushdown
        }
        None => GroupStrategy::ClientSide,
    };

    for &idx in &members {
        if fetched.contains(&idx) {
            continue;
        }
        steps.push(table_step(idx, &fetched, query, bindings, rules));
        fetched.push(idx);
    }

    BackendGroup {
        backend,
        members,
        strategy,
        steps,
    }
}

/// Builds the execution plan for a parsed and resolved query.
pub fn build_plan(query: ParsedQuery, mut bindings: Vec<TableBinding>, rules: &[JoinRule]) -> FederationPlan {
    let tables: Vec<&str> = bindings.iter().map(|b| b.mapped_as.as_str()).collect();
    let applicable = applicable_rules(rules, &tables);
    extend_selections(&query, &mut bindings, &applicable);

    // groups in order of first appearance
    let mut partitions: Vec<(String, Vec<usize>)> = Vec::new();
    for (idx, binding) in bindings.iter().enumerate() {
        match partitions.iter_mut().find(|(backend, _)| *backend == binding.backend) {
            Some((_, members)) => members.push(idx),
            None => partitions.push((binding.backend.clone(), vec![idx])),
        }
    }

    let groups = partitions
        .into_iter()
        .map(|(backend, members)| plan_group(backend, members, &query, &bindings, &applicable))
        .collect();

    FederationPlan {
        query,
        bindings,
        groups,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::federation::parser::parse;
    use crate::federation::resolver::resolve;
    use crate::federation::rules::JoinType;

    fn plan(sql: &str, mapping: &[(&str, &str)], rules: &[JoinRule]) -> FederationPlan {
        let mapping: BTreeMap<String, String> = mapping
            .iter()
            .map(|(t, b)| (t.to_string(), b.to_string()))
            .collect();
        let query = parse(sql).unwrap();
        let bindings = resolve(&query, &mapping).unwrap();
        build_plan(query, bindings, rules)
    }

    fn table_fetch(step: &FetchStep) -> &TableFetch {
        match step {
            FetchStep::Table(fetch) => fetch,
            FetchStep::Join(_) => panic!("expected a table fetch"),
        }
    }

    #[test]
    fn single_table_pushes_its_own_predicates() {
        let plan = plan(
            "SELECT u.name FROM public.users u WHERE u.name = 'Alice' AND u.age > 30",
            &[("public.users", "crm")],
            &[],
        );
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].strategy, GroupStrategy::Single);
        assert_eq!(
            table_fetch(&plan.groups[0].steps[0]).sql,
            "SELECT u.name, u.age FROM public.users AS u WHERE u.name = 'Alice' AND u.age > 30"
        );
    }

    #[test]
    fn bare_where_column_widens_selection() {
        let plan = plan(
            "SELECT u.name FROM users u WHERE age > 30 AND u.name LIKE 'A%'",
            &[("public.users", "crm")],
            &[],
        );
        assert_eq!(
            table_fetch(&plan.groups[0].steps[0]).sql,
            "SELECT * FROM public.users AS u WHERE age > 30 AND u.name LIKE 'A%'"
        );
        assert!(!has_bare_column("u.age IS NOT NULL AND lower(u.name) = 'bob'"));
        assert!(has_bare_column("u.id = 1 OR status = 'open'"));
    }

    #[test]
    fn cross_table_fragments_stay_client_side() {
        let plan = plan(
            "SELECT * FROM public.users u, public.orders o \
             WHERE u.id = o.user_id AND o.product = 'Book' AND status = 1",
            &[("public.users", "crm"), ("public.orders", "shop")],
            &[],
        );
        let users = table_fetch(&plan.groups[0].steps[0]);
        let orders = table_fetch(&plan.groups[1].steps[0]);
        assert_eq!(users.sql, "SELECT * FROM public.users AS u WHERE status = 1");
        assert_eq!(
            orders.sql,
            "SELECT * FROM public.orders AS o WHERE o.product = 'Book' AND status = 1"
        );
    }

    #[test]
    fn client_side_group_propagates_keys() {
        let rules = vec![JoinRule::new(["public.users", "public.orders"], "user_id")
            .with_key_column("public.users", "id")
            .with_join_type(JoinType::Left)];
        let plan = plan(
            "SELECT u.name, o.product FROM public.users u, public.orders o",
            &[("public.users", "crm"), ("public.orders", "crm")],
            &rules,
        );
        let group = &plan.groups[0];
        assert_eq!(group.strategy, GroupStrategy::ClientSide);
        assert_eq!(
            table_fetch(&group.steps[0]).sql,
            "SELECT u.name, u.id FROM public.users AS u"
        );
        let orders = table_fetch(&group.steps[1]);
        assert_eq!(
            orders.sql,
            "SELECT o.product, o.user_id FROM public.orders AS o WHERE o.user_id IN (?)"
        );
        assert_eq!(
            orders.in_filters,
            vec![InFilter {
                column: "o.user_id".into(),
                source: 0,
                source_column: "u.id".into(),
            }]
        );
    }

    #[test]
    fn disjunction_stays_grouped_next_to_key_filter() {
        let rules = vec![JoinRule::new(["public.users", "public.orders"], "user_id")
            .with_key_column("public.users", "id")];
        let plan = plan(
            "SELECT u.name, o.product FROM public.users u, public.orders o \
             WHERE o.product = 'Pen' OR o.product = 'Book'",
            &[("public.users", "crm"), ("public.orders", "crm")],
            &rules,
        );
        let orders = table_fetch(&plan.groups[0].steps[1]);
        assert_eq!(
            orders.sql,
            "SELECT o.product, o.user_id FROM public.orders AS o \
             WHERE (o.product = 'Pen' OR o.product = 'Book') AND o.user_id IN (?)"
        );
    }

    #[test]
    fn pushdown_rule_builds_one_join_statement() {
        let rules = vec![JoinRule::new(["public.users", "public.orders"], "user_id")
            .with_join_type(JoinType::Left)
            .with_pushdown(true)];
        let plan = plan(
            "SELECT u.name, o.product FROM public.users u, public.orders o, public.notes n \
             WHERE u.name = 'Alice'",
            &[("public.users", "crm"), ("public.orders", "crm"), ("public.notes", "crm")],
            &rules,
        );
        let group = &plan.groups[0];
        assert_eq!(group.strategy, GroupStrategy::Pushdown);
        let FetchStep::Join(join) = &group.steps[0] else {
            panic!("expected pushdown join first");
        };
        assert_eq!(join.bindings().collect::<Vec<_>>(), vec![0, 1]);
        let columns = vec![None; plan.bindings.len()];
        assert_eq!(
            join_sql(&plan.bindings, join, &columns),
            "SELECT u.name AS u_name, u.user_id AS u_user_id, o.product AS o_product, \
             o.user_id AS o_user_id FROM public.users AS u \
             LEFT JOIN public.orders AS o ON u.user_id = o.user_id WHERE u.name = 'Alice'"
        );
        // the uncovered table is still fetched, client-side, on the same backend
        assert_eq!(
            table_fetch(&group.steps[1]).sql,
            "SELECT * FROM public.notes AS n"
        );
    }

    #[test]
    fn non_pushdown_rule_keeps_group_client_side() {
        let rules = vec![JoinRule::new(["public.users", "public.orders"], "user_id")];
        let plan = plan(
            "SELECT * FROM public.users u JOIN public.orders o ON u.user_id = o.user_id",
            &[("public.users", "crm"), ("public.orders", "crm")],
            &rules,
        );
        assert_eq!(plan.groups[0].strategy, GroupStrategy::ClientSide);
        assert_eq!(plan.groups[0].steps.len(), 2);
    }

    #[test]
    fn groups_follow_first_appearance() {
        let plan = plan(
            "SELECT * FROM a.x, b.y, a.z",
            &[("a.x", "one"), ("b.y", "two"), ("a.z", "one")],
            &[],
        );
        let backends: Vec<&str> = plan.groups.iter().map(|g| g.backend.as_str()).collect();
        assert_eq!(backends, vec!["one", "two"]);
        assert_eq!(plan.groups[0].members, vec![0, 2]);
    }
}
