// SPDX-License-Identifier: Apache-2.0

//! Per-backend executor.
//!
//! Runs the fetch steps of a [`FederationPlan`]. Every backend group gets one
//! connection, opened lazily through a [`ConnectionScope`] that closes all of
//! them once the query is over, whether it succeeded or not. Groups run
//! concurrently; the steps of one group run in order, so `IN` filters always
//! see the rows they depend on.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ConnectionProfile;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::DriverRegistry;
use crate::engine::traits::{BackendConnection, DataEngine};
use crate::engine::types::{ConnectParams, InList, QueryResult};
use crate::vault::CredentialProvider;

use super::planner::{join_sql, probe_sql, synthetic_name};
use super::types::{
    BackendGroup, ColumnSelection, FederationPlan, FetchStep, FetchedPart, InFilter, JoinFetch,
    ResultSet, TableBinding, TableFetch,
};

/// Opens backend connections from the configured profiles, drivers and
/// credentials
pub struct Connector<'a> {
    pub profiles: &'a BTreeMap<String, ConnectionProfile>,
    pub registry: &'a DriverRegistry,
    pub credentials: &'a dyn CredentialProvider,
}

impl Connector<'_> {
    /// Driver and connection parameters for `backend`
    fn target(&self, backend: &str) -> EngineResult<(Arc<dyn DataEngine>, ConnectParams)> {
        let profile = self.profiles.get(backend).ok_or_else(|| {
            EngineError::configuration(format!("No connection profile for backend '{backend}'"))
        })?;
        let driver = self
            .registry
            .get(&profile.driver)
            .ok_or_else(|| EngineError::driver_not_found(&profile.driver))?;
        let credentials = self
            .credentials
            .get_credentials(backend)?
            .unwrap_or_default();

        let params = ConnectParams {
            host: profile.host.clone(),
            port: profile.port,
            database: profile.database.clone(),
            user: credentials.user,
            password: credentials.password,
        };
        Ok((driver, params))
    }

    pub async fn connect(&self, backend: &str) -> EngineResult<Box<dyn BackendConnection>> {
        let (driver, params) = self.target(backend)?;
        driver
            .connect(&params)
            .await
            .map_err(|e| connection_error(backend, e))
    }

    /// Opens and closes one connection through the driver's own check
    pub async fn test(&self, backend: &str) -> EngineResult<()> {
        let (driver, params) = self.target(backend)?;
        driver
            .test_connection(&params)
            .await
            .map_err(|e| connection_error(backend, e))
    }
}

fn connection_error(backend: &str, err: EngineError) -> EngineError {
    match err {
        EngineError::ConnectionFailed { message, .. } => {
            EngineError::connection_failed(backend, message)
        }
        other => EngineError::connection_failed(backend, other.to_string()),
    }
}

type SharedConnection = Arc<Mutex<Option<Box<dyn BackendConnection>>>>;

/// Connections opened for one query
#[derive(Default)]
pub struct ConnectionScope {
    opened: parking_lot::Mutex<Vec<(String, SharedConnection)>>,
}

impl ConnectionScope {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open(&self, backend: &str, connector: &Connector<'_>) -> EngineResult<SharedConnection> {
        let conn = connector.connect(backend).await?;
        debug!(backend = %backend, "connection opened");
        let shared = Arc::new(Mutex::new(Some(conn)));
        self.opened
            .lock()
            .push((backend.to_string(), Arc::clone(&shared)));
        Ok(shared)
    }

    /// Number of connections still open
    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }

    /// Closes every connection opened through this scope. Close failures are
    /// logged and do not mask the query outcome.
    pub async fn close_all(&self) {
        let opened = std::mem::take(&mut *self.opened.lock());
        for (backend, shared) in opened {
            let Some(conn) = shared.lock().await.take() else {
                continue;
            };
            match conn.close().await {
                Ok(()) => debug!(backend = %backend, "connection closed"),
                Err(e) => warn!(backend = %backend, error = %e, "failed to close connection"),
            }
        }
    }
}

/// Runs every group of `plan` and returns the fetched parts, group by group.
pub async fn execute_plan(plan: &FederationPlan, connector: &Connector<'_>) -> EngineResult<Vec<FetchedPart>> {
    let scope = ConnectionScope::new();
    let outcome = try_join_all(
        plan.groups
            .iter()
            .map(|group| execute_group(plan, group, connector, &scope)),
    )
    .await;
    scope.close_all().await;

    Ok(outcome?.into_iter().flatten().collect())
}

async fn execute_group(
    plan: &FederationPlan,
    group: &BackendGroup,
    connector: &Connector<'_>,
    scope: &ConnectionScope,
) -> EngineResult<Vec<FetchedPart>> {
    let shared = scope.open(&group.backend, connector).await?;
    let mut guard = shared.lock().await;
    let conn = guard
        .as_mut()
        .ok_or_else(|| EngineError::execution_error("Connection already closed"))?;

    let mut parts: Vec<FetchedPart> = Vec::with_capacity(group.steps.len());
    for step in &group.steps {
        let part = match step {
            FetchStep::Table(fetch) => fetch_table(plan, fetch, &parts, conn.as_mut()).await?,
            FetchStep::Join(fetch) => fetch_join(plan, fetch, conn.as_mut()).await?,
        };
        debug!(
            backend = %group.backend,
            rows = part.result.rows.len(),
            "step fetched"
        );
        parts.push(part);
    }
    Ok(parts)
}

/// Distinct values bound to one `IN (?)` marker
fn in_list(parts: &[FetchedPart], filter: &InFilter) -> EngineResult<InList> {
    let part = parts
        .iter()
        .find(|p| p.bindings.contains(&filter.source))
        .ok_or_else(|| {
            EngineError::execution_error(format!(
                "Rows for '{}' were not fetched before they were needed",
                filter.source_column
            ))
        })?;
    let column = part.result.column_index(&filter.source_column).ok_or_else(|| {
        EngineError::execution_error(format!(
            "Key column '{}' is missing from the fetched rows",
            filter.source_column
        ))
    })?;
    Ok(part.result.distinct_values(column))
}

fn fetch_error(tables: &str, backend: &str, err: EngineError) -> EngineError {
    let cause = match err {
        EngineError::ExecutionError { message } => message,
        other => other.to_string(),
    };
    EngineError::execution_error(format!(
        "Failed to fetch '{tables}' from '{backend}': {cause}"
    ))
}

async fn run(
    conn: &mut dyn BackendConnection,
    binding: &TableBinding,
    sql: &str,
    in_lists: &[InList],
) -> EngineResult<QueryResult> {
    debug!(backend = %binding.backend, sql = %sql, "executing statement");
    conn.execute(sql, in_lists)
        .await
        .map_err(|e| fetch_error(&binding.mapped_as, &binding.backend, e))
}

/// Re-prefixes every returned column with the table alias
fn prefixed(alias: &str, raw: QueryResult) -> ResultSet {
    let columns = raw
        .columns
        .iter()
        .map(|c| format!("{alias}.{}", c.name))
        .collect();
    let rows = raw.rows.into_iter().map(|row| row.values).collect();
    ResultSet::new(columns, rows)
}

async fn fetch_table(
    plan: &FederationPlan,
    fetch: &TableFetch,
    parts: &[FetchedPart],
    conn: &mut dyn BackendConnection,
) -> EngineResult<FetchedPart> {
    let binding = &plan.bindings[fetch.binding];
    let in_lists = fetch
        .in_filters
        .iter()
        .map(|filter| in_list(parts, filter))
        .collect::<EngineResult<Vec<_>>>()?;

    let raw = run(conn, binding, &fetch.sql, &in_lists).await?;
    Ok(FetchedPart {
        bindings: vec![fetch.binding],
        result: prefixed(&binding.alias, raw),
    })
}

async fn fetch_join(
    plan: &FederationPlan,
    fetch: &JoinFetch,
    conn: &mut dyn BackendConnection,
) -> EngineResult<FetchedPart> {
    let bindings: Vec<usize> = fetch.bindings().collect();

    // discover the columns of `*` tables
    let mut columns: Vec<Option<Vec<String>>> = vec![None; plan.bindings.len()];
    for &idx in &bindings {
        let binding = &plan.bindings[idx];
        let names = match &binding.columns {
            ColumnSelection::Named(names) => names.clone(),
            ColumnSelection::All => {
                let probe = run(conn, binding, &probe_sql(binding), &[]).await?;
                probe.columns.into_iter().map(|c| c.name).collect()
            }
        };
        columns[idx] = Some(names);
    }

    let sql = join_sql(&plan.bindings, fetch, &columns);
    let root = &plan.bindings[fetch.root];
    debug!(backend = %root.backend, sql = %sql, "executing pushdown join");
    let raw = conn.execute(&sql, &[]).await.map_err(|e| {
        let tables: Vec<&str> = bindings
            .iter()
            .map(|&idx| plan.bindings[idx].mapped_as.as_str())
            .collect();
        fetch_error(&tables.join(" + "), &root.backend, e)
    })?;

    // split by synthetic prefix, then re-prefix as alias.column
    let mut names = Vec::new();
    let mut positions = Vec::new();
    for &idx in &bindings {
        let binding = &plan.bindings[idx];
        for column in columns[idx].iter().flatten() {
            let synthetic = synthetic_name(&binding.alias, column);
            let position = raw
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(&synthetic))
                .ok_or_else(|| {
                    EngineError::execution_error(format!(
                        "Pushdown join on '{}' returned no column '{synthetic}'",
                        root.backend
                    ))
                })?;
            names.push(format!("{}.{column}", binding.alias));
            positions.push(position);
        }
    }
    let rows = raw
        .rows
        .iter()
        .map(|row| positions.iter().map(|&p| row.values[p].clone()).collect())
        .collect();

    Ok(FetchedPart {
        bindings,
        result: ResultSet::new(names, rows),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::drivers::memory::MemoryDriver;
    use crate::engine::types::{ColumnInfo, Row, Value};
    use crate::federation::parser::parse;
    use crate::federation::planner::build_plan;
    use crate::federation::resolver::resolve;
    use crate::federation::rules::{JoinRule, JoinType};
    use crate::vault::MemoryCredentialProvider;

    struct Fixture {
        driver: MemoryDriver,
        registry: DriverRegistry,
        profiles: BTreeMap<String, ConnectionProfile>,
        credentials: MemoryCredentialProvider,
    }

    impl Fixture {
        fn new() -> Self {
            let driver = MemoryDriver::new();
            driver.add_table(
                "crm",
                "public.users",
                &["id", "name"],
                vec![
                    vec![Value::Int(1), Value::from("Alice")],
                    vec![Value::Int(2), Value::from("Bob")],
                    vec![Value::Int(3), Value::from("Carol")],
                ],
            );
            driver.add_table(
                "crm",
                "public.orders",
                &["id", "user_id", "product"],
                vec![
                    vec![Value::Int(10), Value::Int(1), Value::from("Book")],
                    vec![Value::Int(11), Value::Int(2), Value::from("Pen")],
                    vec![Value::Int(12), Value::Int(9), Value::from("Ink")],
                ],
            );
            let mut registry = DriverRegistry::new();
            registry.register(Arc::new(driver.clone()));
            let profiles = BTreeMap::from([
                ("crm".to_string(), ConnectionProfile::new("memory", "", 0, "crm")),
                ("shop".to_string(), ConnectionProfile::new("memory", "", 0, "shop")),
            ]);
            Self {
                driver,
                registry,
                profiles,
                credentials: MemoryCredentialProvider::new(),
            }
        }

        fn connector(&self) -> Connector<'_> {
            Connector {
                profiles: &self.profiles,
                registry: &self.registry,
                credentials: &self.credentials,
            }
        }
    }

    fn plan(sql: &str, mapping: &[(&str, &str)], rules: &[JoinRule]) -> FederationPlan {
        let mapping: BTreeMap<String, String> = mapping
            .iter()
            .map(|(t, b)| (t.to_string(), b.to_string()))
            .collect();
        let query = parse(sql).unwrap();
        let bindings = resolve(&query, &mapping).unwrap();
        build_plan(query, bindings, rules)
    }

    #[tokio::test]
    async fn client_side_group_binds_keys_of_earlier_fetch() {
        let fixture = Fixture::new();
        let rules = vec![JoinRule::new(["public.users", "public.orders"], "user_id")
            .with_key_column("public.users", "id")];
        let plan = plan(
            "SELECT u.name, o.product FROM public.users u, public.orders o WHERE u.id < 3",
            &[("public.users", "crm"), ("public.orders", "crm")],
            &rules,
        );

        let parts = execute_plan(&plan, &fixture.connector()).await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].result.columns, vec!["u.name", "u.id"]);
        assert_eq!(parts[1].result.columns, vec!["o.product", "o.user_id"]);
        assert_eq!(parts[1].result.rows.len(), 2);

        let statements = fixture.driver.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[1].in_lists,
            vec![vec![Value::Int(1), Value::Int(2)]]
        );
        assert_eq!(fixture.driver.connect_count(), 1);
        assert_eq!(fixture.driver.close_count(), 1);
    }

    #[tokio::test]
    async fn pushdown_join_probes_and_splits_columns() {
        let fixture = Fixture::new();
        fixture.driver.respond_to(
            "LEFT JOIN",
            QueryResult {
                columns: ["u_id", "u_name", "o_id", "o_user_id", "o_product"]
                    .into_iter()
                    .map(|name| ColumnInfo::new(name, "unknown"))
                    .collect(),
                rows: vec![Row::new(vec![
                    Value::Int(1),
                    Value::from("Alice"),
                    Value::Int(10),
                    Value::Int(1),
                    Value::from("Book"),
                ])],
                execution_time_ms: 0.0,
            },
        );
        let rules = vec![JoinRule::new(["public.users", "public.orders"], "user_id")
            .with_key_column("public.users", "id")
            .with_join_type(JoinType::Left)
            .with_pushdown(true)];
        let plan = plan(
            "SELECT * FROM public.users u, public.orders o",
            &[("public.users", "crm"), ("public.orders", "crm")],
            &rules,
        );

        let parts = execute_plan(&plan, &fixture.connector()).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].bindings, vec![0, 1]);
        assert_eq!(
            parts[0].result.columns,
            vec!["u.id", "u.name", "o.id", "o.user_id", "o.product"]
        );
        assert_eq!(parts[0].result.rows[0][4], Value::from("Book"));

        let statements = fixture.driver.statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].sql.ends_with("WHERE 1 = 0"));
        assert!(statements[2].sql.contains(
            "FROM public.users AS u LEFT JOIN public.orders AS o ON u.id = o.user_id"
        ));
    }

    #[tokio::test]
    async fn failed_statement_still_closes_every_connection() {
        let fixture = Fixture::new();
        fixture.driver.add_table(
            "shop",
            "public.items",
            &["sku"],
            vec![vec![Value::from("A-1")]],
        );
        fixture
            .driver
            .fail_on("public.orders", "permission denied for table orders");
        let plan = plan(
            "SELECT * FROM public.items i, public.orders o",
            &[("public.items", "shop"), ("public.orders", "crm")],
            &[],
        );

        let err = execute_plan(&plan, &fixture.connector()).await.unwrap_err();
        match &err {
            EngineError::ExecutionError { message } => {
                assert!(message.contains("permission denied for table orders"));
                assert!(message.contains("'public.orders' from 'crm'"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fixture.driver.connect_count(), fixture.driver.close_count());
    }

    #[tokio::test]
    async fn connect_failure_names_the_backend() {
        let fixture = Fixture::new();
        fixture.driver.fail_connect("crm", "password authentication failed");
        let plan = plan(
            "SELECT * FROM public.users u",
            &[("public.users", "crm")],
            &[],
        );

        let err = execute_plan(&plan, &fixture.connector()).await.unwrap_err();
        match err {
            EngineError::ConnectionFailed { backend, message } => {
                assert_eq!(backend, "crm");
                assert_eq!(message, "password authentication failed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fixture.driver.connect_count(), 0);
        assert_eq!(fixture.driver.close_count(), 0);
    }

    #[tokio::test]
    async fn unknown_driver_is_reported() {
        let mut fixture = Fixture::new();
        fixture.profiles.insert(
            "crm".to_string(),
            ConnectionProfile::new("oracle", "db", 1521, "crm"),
        );
        let plan = plan(
            "SELECT * FROM public.users u",
            &[("public.users", "crm")],
            &[],
        );
        let err = execute_plan(&plan, &fixture.connector()).await.unwrap_err();
        assert!(err.to_string().contains("oracle"));
    }

    #[tokio::test]
    async fn scope_closes_what_it_opened() {
        let fixture = Fixture::new();
        let scope = ConnectionScope::new();
        scope.open("crm", &fixture.connector()).await.unwrap();
        scope.open("shop", &fixture.connector()).await.unwrap();
        assert_eq!(scope.open_count(), 2);

        scope.close_all().await;
        assert_eq!(scope.open_count(), 0);
        assert_eq!(fixture.driver.close_count(), 2);

        // a second pass has nothing left to close
        scope.close_all().await;
        assert_eq!(fixture.driver.close_count(), 2);
    }
}
