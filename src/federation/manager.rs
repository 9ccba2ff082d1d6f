// SPDX-License-Identifier: Apache-2.0

//! Federation execution manager.
//!
//! Orchestrates the full federation pipeline:
//! parse → resolve → plan → fetch from backends → merge → filter → project.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::FederationConfig;
use crate::engine::error::{EngineError, EngineResult, QueryError};
use crate::engine::registry::DriverRegistry;
use crate::vault::CredentialProvider;

use super::executor::{execute_plan, Connector};
use super::filter;
use super::merger::merge;
use super::parser::{parse, split_statements};
use super::planner::build_plan;
use super::resolver::resolve;
use super::types::{FederatedResult, FederationPlan, ResultSet};

/// Entry point of the federation engine: one instance per configuration.
pub struct FederationEngine {
    config: FederationConfig,
    registry: Arc<DriverRegistry>,
    credentials: Arc<dyn CredentialProvider>,
}

impl FederationEngine {
    pub fn new(
        config: FederationConfig,
        registry: Arc<DriverRegistry>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            config,
            registry,
            credentials,
        }
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    fn connector(&self) -> Connector<'_> {
        Connector {
            profiles: &self.config.connections,
            registry: &self.registry,
            credentials: self.credentials.as_ref(),
        }
    }

    fn plan(&self, sql: &str) -> EngineResult<FederationPlan> {
        let query = parse(sql)?;
        let bindings = resolve(&query, &self.config.table_mapping)?;
        Ok(build_plan(query, bindings, &self.config.join_rules))
    }

    /// Plans `sql` without touching any backend.
    pub fn explain(&self, sql: &str) -> Result<FederationPlan, QueryError> {
        let start = Instant::now();
        self.plan(sql)
            .map_err(|e| QueryError::new(e, start.elapsed().as_secs_f64()))
    }

    /// Executes one federated SELECT statement.
    #[instrument(skip(self), fields(query_len = sql.len(), query_id = %Uuid::new_v4()))]
    pub async fn execute(&self, sql: &str) -> Result<FederatedResult, QueryError> {
        let start = Instant::now();
        let outcome = self.execute_inner(sql).await;
        let elapsed_secs = start.elapsed().as_secs_f64();

        match outcome {
            Ok(result) => {
                info!(rows = result.rows.len(), elapsed_secs, "query completed");
                Ok(FederatedResult {
                    columns: result.columns,
                    rows: result.rows,
                    elapsed_secs,
                })
            }
            Err(e) => {
                warn!(error = %e, elapsed_secs, "query failed");
                Err(QueryError::new(e, elapsed_secs))
            }
        }
    }

    async fn execute_inner(&self, sql: &str) -> EngineResult<ResultSet> {
        let plan = self.plan(sql)?;
        debug!(
            tables = plan.bindings.len(),
            groups = plan.groups.len(),
            "plan built"
        );

        let parts = execute_plan(&plan, &self.connector()).await?;
        let merged = merge(&plan, &self.config.join_rules, parts);
        let filtered = match &plan.query.where_clause {
            Some(predicate) => filter::apply(predicate, &plan.bindings, merged),
            None => merged,
        };
        Ok(filter::project(&plan.query.columns, &plan.bindings, filtered))
    }

    /// Executes every `;`-separated statement of `script` in order. The first
    /// failure aborts the script.
    #[instrument(skip(self, script), fields(script_len = script.len()))]
    pub async fn execute_script(&self, script: &str) -> Result<Vec<FederatedResult>, QueryError> {
        let mut results = Vec::new();
        for statement in split_statements(script) {
            results.push(self.execute(&statement).await?);
        }
        Ok(results)
    }

    /// Opens and closes one connection to `backend`.
    #[instrument(skip(self))]
    pub async fn test_connection(&self, backend: &str) -> EngineResult<()> {
        if !self.config.connections.contains_key(backend) {
            return Err(EngineError::configuration(format!(
                "Unknown connection '{backend}'"
            )));
        }
        self.connector().test(backend).await?;
        info!(backend = %backend, "connection test succeeded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionProfile;
    use crate::engine::drivers::memory::MemoryDriver;
    use crate::engine::types::Value;
    use crate::vault::MemoryCredentialProvider;

    fn engine(driver: &MemoryDriver) -> FederationEngine {
        let mut config = FederationConfig::default();
        config
            .add_connection("crm", ConnectionProfile::new("memory", "", 0, "crm"))
            .unwrap();
        config.map_table("public.users", "crm").unwrap();

        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(driver.clone()));
        FederationEngine::new(
            config,
            Arc::new(registry),
            Arc::new(MemoryCredentialProvider::new()),
        )
    }

    fn driver() -> MemoryDriver {
        let driver = MemoryDriver::new();
        driver.add_table(
            "crm",
            "public.users",
            &["id", "name"],
            vec![
                vec![Value::Int(1), Value::from("Alice")],
                vec![Value::Int(2), Value::from("Bob")],
            ],
        );
        driver
    }

    #[tokio::test]
    async fn single_table_select_star_prefixes_with_table_name() {
        let driver = driver();
        let result = engine(&driver)
            .execute("SELECT * FROM public.users")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["users.id", "users.name"]);
        assert_eq!(result.row_count(), 2);
    }

    #[tokio::test]
    async fn parse_errors_carry_elapsed_time() {
        let driver = driver();
        let err = engine(&driver).execute("DELETE FROM users").await.unwrap_err();
        assert!(matches!(err.kind(), EngineError::Parse { .. }));
        assert!(err.to_string().contains("(execution time: "));
        assert_eq!(driver.connect_count(), 0);
    }

    #[tokio::test]
    async fn script_runs_each_statement() {
        let driver = driver();
        let results = engine(&driver)
            .execute_script("SELECT u.name FROM users u WHERE u.id = 1; ; SELECT * FROM users;")
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rows, vec![vec![Value::from("Alice")]]);
        assert_eq!(results[1].row_count(), 2);
        assert_eq!(driver.connect_count(), 2);
        assert_eq!(driver.close_count(), 2);
    }

    #[tokio::test]
    async fn connection_test_opens_and_closes() {
        let driver = driver();
        let engine = engine(&driver);
        engine.test_connection("crm").await.unwrap();
        assert_eq!((driver.connect_count(), driver.close_count()), (1, 1));
        assert!(engine.test_connection("nowhere").await.is_err());
    }

    #[test]
    fn explain_does_not_connect() {
        let driver = driver();
        let plan = engine(&driver).explain("SELECT u.name FROM users u").unwrap();
        assert!(plan.to_string().contains("SELECT u.name FROM public.users AS u"));
        assert_eq!(driver.connect_count(), 0);
    }
}
