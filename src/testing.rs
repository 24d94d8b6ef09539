//! Test harness for the provider.
//!
//! [`ProviderTester`] drives a [`ProviderService`] without a gRPC server.
//! [`MockConnectorFactory`] and [`MockDatabase`] stand in for SQL Server:
//! they record every statement and answer queries with scripted rows.
//!
//! # Example
//!
//! ```ignore
//! use terraform_provider_mssql::testing::{MockConnectorFactory, ProviderTester};
//! use terraform_provider_mssql::MssqlProvider;
//!
//! let tester = ProviderTester::new(MssqlProvider::with_factory(MockConnectorFactory::new()));
//! let state = tester.lifecycle_create("mssql_role", config).await?;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::config::{ProviderSettings, ServerConfig};
use crate::connector::{ConnectorFactory, Database};
use crate::error::ProviderError;
use crate::schema::{Diagnostic, DiagnosticSeverity, ProviderSchema};
use crate::server::ProviderService;
use crate::sql::{Row, Statement};
use crate::types::{ImportedResource, PlanResult};

/// Drives a [`ProviderService`] the way the host would, without gRPC.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Create a new tester for the given provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// The provider under test.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    // =========================================================================
    // Schema & Metadata
    // =========================================================================

    /// Provider and resource schemas.
    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    /// Resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.provider.metadata().resources
    }

    // =========================================================================
    // Provider Lifecycle
    // =========================================================================

    /// Validate a provider block; error diagnostics become `Err`.
    pub async fn validate_provider_config(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.validate_provider_config(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Configure the provider; error diagnostics become `Err`.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.configure(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Stop the provider, dropping its connection pools.
    pub async fn stop(&self) -> Result<(), ProviderError> {
        self.provider.stop().await
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Validate a resource configuration.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        let diagnostics = self
            .provider
            .validate_resource_config(resource_type, config)
            .await?;
        check_diagnostics(diagnostics)
    }

    /// Plan a create, using the configuration as the proposed state.
    pub async fn plan_create(
        &self,
        resource_type: &str,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, None, proposed_state.clone(), proposed_state)
            .await
    }

    /// Plan a change against `prior_state`.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(
                resource_type,
                Some(prior_state),
                proposed_state.clone(),
                proposed_state,
            )
            .await
    }

    /// Plan a destroy.
    pub async fn plan_delete(
        &self,
        resource_type: &str,
        prior_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior_state), Value::Null, Value::Null)
            .await
    }

    /// Plan with separate proposed state and configuration.
    pub async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, prior_state, proposed_state, config)
            .await
    }

    /// Create from a planned state.
    pub async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.create(resource_type, planned_state).await
    }

    /// Refresh a state; `null` when the object is gone.
    pub async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.read(resource_type, current_state).await
    }

    /// Apply a planned in-place update.
    pub async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .update(resource_type, prior_state, planned_state)
            .await
    }

    /// Drop the object behind a state.
    pub async fn delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.provider.delete(resource_type, current_state).await
    }

    /// Import an existing resource.
    pub async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    // =========================================================================
    // Lifecycle Helpers
    // =========================================================================

    /// Plan and create, as the host does for a new resource.
    ///
    /// The provider reads the object back after creating it, so the
    /// returned state carries the computed attributes.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self.plan_create(resource_type, config).await?;
        self.create(resource_type, plan.planned_state).await
    }

    /// Plan and apply a change to an existing resource.
    ///
    /// A plan that requires replacement deletes the old object and creates a
    /// new one. A plan without changes only refreshes.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self
            .plan_update(resource_type, prior_state.clone(), proposed_state)
            .await?;

        if plan.changes.is_empty() {
            return self.read(resource_type, prior_state).await;
        }
        if plan.requires_replace {
            self.delete(resource_type, prior_state).await?;
            return self.create(resource_type, plan.planned_state).await;
        }
        self.update(resource_type, prior_state, plan.planned_state)
            .await
    }

    /// Plan a destroy and delete.
    pub async fn lifecycle_delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        let plan = self
            .plan_delete(resource_type, current_state.clone())
            .await?;
        debug_assert!(plan.planned_state.is_null());
        self.delete(resource_type, current_state).await
    }

    /// Import by id and return the single imported state.
    pub async fn lifecycle_import(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Value, ProviderError> {
        let mut imported = self.import_resource(resource_type, id).await?;
        match imported.pop() {
            Some(resource) if imported.is_empty() => Ok(resource.state),
            _ => Err(ProviderError::Validation(format!(
                "expected exactly one imported object for '{}'",
                id
            ))),
        }
    }

    /// Create, update, then delete. Returns the state after the update.
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial_config: Value,
        updated_config: Value,
    ) -> Result<Value, ProviderError> {
        let created = self.lifecycle_create(resource_type, initial_config).await?;
        let updated = self
            .lifecycle_update(resource_type, created, updated_config)
            .await?;
        self.lifecycle_delete(resource_type, updated.clone())
            .await?;
        Ok(updated)
    }
}

/// Failure of a tester call that reports diagnostics.
#[derive(Debug)]
pub enum TestError {
    /// Error diagnostics returned by the provider.
    Diagnostics(Vec<Diagnostic>),
    /// The call itself failed.
    Provider(ProviderError),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let diagnostics = match self {
            TestError::Provider(e) => return write!(f, "provider call failed: {}", e),
            TestError::Diagnostics(diagnostics) => diagnostics,
        };
        writeln!(f, "{} error diagnostic(s):", diagnostics.len())?;
        for d in diagnostics {
            write!(f, "  {}", d.summary)?;
            if let Some(detail) = &d.detail {
                write!(f, ": {}", detail)?;
            }
            if let Some(attr) = &d.attribute {
                write!(f, " (at {})", attr)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl std::error::Error for TestError {}

impl From<ProviderError> for TestError {
    fn from(e: ProviderError) -> Self {
        TestError::Provider(e)
    }
}

fn errors(diagnostics: &[Diagnostic]) -> Vec<&Diagnostic> {
    diagnostics
        .iter()
        .filter(|d| d.severity == DiagnosticSeverity::Error)
        .collect()
}

fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    if errors(&diagnostics).is_empty() {
        return Ok(());
    }
    Err(TestError::Diagnostics(
        diagnostics
            .into_iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
            .collect(),
    ))
}

fn changed_paths(plan: &PlanResult) -> Vec<&str> {
    plan.changes.iter().map(|c| c.path.as_str()).collect()
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert a plan creates a new object: changes, no replacement.
pub fn assert_plan_creates(plan: &PlanResult) {
    assert!(!plan.changes.is_empty(), "create plan has no changes");
    assert!(!plan.requires_replace, "create plan is marked as a replacement");
}

/// Assert a plan has nothing to do.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "plan was expected to be empty, changes: {:?}",
        changed_paths(plan)
    );
}

/// Assert a plan destroys and recreates the object.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "plan updates in place, changes: {:?}",
        changed_paths(plan)
    );
}

/// Assert a plan changes the object in place.
pub fn assert_plan_updates_in_place(plan: &PlanResult) {
    assert!(
        !plan.requires_replace,
        "plan requires replacement, changes: {:?}",
        changed_paths(plan)
    );
}

/// Assert `path` is among the planned changes.
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    let paths = changed_paths(plan);
    assert!(paths.contains(&path), "'{}' not in changes {:?}", path, paths);
}

/// Assert `path` is not among the planned changes.
pub fn assert_plan_does_not_change_attribute(plan: &PlanResult, path: &str) {
    let paths = changed_paths(plan);
    assert!(!paths.contains(&path), "'{}' unexpectedly in changes", path);
}

/// Assert no diagnostic is an error. Warnings are allowed.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors = errors(diagnostics);
    assert!(
        errors.is_empty(),
        "unexpected error diagnostics: {:?}",
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert some error diagnostic's summary or detail contains `text`.
pub fn assert_error_contains(diagnostics: &[Diagnostic], text: &str) {
    let errors = errors(diagnostics);
    let found = errors.iter().any(|d| {
        d.summary.contains(text) || d.detail.as_deref().is_some_and(|x| x.contains(text))
    });
    assert!(
        found,
        "no error diagnostic mentions '{}': {:?}",
        text,
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert that some recorded statement contains `fragment`.
///
/// # Panics
///
/// Panics with the recorded SQL if no statement matches.
pub fn assert_executed(db: &MockDatabase, fragment: &str) {
    assert!(
        db.find(fragment).is_some(),
        "Expected a statement containing '{}', but got:\n{}",
        fragment,
        db.executed_sql().join("\n---\n")
    );
}

// =========================================================================
// SQL Server Stand-in
// =========================================================================

#[derive(Default)]
struct MockState {
    statements: Vec<Statement>,
    responses: Vec<(String, VecDeque<Vec<Row>>)>,
    failures: Vec<(String, u32, String)>,
}

/// In-memory [`Database`] that records statements and serves scripted rows.
///
/// Queries are answered by the first [`respond`](Self::respond) pattern
/// contained in the SQL text. Several responses for one pattern are served
/// in order; the last one repeats. Unmatched queries return no rows.
#[derive(Default)]
pub struct MockDatabase {
    state: Mutex<MockState>,
}

impl MockDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer queries containing `pattern` with `rows`.
    pub fn respond(&self, pattern: impl Into<String>, rows: Vec<Row>) -> &Self {
        let pattern = pattern.into();
        let mut state = self.lock();
        match state.responses.iter_mut().find(|(p, _)| *p == pattern) {
            Some((_, queue)) => queue.push_back(rows),
            None => state.responses.push((pattern, VecDeque::from([rows]))),
        }
        self
    }

    /// Fail the next statement containing `pattern` with a server error.
    pub fn fail(&self, pattern: impl Into<String>, number: u32, message: impl Into<String>) -> &Self {
        self.lock()
            .failures
            .push((pattern.into(), number, message.into()));
        self
    }

    /// Every statement received, in order.
    pub fn statements(&self) -> Vec<Statement> {
        self.lock().statements.clone()
    }

    /// SQL text of every statement received.
    pub fn executed_sql(&self) -> Vec<String> {
        self.lock().statements.iter().map(|s| s.sql.clone()).collect()
    }

    /// The last statement whose SQL contains `fragment`.
    pub fn find(&self, fragment: &str) -> Option<Statement> {
        self.lock()
            .statements
            .iter()
            .rev()
            .find(|s| s.sql.contains(fragment))
            .cloned()
    }

    /// Number of statements whose SQL contains `fragment`.
    pub fn count(&self, fragment: &str) -> usize {
        self.lock()
            .statements
            .iter()
            .filter(|s| s.sql.contains(fragment))
            .count()
    }

    fn record(&self, statement: &Statement) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.statements.push(statement.clone());
        if let Some(i) = state
            .failures
            .iter()
            .position(|(p, _, _)| statement.sql.contains(p.as_str()))
        {
            let (_, number, message) = state.failures.remove(i);
            return Err(ProviderError::from_server_error(number, message));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Database for MockDatabase {
    async fn execute(&self, statement: &Statement) -> Result<u64, ProviderError> {
        self.record(statement)?;
        Ok(1)
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, ProviderError> {
        self.record(statement)?;
        let mut state = self.lock();
        let queue = state
            .responses
            .iter_mut()
            .find(|(p, _)| statement.sql.contains(p.as_str()))
            .map(|(_, queue)| queue);
        Ok(match queue {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => Vec::new(),
        })
    }
}

/// [`ConnectorFactory`] handing out one shared [`MockDatabase`].
#[derive(Default)]
pub struct MockConnectorFactory {
    database: Arc<MockDatabase>,
    opened: Mutex<Vec<(String, String)>>,
    closed: AtomicUsize,
}

impl MockConnectorFactory {
    /// Create a factory with an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared database.
    pub fn database(&self) -> &MockDatabase {
        &self.database
    }

    /// `(host:port, database)` of every connection opened.
    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of connections opened.
    pub fn connections(&self) -> usize {
        self.opened.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of `close_all` calls.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConnectorFactory for MockConnectorFactory {
    async fn connect(
        &self,
        server: &ServerConfig,
        database: &str,
        _settings: &ProviderSettings,
    ) -> Result<Arc<dyn Database>, ProviderError> {
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((server.endpoint(), database.to_string()));
        let db: Arc<dyn Database> = self.database.clone();
        Ok(db)
    }

    async fn close_all(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
