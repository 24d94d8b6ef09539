//! The SQL Server provider: routes protocol calls to [`Resource`]s.
//!
//! Create and update are followed by a read so that computed attributes
//! reflect what the server actually stored.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{process_env, Auth, EnvLookup, ProviderSettings, ServerConfig};
use crate::connector::{Connector, ConnectorFactory, TiberiusConnectorFactory};
use crate::error::ProviderError;
use crate::logging;
use crate::plan::{plan, redact};
use crate::resource_id::ResourceId;
use crate::resources::{registry, Resource};
use crate::schema::{has_errors, Diagnostic, ProviderSchema};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult};
use crate::validation::validate;

/// Provider for SQL Server and Azure SQL principals and permissions.
pub struct MssqlProvider<F: ConnectorFactory = TiberiusConnectorFactory> {
    factory: Arc<F>,
    settings: RwLock<ProviderSettings>,
    env: Arc<EnvLookup>,
    resources: BTreeMap<&'static str, Arc<dyn Resource>>,
}

impl MssqlProvider {
    /// Create a provider that connects with `tiberius`.
    pub fn new() -> Self {
        Self::with_factory(TiberiusConnectorFactory::new())
    }
}

impl Default for MssqlProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ConnectorFactory> MssqlProvider<F> {
    /// Create a provider over a custom connector factory.
    pub fn with_factory(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            settings: RwLock::new(ProviderSettings::default()),
            env: Arc::new(process_env),
            resources: registry(),
        }
    }

    /// Replace the environment lookup used for credential fallbacks.
    pub fn with_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(lookup);
        self
    }

    /// The connector factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Current provider settings.
    pub async fn settings(&self) -> ProviderSettings {
        self.settings.read().await.clone()
    }

    fn resource(&self, resource_type: &str) -> Result<&Arc<dyn Resource>, ProviderError> {
        self.resources
            .get(resource_type)
            .ok_or_else(|| ProviderError::UnknownResource(resource_type.to_string()))
    }

    async fn connector_for(
        &self,
        server: ServerConfig,
        database: String,
    ) -> Connector {
        let factory: Arc<dyn ConnectorFactory> = self.factory.clone();
        Connector::new(factory, server, database, self.settings().await)
    }

    async fn connector(
        &self,
        resource: &Arc<dyn Resource>,
        state: &Value,
    ) -> Result<Connector, ProviderError> {
        let server = ServerConfig::from_state(state, &*self.env)?;
        Ok(self.connector_for(server, resource.database(state)).await)
    }

    fn check_config(
        &self,
        resource: &Arc<dyn Resource>,
        config: &Value,
    ) -> Vec<Diagnostic> {
        let mut diagnostics = validate(&resource.schema(), config);
        diagnostics.extend(resource.validate(config));
        diagnostics
    }
}

fn id_of(state: &Value) -> &str {
    state.get("id").and_then(Value::as_str).unwrap_or("")
}

fn vanished(resource_type: &str, state: &Value) -> ProviderError {
    ProviderError::NotFound(format!(
        "{} '{}' was not found after it was written",
        resource_type,
        id_of(state)
    ))
}

#[async_trait::async_trait]
impl<F: ConnectorFactory> ProviderService for MssqlProvider<F> {
    fn schema(&self) -> ProviderSchema {
        self.resources.iter().fold(
            ProviderSchema::new().with_provider_config(ProviderSettings::schema()),
            |schema, (name, resource)| schema.with_resource(*name, resource.schema()),
        )
    }

    async fn validate_provider_config(
        &self,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let mut diagnostics = validate(&ProviderSettings::schema(), &config);
        if !has_errors(&diagnostics) {
            if let Err(err) = ProviderSettings::from_config(&config) {
                diagnostics.push(Diagnostic::error(err.message().to_string()));
            }
        }
        Ok(diagnostics)
    }

    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let settings = ProviderSettings::from_config(&config)?;
        if settings.debug && !logging::enable_debug_logging() {
            warn!("debug logging requested but the log filter cannot be changed");
        }
        info!(
            connect_timeout = settings.connect_timeout,
            max_connections = settings.max_connections,
            trust_server_certificate = settings.trust_server_certificate,
            "provider configured"
        );
        *self.settings.write().await = settings;
        Ok(vec![])
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        self.factory.close_all().await;
        Ok(())
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let resource = self.resource(resource_type)?;
        Ok(self.check_config(resource, &config))
    }

    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let resource = self.resource(resource_type)?;
        let schema = resource.schema();

        if !proposed_state.is_null() {
            let target = if config.is_null() {
                &proposed_state
            } else {
                &config
            };
            let diagnostics = self.check_config(resource, target);
            if has_errors(&diagnostics) {
                let summary = diagnostics
                    .iter()
                    .filter(|d| d.is_error())
                    .map(|d| match &d.attribute {
                        Some(attr) => format!("{} ({})", d.summary, attr),
                        None => d.summary.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ProviderError::Validation(summary));
            }
        }

        let result = plan(&schema, prior_state.as_ref(), &proposed_state);
        debug!(
            resource_type,
            changes = result.changes.len(),
            requires_replace = result.requires_replace,
            planned = %redact(&schema.block, &result.planned_state),
            "planned"
        );
        Ok(result)
    }

    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let conn = self.connector(resource, &planned_state).await?;

        let state = resource.create(&conn, planned_state).await?;
        info!(resource_type, id = id_of(&state), "created");

        match resource.read(&conn, state.clone()).await? {
            Some(state) => Ok(state),
            None => Err(vanished(resource_type, &state)),
        }
    }

    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        if current_state.is_null() {
            return Ok(Value::Null);
        }
        let conn = self.connector(resource, &current_state).await?;
        let id = id_of(&current_state).to_string();

        match resource.read(&conn, current_state).await? {
            Some(state) => Ok(state),
            None => {
                info!(resource_type, id = %id, "object no longer exists");
                Ok(Value::Null)
            }
        }
    }

    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let conn = self.connector(resource, &planned_state).await?;

        let state = resource.update(&conn, &prior_state, planned_state).await?;
        info!(resource_type, id = id_of(&state), "updated");

        match resource.read(&conn, state.clone()).await? {
            Some(state) => Ok(state),
            None => Err(vanished(resource_type, &state)),
        }
    }

    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        let resource = self.resource(resource_type)?;
        let conn = self.connector(resource, &current_state).await?;

        resource.delete(&conn, &current_state).await?;
        info!(resource_type, id = id_of(&current_state), "deleted");
        Ok(())
    }

    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let resource = self.resource(resource_type)?;
        let parsed = ResourceId::parse_as(id, resource.id_shape())?;

        // Credentials stay out of state; reads fall back to the environment.
        let server = ServerConfig {
            host: parsed.host.clone(),
            port: parsed.port,
            auth: Auth::from_env(&*self.env)?,
        };
        let mut state = resource.import_state(&parsed);
        if let Some(obj) = state.as_object_mut() {
            obj.insert("id".to_string(), json!(id));
            obj.insert("server".to_string(), server.to_block());
        }

        let conn = self
            .connector_for(server, resource.database(&state))
            .await;
        match resource.read(&conn, state).await? {
            Some(state) => {
                info!(resource_type, id, "imported");
                Ok(vec![ImportedResource::new(resource_type, state)])
            }
            None => Err(ProviderError::NotFound(format!(
                "{} '{}' does not exist",
                resource_type, id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Row;
    use crate::testing::MockConnectorFactory;

    fn provider() -> MssqlProvider<MockConnectorFactory> {
        MssqlProvider::with_factory(MockConnectorFactory::new()).with_env(|key| match key {
            "MSSQL_USERNAME" => Some("sa".to_string()),
            "MSSQL_PASSWORD" => Some("pw".to_string()),
            _ => None,
        })
    }

    fn role_state() -> Value {
        json!({
            "server": {"host": "db", "port": 1433, "login": null, "azure_login": null},
            "database": "appdb",
            "role_name": "readers",
            "owner_name": null,
            "principal_id": null,
            "id": null
        })
    }

    #[tokio::test]
    async fn test_schema_lists_every_resource() {
        let schema = provider().schema();
        assert_eq!(schema.resources.len(), 7);
        assert!(schema.provider.block.attributes.contains_key("max_connections"));
    }

    #[tokio::test]
    async fn test_configure_applies_settings() {
        let provider = provider();
        provider
            .configure(json!({"max_connections": 8, "connect_timeout": null}))
            .await
            .unwrap();
        let settings = provider.settings().await;
        assert_eq!(settings.max_connections, 8);
        assert_eq!(settings.connect_timeout, 30);
    }

    #[tokio::test]
    async fn test_validate_provider_config() {
        let diagnostics = provider()
            .validate_provider_config(json!({"max_connections": 0}))
            .await
            .unwrap();
        assert!(has_errors(&diagnostics));
    }

    #[tokio::test]
    async fn test_unknown_resource_type() {
        let err = provider()
            .read("mssql_table", role_state())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownResource(_)));
    }

    #[tokio::test]
    async fn test_plan_rejects_invalid_config() {
        let mut config = role_state();
        config["role_name"] = json!("");
        let err = provider()
            .plan("mssql_role", None, config.clone(), config)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_reads_back() {
        let provider = provider();
        provider.factory().database().respond(
            "FROM sys.database_principals r",
            vec![Row::new()
                .with("principal_id", 5i64)
                .with("name", "readers")
                .with("owner_name", "dbo")],
        );

        let state = provider.create("mssql_role", role_state()).await.unwrap();
        assert_eq!(state["id"], "sqlserver://db:1433/appdb/readers");
        assert_eq!(state["principal_id"], 5);
        assert_eq!(state["owner_name"], "dbo");
        assert_eq!(provider.factory().opened(), vec![("db:1433".to_string(), "appdb".to_string())]);
    }

    #[tokio::test]
    async fn test_read_missing_object_is_null() {
        let state = provider().read("mssql_role", role_state()).await.unwrap();
        assert!(state.is_null());
    }

    #[tokio::test]
    async fn test_import_uses_environment_credentials() {
        let provider = provider();
        provider.factory().database().respond(
            "FROM sys.database_principals r",
            vec![Row::new().with("principal_id", 5i64).with("owner_name", "dbo")],
        );

        let imported = provider
            .import_resource("mssql_role", "sqlserver://db:1433/appdb/readers")
            .await
            .unwrap();
        assert_eq!(imported.len(), 1);
        let state = &imported[0].state;
        assert_eq!(state["role_name"], "readers");
        assert_eq!(state["database"], "appdb");
        assert_eq!(state["server"]["host"], "db");
        assert!(state["server"]["login"].is_null());
    }

    #[tokio::test]
    async fn test_import_missing_object_is_not_found() {
        let err = provider()
            .import_resource("mssql_role", "sqlserver://db:1433/appdb/readers")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_import_rejects_wrong_shape() {
        let err = provider()
            .import_resource("mssql_database_permissions", "sqlserver://db:1433/appdb/app")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidId(_)));
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let provider = provider();
        provider.stop().await.unwrap();
        assert_eq!(provider.factory().closed(), 1);
    }
}
