//! Database access for resources.
//!
//! Resources talk to a [`Connector`], which opens its [`Database`] through a
//! [`ConnectorFactory`] the first time a statement runs. The production
//! factory pools `tiberius` connections with `bb8`; tests swap in
//! [`crate::testing::MockConnectorFactory`].

pub mod azure;
pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::config::{Auth, ProviderSettings, ServerConfig};
use crate::error::ProviderError;
use crate::sql::{Row, Statement};

use self::pool::{convert_row, to_query, TiberiusManager};

/// Executes statements against one database.
#[async_trait::async_trait]
pub trait Database: Send + Sync {
    /// Run a statement and return the number of affected rows.
    async fn execute(&self, statement: &Statement) -> Result<u64, ProviderError>;

    /// Run a statement and return the rows of its first result set.
    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, ProviderError>;
}

/// Produces [`Database`] handles for a server and database.
#[async_trait::async_trait]
pub trait ConnectorFactory: Send + Sync + 'static {
    /// Return a handle for `database` on `server`.
    async fn connect(
        &self,
        server: &ServerConfig,
        database: &str,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn Database>, ProviderError>;

    /// Drop every open connection.
    async fn close_all(&self) {}
}

/// Per-resource handle: server, credentials and target database, with the
/// connection opened lazily.
pub struct Connector {
    server: ServerConfig,
    database: String,
    settings: ProviderSettings,
    factory: Arc<dyn ConnectorFactory>,
    db: OnceCell<Arc<dyn Database>>,
}

impl Connector {
    /// Handle for `database` on `server`; nothing connects until first use.
    pub fn new(
        factory: Arc<dyn ConnectorFactory>,
        server: ServerConfig,
        database: impl Into<String>,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            server,
            database: database.into(),
            settings,
            factory,
            db: OnceCell::new(),
        }
    }

    /// Target server.
    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// Target database.
    pub fn database(&self) -> &str {
        &self.database
    }

    async fn db(&self) -> Result<&Arc<dyn Database>, ProviderError> {
        self.db
            .get_or_try_init(|| {
                self.factory
                    .connect(&self.server, &self.database, &self.settings)
            })
            .await
    }

    /// Run a statement that returns no rows.
    pub async fn execute(&self, statement: &Statement) -> Result<u64, ProviderError> {
        debug!(database = %self.database, sql = %statement.sql, "execute");
        self.db().await?.execute(statement).await
    }

    /// Run a query.
    pub async fn query(&self, statement: &Statement) -> Result<Vec<Row>, ProviderError> {
        debug!(database = %self.database, sql = %statement.sql, "query");
        self.db().await?.query(statement).await
    }

    /// Run a query expected to return at most one row.
    pub async fn query_one(&self, statement: &Statement) -> Result<Option<Row>, ProviderError> {
        Ok(self.query(statement).await?.into_iter().next())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    host: String,
    port: u16,
    database: String,
    auth: Auth,
}

/// A [`Database`] backed by a `bb8` pool.
struct PooledDatabase {
    pool: bb8::Pool<TiberiusManager>,
}

#[async_trait::async_trait]
impl Database for PooledDatabase {
    async fn execute(&self, statement: &Statement) -> Result<u64, ProviderError> {
        let mut conn = self.pool.get().await?;
        let result = to_query(statement).execute(&mut *conn).await?;
        Ok(result.total())
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>, ProviderError> {
        let mut conn = self.pool.get().await?;
        let rows = to_query(statement)
            .query(&mut *conn)
            .await?
            .into_first_result()
            .await?;
        Ok(rows.iter().map(convert_row).collect())
    }
}

/// Production factory: one `bb8` pool per (host, port, database, credentials).
#[derive(Default)]
pub struct TiberiusConnectorFactory {
    pools: Mutex<HashMap<PoolKey, Arc<dyn Database>>>,
    http: reqwest::Client,
}

impl TiberiusConnectorFactory {
    /// Factory with no pools open.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConnectorFactory for TiberiusConnectorFactory {
    async fn connect(
        &self,
        server: &ServerConfig,
        database: &str,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn Database>, ProviderError> {
        let key = PoolKey {
            host: server.host.clone(),
            port: server.port,
            database: database.to_string(),
            auth: server.auth.clone(),
        };

        let mut pools = self.pools.lock().await;
        if let Some(db) = pools.get(&key) {
            return Ok(Arc::clone(db));
        }

        debug!(
            server = %server.endpoint(),
            database,
            principal = server.auth.principal(),
            max_connections = settings.max_connections,
            "creating connection pool"
        );
        let manager = TiberiusManager::new(
            server.clone(),
            database,
            settings.clone(),
            self.http.clone(),
        );
        // Connections open on first checkout.
        let pool = bb8::Pool::builder()
            .max_size(settings.max_connections)
            .min_idle(None)
            .connection_timeout(settings.connect_timeout())
            .test_on_check_out(true)
            .build_unchecked(manager);

        let db: Arc<dyn Database> = Arc::new(PooledDatabase { pool });
        pools.insert(key, Arc::clone(&db));
        Ok(db)
    }

    async fn close_all(&self) {
        let mut pools = self.pools.lock().await;
        debug!(pools = pools.len(), "closing connection pools");
        pools.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnectorFactory;

    fn server(username: &str) -> ServerConfig {
        ServerConfig {
            host: "db".to_string(),
            port: 1433,
            auth: Auth::SqlLogin {
                username: username.to_string(),
                password: "pw".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_connector_opens_lazily_once() {
        let factory = Arc::new(MockConnectorFactory::new());
        let connector = Connector::new(
            factory.clone(),
            server("sa"),
            "appdb",
            ProviderSettings::default(),
        );
        assert_eq!(factory.connections(), 0);

        connector.execute(&Statement::new("SELECT 1")).await.unwrap();
        connector.query(&Statement::new("SELECT 2")).await.unwrap();
        assert_eq!(factory.connections(), 1);
        assert_eq!(factory.database().statements().len(), 2);
        assert_eq!(connector.database(), "appdb");
    }

    #[tokio::test]
    async fn test_tiberius_factory_reuses_pools_by_key() {
        let factory = TiberiusConnectorFactory::new();
        let settings = ProviderSettings::default();

        let a = factory.connect(&server("sa"), "appdb", &settings).await.unwrap();
        let b = factory.connect(&server("sa"), "appdb", &settings).await.unwrap();
        let c = factory.connect(&server("other"), "appdb", &settings).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.pools.lock().await.len(), 2);

        // A rotated password gets a pool of its own.
        let mut rotated = server("sa");
        rotated.auth = Auth::SqlLogin {
            username: "sa".to_string(),
            password: "rotated".to_string(),
        };
        let d = factory.connect(&rotated, "appdb", &settings).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &d));
        assert_eq!(factory.pools.lock().await.len(), 3);

        factory.close_all().await;
        assert!(factory.pools.lock().await.is_empty());
    }
}
