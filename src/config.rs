//! Provider settings and per-resource server connection settings.
//!
//! The provider block only carries tuning knobs. Where to connect and how to
//! authenticate lives in each resource's `server` block, so that one
//! configuration can manage objects on several servers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ProviderError;
use crate::schema::{Attribute, Block, NestedBlock, Schema};

/// Default SQL Server port.
pub const DEFAULT_PORT: u16 = 1433;

/// Environment variables consulted when a `server` block has no credentials.
pub mod env {
    /// SQL login user name.
    pub const USERNAME: &str = "MSSQL_USERNAME";
    /// SQL login password.
    pub const PASSWORD: &str = "MSSQL_PASSWORD";
    /// Azure AD tenant of the service principal.
    pub const TENANT_ID: &str = "MSSQL_TENANT_ID";
    /// Azure AD application (client) id.
    pub const CLIENT_ID: &str = "MSSQL_CLIENT_ID";
    /// Azure AD client secret.
    pub const CLIENT_SECRET: &str = "MSSQL_CLIENT_SECRET";
}

/// Lookup function for environment variables.
pub type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Read a non-empty variable from the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Drop `null` members so serde defaults apply to attributes the host sent
/// as unset.
fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// Settings from the provider configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Seconds to wait for a TCP connection and for a pooled connection.
    pub connect_timeout: u64,
    /// Maximum connections per pool.
    pub max_connections: u32,
    /// Accept any server certificate.
    pub trust_server_certificate: bool,
    /// Raise the log level to debug.
    pub debug: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            max_connections: 4,
            trust_server_certificate: false,
            debug: false,
        }
    }
}

impl ProviderSettings {
    /// Deserialize from the provider block. `null` yields the defaults.
    pub fn from_config(config: &Value) -> Result<Self, ProviderError> {
        if config.is_null() {
            return Ok(Self::default());
        }
        let settings: Self = serde_json::from_value(without_nulls(config))?;
        if settings.max_connections == 0 {
            return Err(ProviderError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(settings)
    }

    /// The connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Schema of the provider block.
    pub fn schema() -> Schema {
        Schema::v0()
            .with_description("Settings shared by every SQL Server connection")
            .with_attribute(
                "connect_timeout",
                Attribute::optional_int64()
                    .with_default(json!(30))
                    .with_description("Seconds to wait when opening a connection"),
            )
            .with_attribute(
                "max_connections",
                Attribute::optional_int64()
                    .with_default(json!(4))
                    .with_description("Maximum pooled connections per server and database"),
            )
            .with_attribute(
                "trust_server_certificate",
                Attribute::optional_bool().with_default(json!(false)),
            )
            .with_attribute(
                "debug",
                Attribute::optional_bool()
                    .with_default(json!(false))
                    .with_description("Log at debug level, including generated SQL"),
            )
    }
}

/// How to authenticate against the server.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Auth {
    /// SQL Server authentication.
    SqlLogin { username: String, password: String },
    /// Azure AD service principal (client credentials).
    AzureLogin {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl Auth {
    /// Name of the authenticating principal.
    pub fn principal(&self) -> &str {
        match self {
            Auth::SqlLogin { username, .. } => username,
            Auth::AzureLogin { client_id, .. } => client_id,
        }
    }

    fn from_block(server: &Value) -> Result<Option<Self>, ProviderError> {
        if let Some(login) = server.get("login").filter(|v| !v.is_null()) {
            return Ok(Some(Auth::SqlLogin {
                username: required_str(login, "server.login.username")?.to_string(),
                password: required_str(login, "server.login.password")?.to_string(),
            }));
        }
        if let Some(azure) = server.get("azure_login").filter(|v| !v.is_null()) {
            return Ok(Some(Auth::AzureLogin {
                tenant_id: required_str(azure, "server.azure_login.tenant_id")?.to_string(),
                client_id: required_str(azure, "server.azure_login.client_id")?.to_string(),
                client_secret: required_str(azure, "server.azure_login.client_secret")?
                    .to_string(),
            }));
        }
        Ok(None)
    }

    /// Credentials from the environment: SQL login first, then Azure AD.
    pub fn from_env(lookup: &EnvLookup) -> Result<Self, ProviderError> {
        if let (Some(username), Some(password)) = (lookup(env::USERNAME), lookup(env::PASSWORD)) {
            return Ok(Auth::SqlLogin { username, password });
        }
        match (
            lookup(env::TENANT_ID),
            lookup(env::CLIENT_ID),
            lookup(env::CLIENT_SECRET),
        ) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Ok(Auth::AzureLogin {
                tenant_id,
                client_id,
                client_secret,
            }),
            _ => Err(ProviderError::Configuration(format!(
                "no credentials: set server.login or server.azure_login, or {}/{} or {}/{}/{}",
                env::USERNAME,
                env::PASSWORD,
                env::TENANT_ID,
                env::CLIENT_ID,
                env::CLIENT_SECRET
            ))),
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::SqlLogin { username, .. } => f
                .debug_struct("SqlLogin")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Auth::AzureLogin {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("AzureLogin")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
        }
    }
}

/// Where and how to connect, from a resource's `server` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub auth: Auth,
}

impl ServerConfig {
    /// Read the `server` block of a resource state.
    pub fn from_state(state: &Value, lookup: &EnvLookup) -> Result<Self, ProviderError> {
        let server = state
            .get("server")
            .filter(|v| v.is_object())
            .ok_or_else(|| ProviderError::Configuration("missing server block".to_string()))?;
        Self::from_block(server, lookup)
    }

    /// Parse a `server` block, falling back to environment credentials.
    pub fn from_block(server: &Value, lookup: &EnvLookup) -> Result<Self, ProviderError> {
        let host = required_str(server, "server.host")?.to_string();
        let port = match server.get("port").and_then(Value::as_i64) {
            None => DEFAULT_PORT,
            Some(p) => u16::try_from(p).map_err(|_| {
                ProviderError::Configuration(format!("server.port {} is out of range", p))
            })?,
        };
        let auth = match Auth::from_block(server)? {
            Some(auth) => auth,
            None => Auth::from_env(lookup)?,
        };
        Ok(Self { host, port, auth })
    }

    /// Render as a `server` block without credentials, so that reads of the
    /// stored state fall back to the environment.
    pub fn to_block(&self) -> Value {
        json!({
            "host": self.host,
            "port": self.port,
            "login": null,
            "azure_login": null,
        })
    }

    /// `host:port`, as used in resource ids and pool keys.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Schema of the `server` block shared by every resource.
    pub fn schema() -> NestedBlock {
        let login = Block::new()
            .with_description("SQL Server authentication")
            .with_attribute("username", Attribute::required_string())
            .with_attribute("password", Attribute::required_string().sensitive());
        let azure_login = Block::new()
            .with_description("Azure AD service principal authentication")
            .with_attribute("tenant_id", Attribute::required_string())
            .with_attribute("client_id", Attribute::required_string())
            .with_attribute("client_secret", Attribute::required_string().sensitive());

        NestedBlock::single(
            Block::new()
                .with_description("Server to connect to. Without login or azure_login, credentials come from MSSQL_* environment variables")
                .with_attribute("host", Attribute::required_string().with_force_new())
                .with_attribute(
                    "port",
                    Attribute::optional_int64()
                        .with_default(json!(DEFAULT_PORT))
                        .with_force_new(),
                )
                .with_block("login", NestedBlock::single(login))
                .with_block("azure_login", NestedBlock::single(azure_login))
                .with_at_most_one_of(&["login", "azure_login"]),
        )
        .required()
    }
}

fn required_str<'a>(value: &'a Value, path: &str) -> Result<&'a str, ProviderError> {
    let key = path.rsplit('.').next().unwrap_or(path);
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProviderError::Configuration(format!("{} is required", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + Send + Sync {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_provider_settings_defaults() {
        let settings = ProviderSettings::from_config(&Value::Null).unwrap();
        assert_eq!(settings, ProviderSettings::default());
        assert_eq!(settings.connect_timeout(), Duration::from_secs(30));

        let settings =
            ProviderSettings::from_config(&json!({"debug": true, "max_connections": null}))
                .unwrap();
        assert!(settings.debug);
        assert_eq!(settings.max_connections, 4);
    }

    #[test]
    fn test_provider_settings_rejects_zero_pool() {
        let err = ProviderSettings::from_config(&json!({"max_connections": 0})).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));

        let err = ProviderSettings::from_config(&json!({"connect_timeout": "x"})).unwrap_err();
        assert!(matches!(err, ProviderError::Serialization(_)));
    }

    #[test]
    fn test_server_block_with_login() {
        let env = env_of(&[]);
        let config = ServerConfig::from_block(
            &json!({"host": "db", "login": {"username": "sa", "password": "pw"}}),
            &env,
        )
        .unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.endpoint(), "db:1433");
        assert_eq!(config.auth.principal(), "sa");
    }

    #[test]
    fn test_server_block_with_azure_login() {
        let env = env_of(&[]);
        let config = ServerConfig::from_block(
            &json!({
                "host": "x.database.windows.net",
                "port": 1433,
                "login": null,
                "azure_login": {"tenant_id": "t", "client_id": "c", "client_secret": "s"}
            }),
            &env,
        )
        .unwrap();
        assert!(matches!(config.auth, Auth::AzureLogin { .. }));

        let err = ServerConfig::from_block(
            &json!({"host": "db", "azure_login": {"tenant_id": "t", "client_id": "c"}}),
            &env,
        )
        .unwrap_err();
        assert!(err.message().contains("server.azure_login.client_secret"));
    }

    #[test]
    fn test_server_credentials_from_env() {
        let env = env_of(&[("MSSQL_USERNAME", "sa"), ("MSSQL_PASSWORD", "pw")]);
        let config = ServerConfig::from_block(&json!({"host": "db"}), &env).unwrap();
        assert_eq!(
            config.auth,
            Auth::SqlLogin {
                username: "sa".to_string(),
                password: "pw".to_string()
            }
        );

        let env = env_of(&[
            ("MSSQL_TENANT_ID", "t"),
            ("MSSQL_CLIENT_ID", "c"),
            ("MSSQL_CLIENT_SECRET", "s"),
        ]);
        let config = ServerConfig::from_block(&json!({"host": "db"}), &env).unwrap();
        assert_eq!(config.auth.principal(), "c");

        let env = env_of(&[("MSSQL_USERNAME", "sa")]);
        let err = ServerConfig::from_block(&json!({"host": "db"}), &env).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[test]
    fn test_server_port_out_of_range() {
        let env = env_of(&[("MSSQL_USERNAME", "sa"), ("MSSQL_PASSWORD", "pw")]);
        let err = ServerConfig::from_block(&json!({"host": "db", "port": 70000}), &env)
            .unwrap_err();
        assert!(err.message().contains("out of range"));
    }

    #[test]
    fn test_to_block_leaves_credentials_out() {
        let env = env_of(&[("MSSQL_USERNAME", "deployer"), ("MSSQL_PASSWORD", "env-pw")]);
        let config = ServerConfig {
            host: "db".to_string(),
            port: 14330,
            auth: Auth::SqlLogin {
                username: "sa".to_string(),
                password: "pw".to_string(),
            },
        };
        let block = config.to_block();
        assert!(block["login"].is_null());
        assert!(block["azure_login"].is_null());
        assert!(!block.to_string().contains("pw"));

        let restored = ServerConfig::from_block(&block, &env).unwrap();
        assert_eq!(restored.endpoint(), "db:14330");
        assert_eq!(restored.auth.principal(), "deployer");
    }

    #[test]
    fn test_auth_debug_redacts_secrets() {
        let auth = Auth::AzureLogin {
            tenant_id: "t".to_string(),
            client_id: "c".to_string(),
            client_secret: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }
}
