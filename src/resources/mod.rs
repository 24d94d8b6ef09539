//! Managed SQL Server objects.
//!
//! Each resource is a thin CRUD mapping between a state object and DDL. The
//! provider handles connections, planning and read-after-write; a resource
//! only builds statements and copies query results into state.

pub mod credential;
pub mod db_schema;
pub mod login;
pub mod master_key;
pub mod permissions;
pub mod role;
pub mod user;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::config::ServerConfig;
use crate::connector::Connector;
use crate::error::ProviderError;
use crate::resource_id::{ResourceId, Segment};
use crate::schema::{Attribute, Diagnostic, Schema};
use crate::sql::{DynamicSql, Statement};
use crate::validation::{check_attribute, check_sysname};

/// Database used when a resource does not name one.
pub const DEFAULT_DATABASE: &str = "master";

/// A resource type managed by the provider.
#[async_trait::async_trait]
pub trait Resource: Send + Sync {
    /// Resource type name, e.g. `mssql_login`.
    fn type_name(&self) -> &'static str;

    /// Full schema, including `id` and `server`.
    fn schema(&self) -> Schema;

    /// Value checks beyond what the schema expresses.
    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        check_attribute(config, "database", check_sysname, &mut diagnostics);
        diagnostics
    }

    /// Database the object lives in.
    fn database(&self, state: &Value) -> String {
        text(state, "database")
            .unwrap_or(DEFAULT_DATABASE)
            .to_string()
    }

    /// Path layout of the resource id after `host:port`.
    fn id_shape(&self) -> &'static [Segment];

    /// Identifying attributes recovered from an import id.
    fn import_state(&self, id: &ResourceId) -> Value;

    /// Create the object and return the state with `id` set.
    async fn create(&self, conn: &Connector, planned: Value) -> Result<Value, ProviderError>;

    /// Refresh state from the server. `None` when the object is gone.
    async fn read(&self, conn: &Connector, state: Value) -> Result<Option<Value>, ProviderError>;

    /// Apply the differences between `prior` and `planned`.
    async fn update(
        &self,
        conn: &Connector,
        prior: &Value,
        planned: Value,
    ) -> Result<Value, ProviderError>;

    /// Drop the object. Missing objects are not an error.
    async fn delete(&self, conn: &Connector, state: &Value) -> Result<(), ProviderError>;
}

/// Every resource type, keyed by type name.
pub fn registry() -> BTreeMap<&'static str, Arc<dyn Resource>> {
    let resources: Vec<Arc<dyn Resource>> = vec![
        Arc::new(login::LoginResource),
        Arc::new(user::UserResource),
        Arc::new(role::RoleResource),
        Arc::new(db_schema::SchemaResource),
        Arc::new(credential::CredentialResource),
        Arc::new(master_key::MasterKeyResource),
        Arc::new(permissions::PermissionsResource),
    ];
    resources.into_iter().map(|r| (r.type_name(), r)).collect()
}

/// Schema skeleton shared by every resource: computed `id` and `server`.
pub(crate) fn base_schema(description: &str) -> Schema {
    Schema::v0()
        .with_description(description)
        .with_attribute(
            "id",
            Attribute::computed_string().with_description("sqlserver://host:port/... resource id"),
        )
        .with_block("server", ServerConfig::schema())
}

/// Schema skeleton for objects inside a database.
pub(crate) fn database_schema(description: &str) -> Schema {
    base_schema(description).with_attribute(
        "database",
        Attribute::optional_string()
            .with_default(json!(DEFAULT_DATABASE))
            .with_force_new()
            .with_description("Database the object lives in"),
    )
}

/// Non-empty string attribute.
pub(crate) fn text<'a>(state: &'a Value, name: &str) -> Option<&'a str> {
    state
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Non-empty string attribute that must be present.
pub(crate) fn required_text<'a>(state: &'a Value, name: &str) -> Result<&'a str, ProviderError> {
    text(state, name)
        .ok_or_else(|| ProviderError::Validation(format!("attribute '{}' is required", name)))
}

/// String-set attribute; `None` when unset.
pub(crate) fn text_set(state: &Value, name: &str) -> Option<BTreeSet<String>> {
    state.get(name).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

/// True when the attribute differs between two states.
pub(crate) fn changed(prior: &Value, planned: &Value, name: &str) -> bool {
    prior.get(name) != planned.get(name)
}

/// Set an attribute, turning a non-object state into an object first.
pub(crate) fn set(state: &mut Value, name: &str, value: Value) {
    if !state.is_object() {
        *state = Value::Object(Map::new());
    }
    if let Some(obj) = state.as_object_mut() {
        obj.insert(name.to_string(), value);
    }
}

/// Like [`set`], but keeps the current text when it only differs from
/// `value` in letter case. SQL Server reports hex literals in upper case.
pub(crate) fn set_ignoring_case(state: &mut Value, name: &str, value: Value) {
    if let (Some(current), Some(reported)) = (text(state, name), value.as_str()) {
        if current.eq_ignore_ascii_case(reported) {
            return;
        }
    }
    set(state, name, value);
}

/// Set `id` from the connector's server and the given path segments.
pub(crate) fn set_id(state: &mut Value, conn: &Connector, segments: &[&str]) {
    let id = ResourceId::new(conn.server(), segments);
    set(state, "id", json!(id.to_string()));
}

/// Diagnostics for every element of a string-set attribute.
pub(crate) fn check_set_elements(
    config: &Value,
    name: &str,
    check: fn(&str) -> Result<(), String>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for item in config
        .get(name)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        if let Err(reason) = check(item) {
            diagnostics.push(
                Diagnostic::error(format!("Invalid element '{}' in '{}'", item, name))
                    .with_detail(format!("The value {}", reason))
                    .with_attribute(name),
            );
        }
    }
}

/// `DROP <kind> [name]`, skipped when `exists` (with `{}` for the name
/// placeholder) finds nothing.
pub(crate) fn drop_if_exists(kind: &str, name: &str, exists: &str) -> Statement {
    let mut sql = DynamicSql::new();
    let p = sql.bind(name);
    sql.text(&format!("DROP {} ", kind)).ident(&p);
    sql.guard(format!("EXISTS ({})", exists.replace("{}", &p)));
    sql.build()
}

/// `ALTER <kind> [name] WITH <option> = <value>`, the value quoted as a
/// literal or as an identifier.
pub(crate) fn alter_option(
    kind: &str,
    name: &str,
    option: &str,
    value: &str,
    literal: bool,
) -> DynamicSql {
    let mut sql = DynamicSql::new();
    let name = sql.bind(name);
    let value = sql.bind(value);
    sql.text(&format!("ALTER {} ", kind))
        .ident(&name)
        .text(&format!(" WITH {} = ", option));
    if literal {
        sql.literal(&value);
    } else {
        sql.ident(&value);
    }
    sql
}

/// `ALTER ROLE [role] ADD|DROP MEMBER [member]`.
pub(crate) fn role_membership(role: &str, member: &str, add: bool) -> Statement {
    let mut sql = DynamicSql::new();
    let r = sql.bind(role);
    let m = sql.bind(member);
    sql.text("ALTER ROLE ")
        .ident(&r)
        .text(if add { " ADD MEMBER " } else { " DROP MEMBER " })
        .ident(&m);
    sql.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names() {
        let names: Vec<&str> = registry().keys().copied().collect();
        assert_eq!(
            names,
            vec![
                "mssql_database_credential",
                "mssql_database_masterkey",
                "mssql_database_permissions",
                "mssql_login",
                "mssql_role",
                "mssql_schema",
                "mssql_user",
            ]
        );
    }

    #[test]
    fn test_every_schema_has_id_and_server() {
        for (name, resource) in registry() {
            let schema = resource.schema();
            assert!(schema.attribute("id").is_some(), "{}", name);
            assert_eq!(schema.block.blocks["server"].min_items, 1, "{}", name);
        }
    }

    #[test]
    fn test_state_helpers() {
        let state = json!({"name": "app", "empty": "", "roles": ["b", "a"]});
        assert_eq!(text(&state, "name"), Some("app"));
        assert_eq!(text(&state, "empty"), None);
        assert!(required_text(&state, "missing").is_err());
        assert_eq!(
            text_set(&state, "roles").unwrap().into_iter().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(text_set(&state, "missing").is_none());

        let mut state = Value::Null;
        set(&mut state, "x", json!(1));
        assert_eq!(state, json!({"x": 1}));
    }

    #[test]
    fn test_drop_if_exists() {
        let stmt = drop_if_exists(
            "ROLE",
            "readers",
            "SELECT 1 FROM sys.database_principals WHERE type = 'R' AND name = {}",
        );
        assert!(stmt.sql.contains("N'DROP ROLE ' + QUOTENAME(@P1)"));
        assert!(stmt.sql.contains(
            "IF EXISTS (SELECT 1 FROM sys.database_principals WHERE type = 'R' AND name = @P1)"
        ));
        assert_eq!(stmt.text_param(0), Some("readers"));
    }

    #[test]
    fn test_set_ignoring_case() {
        let mut state = json!({"sid": "0x01ab"});
        set_ignoring_case(&mut state, "sid", json!("0x01AB"));
        assert_eq!(state["sid"], "0x01ab");

        set_ignoring_case(&mut state, "sid", json!("0x02CD"));
        assert_eq!(state["sid"], "0x02CD");

        let mut state = json!({});
        set_ignoring_case(&mut state, "sid", json!("0x01AB"));
        assert_eq!(state["sid"], "0x01AB");
    }

    #[test]
    fn test_alter_option() {
        let stmt = alter_option("LOGIN", "app", "DEFAULT_DATABASE", "appdb", false).build();
        assert!(stmt
            .sql
            .contains("N'ALTER LOGIN ' + QUOTENAME(@P1) + N' WITH DEFAULT_DATABASE = ' + QUOTENAME(@P2)"));

        let stmt = alter_option("USER", "app", "PASSWORD", "pw", true).build();
        assert!(stmt
            .sql
            .contains("N' WITH PASSWORD = ' + N'''' + REPLACE(@P2, N'''', N'''''') + N''''"));
    }

    #[test]
    fn test_role_membership() {
        let stmt = role_membership("db_owner", "app", false);
        assert!(stmt.sql.contains("N' DROP MEMBER '"));
        assert_eq!(stmt.params.len(), 2);
    }
}
