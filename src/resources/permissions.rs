//! `mssql_database_permissions`: database-scope permissions of one principal.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use super::{
    changed, check_set_elements, database_schema, required_text, set, set_id, text_set, Resource,
};
use crate::connector::Connector;
use crate::error::ProviderError;
use crate::resource_id::{ResourceId, Segment};
use crate::schema::{Attribute, AttributeFlags, Diagnostic, Schema};
use crate::sql::{DynamicSql, Statement};
use crate::validation::{
    check_attribute, check_database_permission, check_sysname, DATABASE_PERMISSIONS,
};

/// `mssql_database_permissions`.
pub struct PermissionsResource;

const ID_MARKER: &str = "permissions";

fn read_statement(username: &str) -> Statement {
    Statement::new(
        "SELECT pr.principal_id, pe.permission_name \
         FROM sys.database_principals pr \
         LEFT JOIN sys.database_permissions pe \
         ON pe.grantee_principal_id = pr.principal_id AND pe.class = 0 AND pe.state IN ('G', 'W') \
         WHERE pr.name = @P1",
    )
    .bind(username)
}

/// Permission keywords cannot be bound, so only names from the built-in list
/// reach the statement text.
fn keywords<'a>(
    permissions: impl IntoIterator<Item = &'a String>,
) -> Result<Vec<&'static str>, ProviderError> {
    permissions
        .into_iter()
        .map(|p| {
            DATABASE_PERMISSIONS
                .iter()
                .find(|known| **known == p.as_str())
                .copied()
                .ok_or_else(|| {
                    ProviderError::Validation(format!("'{}' is not a database permission", p))
                })
        })
        .collect()
}

/// `GRANT a, b TO [user]` or `REVOKE a, b FROM [user]`.
fn permission_statement(
    grant: bool,
    username: &str,
    permissions: &[&'static str],
) -> Statement {
    let mut sql = DynamicSql::new();
    let user = sql.bind(username);
    let (verb, preposition) = if grant {
        ("GRANT", "TO")
    } else {
        ("REVOKE", "FROM")
    };
    sql.text(&format!("{} {} {} ", verb, permissions.join(", "), preposition))
        .ident(&user);
    if !grant {
        sql.guard(format!(
            "EXISTS (SELECT 1 FROM sys.database_principals WHERE name = {})",
            user
        ));
    }
    sql.build()
}

async fn apply(
    conn: &Connector,
    grant: bool,
    username: &str,
    permissions: &BTreeSet<String>,
) -> Result<(), ProviderError> {
    if permissions.is_empty() {
        return Ok(());
    }
    let keywords = keywords(permissions)?;
    conn.execute(&permission_statement(grant, username, &keywords))
        .await?;
    Ok(())
}

#[async_trait::async_trait]
impl Resource for PermissionsResource {
    fn type_name(&self) -> &'static str {
        "mssql_database_permissions"
    }

    fn schema(&self) -> Schema {
        database_schema("Database-scope permissions granted to a principal")
            .with_attribute("username", Attribute::required_string().with_force_new())
            .with_attribute(
                "permissions",
                Attribute::string_set(AttributeFlags::required())
                    .with_description("Permission names, e.g. SELECT or EXECUTE"),
            )
            .with_attribute("principal_id", Attribute::computed_int64())
    }

    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        check_attribute(config, "database", check_sysname, &mut diagnostics);
        check_attribute(config, "username", check_sysname, &mut diagnostics);
        check_set_elements(
            config,
            "permissions",
            check_database_permission,
            &mut diagnostics,
        );
        diagnostics
    }

    fn id_shape(&self) -> &'static [Segment] {
        &[Segment::Name, Segment::Name, Segment::Literal(ID_MARKER)]
    }

    fn import_state(&self, id: &ResourceId) -> Value {
        json!({"database": id.segment(0), "username": id.segment(1)})
    }

    async fn create(&self, conn: &Connector, planned: Value) -> Result<Value, ProviderError> {
        let username = required_text(&planned, "username")?.to_string();
        let permissions = text_set(&planned, "permissions").unwrap_or_default();
        apply(conn, true, &username, &permissions).await?;

        let mut state = planned;
        set_id(&mut state, conn, &[conn.database(), username.as_str(), ID_MARKER]);
        Ok(state)
    }

    async fn read(&self, conn: &Connector, state: Value) -> Result<Option<Value>, ProviderError> {
        let username = required_text(&state, "username")?.to_string();
        let rows = conn.query(&read_statement(&username)).await?;
        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let granted: BTreeSet<String> = rows
            .iter()
            .filter_map(|r| r.text("permission_name").map(str::to_string))
            .collect();

        // Implicit grants such as CONNECT are only reported when managed.
        let reported: BTreeSet<String> = match text_set(&state, "permissions") {
            Some(managed) if !managed.is_empty() => {
                granted.intersection(&managed).cloned().collect()
            }
            _ => granted,
        };

        let principal_id = first.json("principal_id");
        let mut state = state;
        set(&mut state, "principal_id", principal_id);
        set(&mut state, "permissions", json!(reported));
        Ok(Some(state))
    }

    async fn update(
        &self,
        conn: &Connector,
        prior: &Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        if changed(prior, &planned, "permissions") {
            let username = required_text(&planned, "username")?;
            let current = text_set(prior, "permissions").unwrap_or_default();
            let wanted = text_set(&planned, "permissions").unwrap_or_default();

            let removed: BTreeSet<String> = current.difference(&wanted).cloned().collect();
            let added: BTreeSet<String> = wanted.difference(&current).cloned().collect();
            apply(conn, false, username, &removed).await?;
            apply(conn, true, username, &added).await?;
        }
        Ok(planned)
    }

    async fn delete(&self, conn: &Connector, state: &Value) -> Result<(), ProviderError> {
        let username = required_text(state, "username")?;
        let permissions = text_set(state, "permissions").unwrap_or_default();
        apply(conn, false, username, &permissions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_are_canonical() {
        let names: BTreeSet<String> = ["SELECT", "EXECUTE"].iter().map(|s| s.to_string()).collect();
        assert_eq!(keywords(&names).unwrap(), vec!["EXECUTE", "SELECT"]);

        let bad: BTreeSet<String> = ["SELECT; DROP TABLE x".to_string()].into_iter().collect();
        assert!(matches!(keywords(&bad), Err(ProviderError::Validation(_))));
    }

    #[test]
    fn test_permission_statement() {
        let stmt = permission_statement(true, "app", &["EXECUTE", "SELECT"]);
        assert!(stmt
            .sql
            .contains("N'GRANT EXECUTE, SELECT TO ' + QUOTENAME(@P1);"));
        assert!(stmt.sql.ends_with("\nEXEC (@sql);"));

        let stmt = permission_statement(false, "app", &["SELECT"]);
        assert!(stmt.sql.contains("N'REVOKE SELECT FROM ' + QUOTENAME(@P1);"));
        assert!(stmt
            .sql
            .contains("IF EXISTS (SELECT 1 FROM sys.database_principals WHERE name = @P1)"));
    }

    #[test]
    fn test_validate_rejects_unknown_permission() {
        let diagnostics = PermissionsResource.validate(&json!({
            "username": "app",
            "permissions": ["SELECT", "select", "FLY"]
        }));
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics[0].detail.as_deref().unwrap_or_default().contains("upper case"));
    }
}
