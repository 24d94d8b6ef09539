//! `mssql_role`: database roles.

use serde_json::{json, Value};

use super::{
    changed, database_schema, drop_if_exists, required_text, set, set_id, text, Resource,
};
use crate::connector::Connector;
use crate::error::ProviderError;
use crate::resource_id::{ResourceId, Segment};
use crate::schema::{Attribute, Diagnostic, Schema};
use crate::sql::{DynamicSql, Statement};
use crate::validation::{check_attribute, check_sysname};

/// `mssql_role`.
pub struct RoleResource;

fn read_statement(role_name: &str) -> Statement {
    Statement::new(
        "SELECT r.principal_id, r.name, o.name AS owner_name \
         FROM sys.database_principals r \
         LEFT JOIN sys.database_principals o ON o.principal_id = r.owning_principal_id \
         WHERE r.type = 'R' AND r.name = @P1",
    )
    .bind(role_name)
}

fn create_statement(role_name: &str, owner_name: Option<&str>) -> Statement {
    let mut sql = DynamicSql::new();
    let role = sql.bind(role_name);
    sql.text("CREATE ROLE ").ident(&role);
    if let Some(owner) = owner_name {
        let owner = sql.bind(owner);
        sql.text(" AUTHORIZATION ").ident(&owner);
    }
    sql.build()
}

fn rename_statement(from: &str, to: &str) -> Statement {
    let mut sql = DynamicSql::new();
    let from = sql.bind(from);
    let to = sql.bind(to);
    sql.text("ALTER ROLE ")
        .ident(&from)
        .text(" WITH NAME = ")
        .ident(&to);
    sql.build()
}

fn owner_statement(role_name: &str, owner_name: &str) -> Statement {
    let mut sql = DynamicSql::new();
    let role = sql.bind(role_name);
    let owner = sql.bind(owner_name);
    sql.text("ALTER AUTHORIZATION ON ROLE::")
        .ident(&role)
        .text(" TO ")
        .ident(&owner);
    sql.build()
}

#[async_trait::async_trait]
impl Resource for RoleResource {
    fn type_name(&self) -> &'static str {
        "mssql_role"
    }

    fn schema(&self) -> Schema {
        database_schema("A database role")
            .with_attribute(
                "role_name",
                Attribute::required_string().with_description("Renamed in place when changed"),
            )
            .with_attribute("owner_name", Attribute::optional_computed_string())
            .with_attribute("principal_id", Attribute::computed_int64())
    }

    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for name in ["database", "role_name", "owner_name"] {
            check_attribute(config, name, check_sysname, &mut diagnostics);
        }
        diagnostics
    }

    fn id_shape(&self) -> &'static [Segment] {
        &[Segment::Name, Segment::Name]
    }

    fn import_state(&self, id: &ResourceId) -> Value {
        json!({"database": id.segment(0), "role_name": id.segment(1)})
    }

    async fn create(&self, conn: &Connector, planned: Value) -> Result<Value, ProviderError> {
        let role_name = required_text(&planned, "role_name")?.to_string();
        conn.execute(&create_statement(&role_name, text(&planned, "owner_name")))
            .await?;

        let mut state = planned;
        set_id(&mut state, conn, &[conn.database(), role_name.as_str()]);
        Ok(state)
    }

    async fn read(&self, conn: &Connector, state: Value) -> Result<Option<Value>, ProviderError> {
        let role_name = required_text(&state, "role_name")?.to_string();
        let Some(row) = conn.query_one(&read_statement(&role_name)).await? else {
            return Ok(None);
        };

        let mut state = state;
        set(&mut state, "principal_id", row.json("principal_id"));
        set(&mut state, "owner_name", row.json("owner_name"));
        Ok(Some(state))
    }

    async fn update(
        &self,
        conn: &Connector,
        prior: &Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        let role_name = required_text(&planned, "role_name")?.to_string();

        if changed(prior, &planned, "role_name") {
            let old_name = required_text(prior, "role_name")?;
            conn.execute(&rename_statement(old_name, &role_name)).await?;
        }
        if changed(prior, &planned, "owner_name") {
            if let Some(owner) = text(&planned, "owner_name") {
                conn.execute(&owner_statement(&role_name, owner)).await?;
            }
        }

        // The id carries the name.
        let mut state = planned;
        set_id(&mut state, conn, &[conn.database(), role_name.as_str()]);
        Ok(state)
    }

    async fn delete(&self, conn: &Connector, state: &Value) -> Result<(), ProviderError> {
        let role_name = required_text(state, "role_name")?;
        conn.execute(&drop_if_exists(
            "ROLE",
            role_name,
            "SELECT 1 FROM sys.database_principals WHERE type = 'R' AND name = {}",
        ))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_statement() {
        let stmt = create_statement("readers", None);
        assert!(stmt.sql.contains("N'CREATE ROLE ' + QUOTENAME(@P1);"));

        let stmt = create_statement("readers", Some("dbo"));
        assert!(stmt
            .sql
            .contains("N'CREATE ROLE ' + QUOTENAME(@P1) + N' AUTHORIZATION ' + QUOTENAME(@P2);"));
    }

    #[test]
    fn test_rename_and_owner_statements() {
        let stmt = rename_statement("readers", "viewers");
        assert!(stmt.sql.contains("N' WITH NAME = ' + QUOTENAME(@P2)"));
        assert_eq!(stmt.text_param(0), Some("readers"));
        assert_eq!(stmt.text_param(1), Some("viewers"));

        let stmt = owner_statement("viewers", "app");
        assert!(stmt.sql.contains("N'ALTER AUTHORIZATION ON ROLE::' + QUOTENAME(@P1)"));
    }
}
