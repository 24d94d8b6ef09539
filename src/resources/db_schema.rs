//! `mssql_schema`: database schemas.

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

/// `mssql_schema`.
pub struct SchemaResource;

const DEFAULT_OWNER: &str = "dbo";

fn read_statement(schema_name: &str) -> Statement {
    Statement::new(
        "SELECT s.schema_id, s.name, p.name AS owner_name \
         FROM sys.schemas s \
         JOIN sys.database_principals p ON p.principal_id = s.principal_id \
         WHERE s.name = @P1",
    )
    .bind(schema_name)
}

fn create_statement(schema_name: &str, owner_name: &str) -> Statement {
    let mut sql = DynamicSql::new();
    let schema = sql.bind(schema_name);
    let owner = sql.bind(owner_name);
    sql.text("CREATE SCHEMA ")
        .ident(&schema)
        .text(" AUTHORIZATION ")
        .ident(&owner);
    sql.build()
}

fn owner_statement(schema_name: &str, owner_name: &str) -> Statement {
    let mut sql = DynamicSql::new();
    let schema = sql.bind(schema_name);
    let owner = sql.bind(owner_name);
    sql.text("ALTER AUTHORIZATION ON SCHEMA::")
        .ident(&schema)
        .text(" TO ")
        .ident(&owner);
    sql.build()
}

#[async_trait::async_trait]
impl Resource for SchemaResource {
    fn type_name(&self) -> &'static str {
        "mssql_schema"
    }

    fn schema(&self) -> Schema {
        database_schema("A database schema")
            .with_attribute("schema_name", Attribute::required_string().with_force_new())
            .with_attribute(
                "owner_name",
                Attribute::optional_string().with_default(json!(DEFAULT_OWNER)),
            )
            .with_attribute("schema_id", Attribute::computed_int64())
    }

    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for name in ["database", "schema_name", "owner_name"] {
            check_attribute(config, name, check_sysname, &mut diagnostics);
        }
        diagnostics
    }

    fn id_shape(&self) -> &'static [Segment] {
        &[Segment::Name, Segment::Name]
    }

    fn import_state(&self, id: &ResourceId) -> Value {
        json!({"database": id.segment(0), "schema_name": id.segment(1)})
    }

    async fn create(&self, conn: &Connector, planned: Value) -> Result<Value, ProviderError> {
        let schema_name = required_text(&planned, "schema_name")?.to_string();
        let owner_name = text(&planned, "owner_name").unwrap_or(DEFAULT_OWNER);
        conn.execute(&create_statement(&schema_name, owner_name))
            .await?;

        let mut state = planned;
        set_id(&mut state, conn, &[conn.database(), schema_name.as_str()]);
        Ok(state)
    }

    async fn read(&self, conn: &Connector, state: Value) -> Result<Option<Value>, ProviderError> {
        let schema_name = required_text(&state, "schema_name")?.to_string();
        let Some(row) = conn.query_one(&read_statement(&schema_name)).await? else {
            return Ok(None);
        };

        let mut state = state;
        set(&mut state, "schema_id", row.json("schema_id"));
        set(&mut state, "owner_name", row.json("owner_name"));
        Ok(Some(state))
    }

    async fn update(
        &self,
        conn: &Connector,
        prior: &Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        if changed(prior, &planned, "owner_name") {
            let schema_name = required_text(&planned, "schema_name")?;
            let owner_name = text(&planned, "owner_name").unwrap_or(DEFAULT_OWNER);
            conn.execute(&owner_statement(schema_name, owner_name))
                .await?;
        }
        Ok(planned)
    }

    async fn delete(&self, conn: &Connector, state: &Value) -> Result<(), ProviderError> {
        let schema_name = required_text(state, "schema_name")?;
        conn.execute(&drop_if_exists(
            "SCHEMA",
            schema_name,
            "SELECT 1 FROM sys.schemas WHERE name = {}",
        ))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements() {
        let stmt = create_statement("sales", "dbo");
        assert!(stmt.sql.contains(
            "N'CREATE SCHEMA ' + QUOTENAME(@P1) + N' AUTHORIZATION ' + QUOTENAME(@P2);"
        ));

        let stmt = owner_statement("sales", "app");
        assert!(stmt
            .sql
            .contains("N'ALTER AUTHORIZATION ON SCHEMA::' + QUOTENAME(@P1) + N' TO ' + QUOTENAME(@P2);"));
        assert_eq!(stmt.text_param(1), Some("app"));
    }
}
