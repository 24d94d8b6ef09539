//! `mssql_database_credential`: database scoped credentials.
//!
//! The secret is write-only; SQL Server never returns it, so it is kept
//! from configuration and changes are detected against prior state only.

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

/// `mssql_database_credential`.
pub struct CredentialResource;

fn read_statement(credential_name: &str) -> Statement {
    Statement::new(
        "SELECT credential_id, name, credential_identity \
         FROM sys.database_scoped_credentials WHERE name = @P1",
    )
    .bind(credential_name)
}

/// `CREATE` or `ALTER DATABASE SCOPED CREDENTIAL`; both take the same options.
fn write_statement(verb: &str, planned: &Value) -> Result<Statement, ProviderError> {
    let mut sql = DynamicSql::new();
    let name = sql.bind(required_text(planned, "credential_name")?);
    let identity = sql.bind(required_text(planned, "identity_name")?);
    sql.text(&format!("{} DATABASE SCOPED CREDENTIAL ", verb))
        .ident(&name)
        .text(" WITH IDENTITY = ")
        .literal(&identity);
    if let Some(secret) = text(planned, "secret") {
        let secret = sql.bind(secret);
        sql.text(", SECRET = ").literal(&secret);
    }
    Ok(sql.build())
}

#[async_trait::async_trait]
impl Resource for CredentialResource {
    fn type_name(&self) -> &'static str {
        "mssql_database_credential"
    }

    fn schema(&self) -> Schema {
        database_schema("A database scoped credential")
            .with_attribute(
                "credential_name",
                Attribute::required_string().with_force_new(),
            )
            .with_attribute("identity_name", Attribute::required_string())
            .with_attribute("secret", Attribute::optional_string().sensitive())
            .with_attribute("credential_id", Attribute::computed_int64())
    }

    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        check_attribute(config, "database", check_sysname, &mut diagnostics);
        check_attribute(config, "credential_name", check_sysname, &mut diagnostics);
        diagnostics
    }

    fn id_shape(&self) -> &'static [Segment] {
        &[Segment::Name, Segment::Name]
    }

    fn import_state(&self, id: &ResourceId) -> Value {
        json!({"database": id.segment(0), "credential_name": id.segment(1)})
    }

    async fn create(&self, conn: &Connector, planned: Value) -> Result<Value, ProviderError> {
        let credential_name = required_text(&planned, "credential_name")?.to_string();
        conn.execute(&write_statement("CREATE", &planned)?).await?;

        let mut state = planned;
        set_id(&mut state, conn, &[conn.database(), credential_name.as_str()]);
        Ok(state)
    }

    async fn read(&self, conn: &Connector, state: Value) -> Result<Option<Value>, ProviderError> {
        let credential_name = required_text(&state, "credential_name")?.to_string();
        let Some(row) = conn.query_one(&read_statement(&credential_name)).await? else {
            return Ok(None);
        };

        let mut state = state;
        set(&mut state, "credential_id", row.json("credential_id"));
        set(&mut state, "identity_name", row.json("credential_identity"));
        Ok(Some(state))
    }

    async fn update(
        &self,
        conn: &Connector,
        prior: &Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        if changed(prior, &planned, "identity_name") || changed(prior, &planned, "secret") {
            conn.execute(&write_statement("ALTER", &planned)?).await?;
        }
        Ok(planned)
    }

    async fn delete(&self, conn: &Connector, state: &Value) -> Result<(), ProviderError> {
        let credential_name = required_text(state, "credential_name")?;
        conn.execute(&drop_if_exists(
            "DATABASE SCOPED CREDENTIAL",
            credential_name,
            "SELECT 1 FROM sys.database_scoped_credentials WHERE name = {}",
        ))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_statement() {
        let planned = json!({
            "credential_name": "blob",
            "identity_name": "SHARED ACCESS SIGNATURE",
            "secret": "sv=2022&sig='x'"
        });
        let stmt = write_statement("CREATE", &planned).unwrap();
        assert!(stmt.sql.contains(
            "N'CREATE DATABASE SCOPED CREDENTIAL ' + QUOTENAME(@P1) + N' WITH IDENTITY = ' + N'''' + REPLACE(@P2"
        ));
        assert!(stmt.sql.contains("N', SECRET = ' + N'''' + REPLACE(@P3"));
        assert_eq!(stmt.text_param(2), Some("sv=2022&sig='x'"));

        let stmt = write_statement("ALTER", &json!({
            "credential_name": "blob",
            "identity_name": "Managed Identity"
        }))
        .unwrap();
        assert!(stmt.sql.contains("N'ALTER DATABASE SCOPED CREDENTIAL '"));
        assert!(!stmt.sql.contains("SECRET"));
    }

    #[test]
    fn test_write_statement_requires_identity() {
        let err = write_statement("CREATE", &json!({"credential_name": "blob"})).unwrap_err();
        assert!(err.to_string().contains("identity_name"));
    }
}
