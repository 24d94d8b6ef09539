//! `mssql_login`: server-level SQL logins.

use serde_json::{json, Value};
use tracing::debug;

use super::{
    alter_option, base_schema, changed, drop_if_exists, required_text, set, set_id,
    set_ignoring_case, text, Resource, DEFAULT_DATABASE,
};
use crate::connector::Connector;
use crate::error::ProviderError;
use crate::resource_id::{ResourceId, Segment};
use crate::schema::{Attribute, Diagnostic, Schema};
use crate::sql::{DynamicSql, Statement, IS_NOT_AZURE_SQL};
use crate::validation::{check_attribute, check_sid, check_sysname};

/// `mssql_login`: a SQL-authenticated server login, managed in `master`.
pub struct LoginResource;

fn read_statement(login_name: &str) -> Statement {
    Statement::new(
        "SELECT principal_id, name, CONVERT(varchar(514), sid, 1) AS sid, \
         default_database_name, default_language_name \
         FROM sys.sql_logins WHERE name = @P1",
    )
    .bind(login_name)
}

fn create_statement(planned: &Value) -> Result<Statement, ProviderError> {
    let mut sql = DynamicSql::new();
    let name = sql.bind(required_text(planned, "login_name")?);
    let password = sql.bind(required_text(planned, "password")?);
    sql.text("CREATE LOGIN ")
        .ident(&name)
        .text(" WITH PASSWORD = ")
        .literal(&password);

    if let Some(sid) = text(planned, "sid") {
        // SID is a binary literal; the value is checked to be 0x + hex.
        check_sid(sid).map_err(|e| ProviderError::Validation(format!("sid {}", e)))?;
        let sid = sql.bind(sid);
        sql.text(", SID = ").expr(&sid);
    }

    // Azure SQL Database rejects both options on CREATE LOGIN.
    let database = text(planned, "default_database");
    let language = text(planned, "default_language");
    if database.is_some() || language.is_some() {
        sql.begin_if(IS_NOT_AZURE_SQL);
        if let Some(database) = database {
            let p = sql.bind(database);
            sql.text(", DEFAULT_DATABASE = ").ident(&p);
        }
        if let Some(language) = language {
            let p = sql.bind(language);
            sql.text(", DEFAULT_LANGUAGE = ").ident(&p);
        }
        sql.end_if();
    }

    Ok(sql.build())
}

fn kill_sessions_statement(login_name: &str) -> Statement {
    Statement::new(
        "IF @@VERSION NOT LIKE N'Microsoft SQL Azure%'\n\
         BEGIN\n\
         DECLARE @kill nvarchar(max) = N'';\n\
         SELECT @kill = @kill + N'KILL ' + CONVERT(nvarchar(11), session_id) + N';'\n\
         FROM sys.dm_exec_sessions WHERE login_name = @P1 AND session_id <> @@SPID;\n\
         EXEC (@kill);\n\
         END",
    )
    .bind(login_name)
}

#[async_trait::async_trait]
impl Resource for LoginResource {
    fn type_name(&self) -> &'static str {
        "mssql_login"
    }

    fn schema(&self) -> Schema {
        base_schema("A SQL Server login")
            .with_attribute(
                "login_name",
                Attribute::required_string().with_force_new(),
            )
            .with_attribute("password", Attribute::required_string().sensitive())
            .with_attribute(
                "sid",
                Attribute::optional_computed_string()
                    .with_force_new()
                    .with_description("Security identifier as a 0x... hex literal"),
            )
            .with_attribute(
                "default_database",
                Attribute::optional_string().with_default(json!(DEFAULT_DATABASE)),
            )
            .with_attribute("default_language", Attribute::optional_computed_string())
            .with_attribute("principal_id", Attribute::computed_int64())
    }

    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        check_attribute(config, "login_name", check_sysname, &mut diagnostics);
        check_attribute(config, "sid", check_sid, &mut diagnostics);
        check_attribute(config, "default_database", check_sysname, &mut diagnostics);
        check_attribute(config, "default_language", check_sysname, &mut diagnostics);
        diagnostics
    }

    fn database(&self, _state: &Value) -> String {
        DEFAULT_DATABASE.to_string()
    }

    fn id_shape(&self) -> &'static [Segment] {
        &[Segment::Name]
    }

    fn import_state(&self, id: &ResourceId) -> Value {
        json!({"login_name": id.segment(0)})
    }

    async fn create(&self, conn: &Connector, planned: Value) -> Result<Value, ProviderError> {
        let login_name = required_text(&planned, "login_name")?.to_string();
        conn.execute(&create_statement(&planned)?).await?;

        let mut state = planned;
        set_id(&mut state, conn, &[&login_name]);
        Ok(state)
    }

    async fn read(&self, conn: &Connector, state: Value) -> Result<Option<Value>, ProviderError> {
        let login_name = required_text(&state, "login_name")?.to_string();
        let Some(row) = conn.query_one(&read_statement(&login_name)).await? else {
            return Ok(None);
        };

        let mut state = state;
        set(&mut state, "principal_id", row.json("principal_id"));
        set_ignoring_case(&mut state, "sid", row.json("sid"));
        set(&mut state, "default_database", row.json("default_database_name"));
        set(&mut state, "default_language", row.json("default_language_name"));
        Ok(Some(state))
    }

    async fn update(
        &self,
        conn: &Connector,
        prior: &Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        let login_name = required_text(&planned, "login_name")?;

        if changed(prior, &planned, "password") {
            let password = required_text(&planned, "password")?;
            let sql = alter_option("LOGIN", login_name, "PASSWORD", password, true);
            conn.execute(&sql.build()).await?;
        }
        if changed(prior, &planned, "default_database") {
            if let Some(database) = text(&planned, "default_database") {
                let mut sql =
                    alter_option("LOGIN", login_name, "DEFAULT_DATABASE", database, false);
                sql.guard(IS_NOT_AZURE_SQL);
                conn.execute(&sql.build()).await?;
            }
        }
        if changed(prior, &planned, "default_language") {
            if let Some(language) = text(&planned, "default_language") {
                let sql = alter_option("LOGIN", login_name, "DEFAULT_LANGUAGE", language, false);
                conn.execute(&sql.build()).await?;
            }
        }
        Ok(planned)
    }

    async fn delete(&self, conn: &Connector, state: &Value) -> Result<(), ProviderError> {
        let login_name = required_text(state, "login_name")?;
        debug!(login_name, "terminating sessions before drop");
        conn.execute(&kill_sessions_statement(login_name)).await?;
        conn.execute(&drop_if_exists(
            "LOGIN",
            login_name,
            "SELECT 1 FROM sys.sql_logins WHERE name = {}",
        ))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_statement_minimal() {
        let stmt = create_statement(&json!({"login_name": "app", "password": "p'w"})).unwrap();
        assert!(stmt.sql.contains("N'CREATE LOGIN ' + QUOTENAME(@P1)"));
        assert!(!stmt.sql.contains("SID"));
        assert!(!stmt.sql.contains("Azure"));
        assert_eq!(stmt.text_param(1), Some("p'w"));
    }

    #[test]
    fn test_create_statement_full() {
        let stmt = create_statement(&json!({
            "login_name": "app",
            "password": "pw",
            "sid": "0x01AB",
            "default_database": "appdb",
            "default_language": "us_english"
        }))
        .unwrap();

        assert!(stmt.sql.contains("N', SID = ' + @P3"));
        assert!(stmt.sql.contains(
            "IF @@VERSION NOT LIKE N'Microsoft SQL Azure%' SET @sql = @sql + N', DEFAULT_DATABASE = ' + QUOTENAME(@P4) + N', DEFAULT_LANGUAGE = ' + QUOTENAME(@P5);"
        ));
        assert_eq!(stmt.params.len(), 5);
    }

    #[test]
    fn test_create_statement_rejects_bad_sid() {
        let err = create_statement(&json!({
            "login_name": "app",
            "password": "pw",
            "sid": "0x1; DROP TABLE x"
        }))
        .unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[test]
    fn test_validate() {
        let resource = LoginResource;
        let diagnostics = resource.validate(&json!({
            "login_name": "x".repeat(129),
            "sid": "01AB",
        }));
        assert_eq!(diagnostics.len(), 2);
    }
}
