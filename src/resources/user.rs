//! `mssql_user`: database users mapped to a login, contained users with a
//! password, and Azure AD users created from an external provider.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use super::{
    alter_option, changed, check_set_elements, database_schema, drop_if_exists, required_text,
    role_membership, set, set_id, set_ignoring_case, text, text_set, Resource,
};
use crate::connector::Connector;
use crate::error::ProviderError;
use crate::resource_id::{ResourceId, Segment};
use crate::schema::{Attribute, AttributeFlags, Diagnostic, Schema};
use crate::sql::{DynamicSql, Statement};
use crate::validation::{check_attribute, check_guid, check_sid, check_sysname};

/// `mssql_user`: a database user for a login, a contained password user, or
/// an Azure AD principal.
pub struct UserResource;

const EXISTS: &str =
    "SELECT 1 FROM sys.database_principals WHERE type IN ('S', 'E', 'X') AND name = {}";

fn read_statement(username: &str) -> Statement {
    Statement::new(
        "SELECT principal_id, name, authentication_type_desc, \
         CONVERT(varchar(514), sid, 1) AS sid, default_schema_name, default_language_name, \
         CASE WHEN authentication_type_desc = 'INSTANCE' THEN SUSER_SNAME(sid) END AS login_name \
         FROM sys.database_principals \
         WHERE type IN ('S', 'E', 'X') AND name = @P1",
    )
    .bind(username)
}

fn roles_statement(principal_id: i64) -> Statement {
    Statement::new(
        "SELECT r.name FROM sys.database_role_members rm \
         JOIN sys.database_principals r ON r.principal_id = rm.role_principal_id \
         WHERE rm.member_principal_id = @P1",
    )
    .bind(principal_id)
}

fn create_statement(planned: &Value) -> Result<Statement, ProviderError> {
    let mut sql = DynamicSql::new();
    let username = sql.bind(required_text(planned, "username")?);
    sql.text("CREATE USER ").ident(&username);

    let password = text(planned, "password");
    let mut options: Vec<(&str, String, bool)> = Vec::new();

    if let Some(login_name) = text(planned, "login_name") {
        let p = sql.bind(login_name);
        sql.text(" FOR LOGIN ").ident(&p);
    } else if let Some(password) = password {
        let p = sql.bind(password);
        options.push(("PASSWORD", p, true));
    } else {
        sql.text(" FROM EXTERNAL PROVIDER");
        if let Some(object_id) = text(planned, "object_id") {
            let p = sql.bind(object_id);
            options.push(("OBJECT_ID", p, true));
        }
    }

    if let Some(schema) = text(planned, "default_schema") {
        let p = sql.bind(schema);
        options.push(("DEFAULT_SCHEMA", p, false));
    }
    // A SID can only be chosen for users with a password.
    if let (Some(sid), Some(_)) = (text(planned, "sid"), password) {
        check_sid(sid).map_err(|e| ProviderError::Validation(format!("sid {}", e)))?;
        let p = sql.bind(sid);
        options.push(("SID", p, false));
    }
    // Only contained users have a default language.
    if text(planned, "login_name").is_none() {
        if let Some(language) = text(planned, "default_language") {
            let p = sql.bind(language);
            options.push(("DEFAULT_LANGUAGE", p, false));
        }
    }

    for (i, (option, placeholder, literal)) in options.iter().enumerate() {
        let prefix = if i == 0 { " WITH " } else { ", " };
        sql.text(&format!("{}{} = ", prefix, option));
        match (*option, *literal) {
            ("SID", _) => sql.expr(placeholder),
            (_, true) => sql.literal(placeholder),
            (_, false) => sql.ident(placeholder),
        };
    }

    Ok(sql.build())
}

/// Azure AD object id from an external user's SID.
///
/// The SID holds the object id's GUID bytes, with the first three groups in
/// little-endian order.
pub fn object_id_from_sid(sid: &str) -> Option<String> {
    let digits = sid.strip_prefix("0x").or_else(|| sid.strip_prefix("0X"))?;
    if digits.len() != 32 || !digits.is_ascii() {
        return None;
    }
    let bytes: Vec<u8> = (0..16)
        .map(|i| u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).ok())
        .collect::<Option<_>>()?;

    let hex = |range: &[u8]| -> String { range.iter().map(|b| format!("{:02X}", b)).collect() };
    let mut d1 = bytes[0..4].to_vec();
    let mut d2 = bytes[4..6].to_vec();
    let mut d3 = bytes[6..8].to_vec();
    d1.reverse();
    d2.reverse();
    d3.reverse();
    Some(format!(
        "{}-{}-{}-{}-{}",
        hex(&d1),
        hex(&d2),
        hex(&d3),
        hex(&bytes[8..10]),
        hex(&bytes[10..16])
    ))
}

#[async_trait::async_trait]
impl Resource for UserResource {
    fn type_name(&self) -> &'static str {
        "mssql_user"
    }

    fn schema(&self) -> Schema {
        database_schema("A database user")
            .with_attribute("username", Attribute::required_string().with_force_new())
            .with_attribute(
                "object_id",
                Attribute::optional_string()
                    .with_force_new()
                    .with_conflicts(&["login_name", "password"])
                    .with_description("Azure AD object id of the user, group or application"),
            )
            .with_attribute(
                "login_name",
                Attribute::optional_string()
                    .with_force_new()
                    .with_conflicts(&["password"]),
            )
            .with_attribute("password", Attribute::optional_string().sensitive())
            .with_attribute(
                "sid",
                Attribute::optional_computed_string().with_force_new(),
            )
            .with_attribute(
                "authentication_type",
                Attribute::computed_string()
                    .with_description("One of INSTANCE, DATABASE or EXTERNAL"),
            )
            .with_attribute(
                "default_schema",
                Attribute::optional_string().with_default(json!("dbo")),
            )
            .with_attribute(
                "default_language",
                Attribute::optional_computed_string()
                    .with_conflicts(&["login_name"])
                    .with_description("Contained users only; a login's user takes the login's language"),
            )
            .with_attribute(
                "roles",
                Attribute::string_set(AttributeFlags::optional_computed()),
            )
            .with_attribute("principal_id", Attribute::computed_int64())
    }

    fn validate(&self, config: &Value) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for name in [
            "database",
            "username",
            "login_name",
            "default_schema",
            "default_language",
        ] {
            check_attribute(config, name, check_sysname, &mut diagnostics);
        }
        check_attribute(config, "object_id", check_guid, &mut diagnostics);
        check_attribute(config, "sid", check_sid, &mut diagnostics);
        check_set_elements(config, "roles", check_sysname, &mut diagnostics);
        diagnostics
    }

    fn id_shape(&self) -> &'static [Segment] {
        &[Segment::Name, Segment::Name]
    }

    fn import_state(&self, id: &ResourceId) -> Value {
        json!({"database": id.segment(0), "username": id.segment(1)})
    }

    async fn create(&self, conn: &Connector, planned: Value) -> Result<Value, ProviderError> {
        let username = required_text(&planned, "username")?.to_string();
        conn.execute(&create_statement(&planned)?).await?;

        for role in text_set(&planned, "roles").unwrap_or_default() {
            conn.execute(&role_membership(&role, &username, true)).await?;
        }

        let mut state = planned;
        set_id(&mut state, conn, &[conn.database(), username.as_str()]);
        Ok(state)
    }

    async fn read(&self, conn: &Connector, state: Value) -> Result<Option<Value>, ProviderError> {
        let username = required_text(&state, "username")?.to_string();
        let Some(row) = conn.query_one(&read_statement(&username)).await? else {
            return Ok(None);
        };

        let mut state = state;
        let authentication_type = row.text("authentication_type_desc").unwrap_or_default();

        if authentication_type == "INSTANCE" {
            set(&mut state, "login_name", row.json("login_name"));
        }
        if authentication_type == "EXTERNAL" {
            // object_id is not computed; only refresh a configured value.
            let derived = row.text("sid").and_then(object_id_from_sid);
            if let (Some(configured), Some(derived)) = (text(&state, "object_id"), derived) {
                if !configured.eq_ignore_ascii_case(&derived) {
                    set(&mut state, "object_id", json!(derived));
                }
            }
        }

        set(&mut state, "principal_id", row.json("principal_id"));
        set(&mut state, "authentication_type", json!(authentication_type));
        set_ignoring_case(&mut state, "sid", row.json("sid"));
        set(&mut state, "default_schema", row.json("default_schema_name"));
        set(&mut state, "default_language", row.json("default_language_name"));

        let roles: BTreeSet<String> = match row.int("principal_id") {
            Some(principal_id) => conn
                .query(&roles_statement(principal_id))
                .await?
                .iter()
                .filter_map(|r| r.text("name").map(str::to_string))
                .collect(),
            None => BTreeSet::new(),
        };
        set(&mut state, "roles", json!(roles));
        Ok(Some(state))
    }

    async fn update(
        &self,
        conn: &Connector,
        prior: &Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        let username = required_text(&planned, "username")?;

        if changed(prior, &planned, "password") {
            if let Some(password) = text(&planned, "password") {
                let sql = alter_option("USER", username, "PASSWORD", password, true);
                conn.execute(&sql.build()).await?;
            }
        }
        if changed(prior, &planned, "default_schema") {
            if let Some(schema) = text(&planned, "default_schema") {
                let sql = alter_option("USER", username, "DEFAULT_SCHEMA", schema, false);
                conn.execute(&sql.build()).await?;
            }
        }
        if changed(prior, &planned, "default_language") {
            if let Some(language) = text(&planned, "default_language") {
                let sql = alter_option("USER", username, "DEFAULT_LANGUAGE", language, false);
                conn.execute(&sql.build()).await?;
            }
        }

        if let Some(wanted) = text_set(&planned, "roles") {
            let current = text_set(prior, "roles").unwrap_or_default();
            for role in current.difference(&wanted) {
                conn.execute(&role_membership(role, username, false)).await?;
            }
            for role in wanted.difference(&current) {
                conn.execute(&role_membership(role, username, true)).await?;
            }
        }
        Ok(planned)
    }

    async fn delete(&self, conn: &Connector, state: &Value) -> Result<(), ProviderError> {
        let username = required_text(state, "username")?;
        conn.execute(&drop_if_exists("USER", username, EXISTS)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_for_login() {
        let stmt = create_statement(&json!({
            "username": "app",
            "login_name": "app_login",
            "default_schema": "dbo",
            "default_language": "us_english"
        }))
        .unwrap();
        assert!(stmt.sql.contains(
            "N'CREATE USER ' + QUOTENAME(@P1) + N' FOR LOGIN ' + QUOTENAME(@P2) + N' WITH DEFAULT_SCHEMA = ' + QUOTENAME(@P3)"
        ));
        assert!(!stmt.sql.contains("DEFAULT_LANGUAGE"));
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn test_create_with_password_and_sid() {
        let stmt = create_statement(&json!({
            "username": "app",
            "password": "pw",
            "sid": "0x0105",
            "default_schema": "sales"
        }))
        .unwrap();
        assert!(stmt.sql.contains("N' WITH PASSWORD = ' + N'''' + REPLACE(@P2"));
        assert!(stmt.sql.contains("N', DEFAULT_SCHEMA = ' + QUOTENAME(@P3)"));
        assert!(stmt.sql.contains("N', SID = ' + @P4"));
    }

    #[test]
    fn test_create_external() {
        let stmt = create_statement(&json!({
            "username": "ops@example.com",
            "object_id": "6c1a7d1e-0f2a-4b4e-9a51-3f0c2b8d9e11"
        }))
        .unwrap();
        assert!(stmt.sql.contains("N' FROM EXTERNAL PROVIDER' + N' WITH OBJECT_ID = '"));

        let stmt = create_statement(&json!({"username": "ops@example.com"})).unwrap();
        assert!(stmt.sql.contains("FROM EXTERNAL PROVIDER'"));
        assert!(!stmt.sql.contains("WITH"));
    }

    #[test]
    fn test_object_id_from_sid() {
        assert_eq!(
            object_id_from_sid("0x1E7D1A6C2A0F4E4B9A513F0C2B8D9E11").as_deref(),
            Some("6C1A7D1E-0F2A-4B4E-9A51-3F0C2B8D9E11")
        );
        assert_eq!(object_id_from_sid("0x0105"), None);
        assert_eq!(object_id_from_sid("1E7D1A6C2A0F4E4B9A513F0C2B8D9E11"), None);
    }

    #[test]
    fn test_validate() {
        let resource = UserResource;
        assert!(resource
            .validate(&json!({"username": "app", "password": "pw", "sid": "0x01"}))
            .is_empty());

        let diagnostics = resource.validate(&json!({
            "username": "app",
            "object_id": "not-a-guid",
            "sid": "01",
            "roles": ["ok", ""]
        }));
        assert_eq!(diagnostics.len(), 3);
    }

    #[test]
    fn test_default_language_conflicts_with_login() {
        let diagnostics = crate::validation::validate(
            &UserResource.schema(),
            &json!({
                "server": {"host": "db"},
                "database": "appdb",
                "username": "app",
                "login_name": "app",
                "default_language": "us_english"
            }),
        );
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("default_language"));
        assert!(diagnostics[0].summary.contains("login_name"));
    }
}
