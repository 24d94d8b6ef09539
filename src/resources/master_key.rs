//! `mssql_database_masterkey`: the database master key.

use serde_json::{json, Value};

use super::{changed, database_schema, required_text, set, set_id, Resource};
use crate::connector::Connector;
use crate::error::ProviderError;
use crate::resource_id::{ResourceId, Segment};
use crate::schema::{Attribute, Schema};
use crate::sql::{DynamicSql, Statement};

/// `mssql_database_masterkey`: the database master key, at most one per database.
pub struct MasterKeyResource;

const ID_MARKER: &str = "masterkey";

const READ_SQL: &str = "SELECT name AS key_name, principal_id, symmetric_key_id, key_length, \
     key_algorithm, algorithm_desc, CONVERT(varchar(36), key_guid) AS key_guid \
     FROM sys.symmetric_keys WHERE name = N'##MS_DatabaseMasterKey##'";

const COMPUTED: &[&str] = &[
    "key_name",
    "principal_id",
    "symmetric_key_id",
    "key_length",
    "key_algorithm",
    "algorithm_desc",
    "key_guid",
];

fn password_statement(prefix: &str, password: &str) -> Statement {
    let mut sql = DynamicSql::new();
    let password = sql.bind(password);
    sql.text(prefix).literal(&password);
    sql.build()
}

#[async_trait::async_trait]
impl Resource for MasterKeyResource {
    fn type_name(&self) -> &'static str {
        "mssql_database_masterkey"
    }

    fn schema(&self) -> Schema {
        database_schema("The database master key")
            .with_attribute(
                "password",
                Attribute::required_string()
                    .sensitive()
                    .with_description("Password protecting the key; changing it regenerates the key"),
            )
            .with_attribute("key_name", Attribute::computed_string())
            .with_attribute("principal_id", Attribute::computed_int64())
            .with_attribute("symmetric_key_id", Attribute::computed_int64())
            .with_attribute("key_length", Attribute::computed_int64())
            .with_attribute("key_algorithm", Attribute::computed_string())
            .with_attribute("algorithm_desc", Attribute::computed_string())
            .with_attribute("key_guid", Attribute::computed_string())
    }

    fn id_shape(&self) -> &'static [Segment] {
        &[Segment::Name, Segment::Literal(ID_MARKER)]
    }

    fn import_state(&self, id: &ResourceId) -> Value {
        json!({"database": id.segment(0)})
    }

    async fn create(&self, conn: &Connector, planned: Value) -> Result<Value, ProviderError> {
        let password = required_text(&planned, "password")?;
        conn.execute(&password_statement(
            "CREATE MASTER KEY ENCRYPTION BY PASSWORD = ",
            password,
        ))
        .await?;

        let mut state = planned;
        set_id(&mut state, conn, &[conn.database(), ID_MARKER]);
        Ok(state)
    }

    async fn read(&self, conn: &Connector, state: Value) -> Result<Option<Value>, ProviderError> {
        let Some(row) = conn.query_one(&Statement::new(READ_SQL)).await? else {
            return Ok(None);
        };

        let mut state = state;
        for name in COMPUTED {
            set(&mut state, name, row.json(name));
        }
        Ok(Some(state))
    }

    async fn update(
        &self,
        conn: &Connector,
        prior: &Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        if changed(prior, &planned, "password") {
            let password = required_text(&planned, "password")?;
            conn.execute(&password_statement(
                "ALTER MASTER KEY REGENERATE WITH ENCRYPTION BY PASSWORD = ",
                password,
            ))
            .await?;
        }
        Ok(planned)
    }

    async fn delete(&self, conn: &Connector, _state: &Value) -> Result<(), ProviderError> {
        conn.execute(&Statement::new(
            "IF EXISTS (SELECT 1 FROM sys.symmetric_keys WHERE name = N'##MS_DatabaseMasterKey##')\n    \
             DROP MASTER KEY;",
        ))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_statement() {
        let stmt = password_statement("CREATE MASTER KEY ENCRYPTION BY PASSWORD = ", "p'w");
        assert!(stmt.sql.contains(
            "N'CREATE MASTER KEY ENCRYPTION BY PASSWORD = ' + N'''' + REPLACE(@P1, N'''', N'''''') + N'''';"
        ));
        assert_eq!(stmt.text_param(0), Some("p'w"));
    }

    #[test]
    fn test_import_state() {
        let id = ResourceId::parse_as(
            "sqlserver://db:1433/appdb/masterkey",
            MasterKeyResource.id_shape(),
        )
        .unwrap();
        assert_eq!(MasterKeyResource.import_state(&id), json!({"database": "appdb"}));
    }
}
