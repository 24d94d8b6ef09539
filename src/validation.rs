//! Configuration validation.
//!
//! [`validate`] checks a JSON value against a [`Schema`]: required presence,
//! attribute types, conflicting attributes and exactly-one-of block groups.
//! The remaining functions are value checks for SQL Server names and
//! literals that resources apply on top of the schema.
//!
//! # Example
//!
//! ```
//! use terraform_provider_mssql::schema::{Schema, Attribute};
//! use terraform_provider_mssql::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("login_name", Attribute::required_string())
//!     .with_attribute("port", Attribute::optional_int64());
//!
//! assert!(validate(&schema, &json!({"login_name": "app"})).is_empty());
//!
//! let diagnostics = validate(&schema, &json!({"login_name": "app", "port": "1433"}));
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("port".to_string()));
//! ```

use crate::schema::{Attribute, AttributeType, Block, Diagnostic, NestedBlock, Schema};
use serde_json::Value;

/// Maximum length of a `sysname`, in UTF-16 code units.
pub const SYSNAME_MAX_LEN: usize = 128;

/// Maximum length of a security identifier, in bytes.
pub const SID_MAX_BYTES: usize = 85;

/// Database-scope permissions accepted by `GRANT ... TO <principal>`.
pub const DATABASE_PERMISSIONS: &[&str] = &[
    "ADMINISTER DATABASE BULK OPERATIONS",
    "ALTER",
    "ALTER ANY APPLICATION ROLE",
    "ALTER ANY ASSEMBLY",
    "ALTER ANY ASYMMETRIC KEY",
    "ALTER ANY CERTIFICATE",
    "ALTER ANY COLUMN ENCRYPTION KEY",
    "ALTER ANY COLUMN MASTER KEY",
    "ALTER ANY CONTRACT",
    "ALTER ANY DATABASE AUDIT",
    "ALTER ANY DATABASE DDL TRIGGER",
    "ALTER ANY DATABASE EVENT NOTIFICATION",
    "ALTER ANY DATABASE EVENT SESSION",
    "ALTER ANY DATABASE SCOPED CONFIGURATION",
    "ALTER ANY DATASPACE",
    "ALTER ANY EXTERNAL DATA SOURCE",
    "ALTER ANY EXTERNAL FILE FORMAT",
    "ALTER ANY EXTERNAL LANGUAGE",
    "ALTER ANY EXTERNAL LIBRARY",
    "ALTER ANY FULLTEXT CATALOG",
    "ALTER ANY MASK",
    "ALTER ANY MESSAGE TYPE",
    "ALTER ANY REMOTE SERVICE BINDING",
    "ALTER ANY ROLE",
    "ALTER ANY ROUTE",
    "ALTER ANY SCHEMA",
    "ALTER ANY SECURITY POLICY",
    "ALTER ANY SENSITIVITY CLASSIFICATION",
    "ALTER ANY SERVICE",
    "ALTER ANY SYMMETRIC KEY",
    "ALTER ANY USER",
    "AUTHENTICATE",
    "BACKUP DATABASE",
    "BACKUP LOG",
    "CHECKPOINT",
    "CONNECT",
    "CONNECT REPLICATION",
    "CONTROL",
    "CREATE AGGREGATE",
    "CREATE ASSEMBLY",
    "CREATE ASYMMETRIC KEY",
    "CREATE CERTIFICATE",
    "CREATE CONTRACT",
    "CREATE DATABASE",
    "CREATE DATABASE DDL EVENT NOTIFICATION",
    "CREATE DEFAULT",
    "CREATE EXTERNAL LANGUAGE",
    "CREATE EXTERNAL LIBRARY",
    "CREATE FULLTEXT CATALOG",
    "CREATE FUNCTION",
    "CREATE MESSAGE TYPE",
    "CREATE PROCEDURE",
    "CREATE QUEUE",
    "CREATE REMOTE SERVICE BINDING",
    "CREATE ROLE",
    "CREATE ROUTE",
    "CREATE RULE",
    "CREATE SCHEMA",
    "CREATE SERVICE",
    "CREATE SYMMETRIC KEY",
    "CREATE SYNONYM",
    "CREATE TABLE",
    "CREATE TYPE",
    "CREATE VIEW",
    "CREATE XML SCHEMA COLLECTION",
    "DELETE",
    "EXECUTE",
    "EXECUTE ANY EXTERNAL SCRIPT",
    "INSERT",
    "KILL DATABASE CONNECTION",
    "REFERENCES",
    "SELECT",
    "SHOWPLAN",
    "SUBSCRIBE QUERY NOTIFICATIONS",
    "TAKE OWNERSHIP",
    "UNMASK",
    "UPDATE",
    "VIEW ANY COLUMN ENCRYPTION KEY DEFINITION",
    "VIEW ANY COLUMN MASTER KEY DEFINITION",
    "VIEW DATABASE STATE",
    "VIEW DEFINITION",
];

/// Validate a JSON value against a schema.
///
/// Returns a list of diagnostics; an empty list means the value is valid.
///
/// # Validation Rules
///
/// - Required attributes must be present and non-null
/// - Computed-only attributes are skipped (the provider sets these)
/// - Attribute types must match the schema
/// - Attributes listed in `conflicts_with` must not be set together
/// - At most one block of an `at_most_one_of` group may be present
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_block(&schema.block, value, "", &mut diagnostics);
    diagnostics
}

fn validate_block(block: &Block, value: &Value, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let obj = match value {
        Value::Object(map) => map,
        Value::Null => return,
        _ => {
            let diag = Diagnostic::error("Expected object")
                .with_detail(format!("Got {}", value_type_name(value)));
            diagnostics.push(if path.is_empty() {
                diag
            } else {
                diag.with_attribute(path)
            });
            return;
        }
    };

    let is_set = |name: &str| obj.get(name).map(|v| !v.is_null()).unwrap_or(false);

    for (name, attr) in &block.attributes {
        let attr_path = join_path(path, name);
        validate_attribute(attr, obj.get(name), &attr_path, diagnostics);

        if is_set(name) {
            // Report each conflicting pair once, from the lexically smaller side.
            for other in attr.conflicts_with.iter().filter(|o| is_set(o)) {
                if name.as_str() < other.as_str() || !conflict_is_mutual(block, other, name) {
                    diagnostics.push(
                        Diagnostic::error(format!(
                            "Conflicting attributes '{}' and '{}'",
                            attr_path,
                            join_path(path, other)
                        ))
                        .with_detail("Only one of these attributes may be set")
                        .with_attribute(attr_path.clone()),
                    );
                }
            }
        }
    }

    for (name, nested) in &block.blocks {
        let block_path = join_path(path, name);
        validate_nested_block(nested, obj.get(name), &block_path, diagnostics);
    }

    if !block.at_most_one_of.is_empty() {
        let present = block
            .at_most_one_of
            .iter()
            .filter(|name| is_set(name))
            .count();
        if present > 1 {
            let group = block.at_most_one_of.join(", ");
            let diag = Diagnostic::error(format!("Only one of [{}] may be set", group))
                .with_detail(format!("Found {}", present));
            diagnostics.push(if path.is_empty() {
                diag
            } else {
                diag.with_attribute(path)
            });
        }
    }
}

fn conflict_is_mutual(block: &Block, name: &str, other: &str) -> bool {
    block
        .attributes
        .get(name)
        .map(|a| a.conflicts_with.iter().any(|c| c == other))
        .unwrap_or(false)
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if attr.flags.is_computed_only() {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        }
        Some(v) => validate_attribute_type(&attr.attr_type, v, path, diagnostics),
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        }
        AttributeType::Int64 => {
            if value.as_i64().is_none() {
                diagnostics.push(type_error(path, "int64", value));
            }
        }
        AttributeType::Bool => {
            if !value.is_boolean() {
                diagnostics.push(type_error(path, "bool", value));
            }
        }
        AttributeType::Set(element_type) => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, item, &item_path, diagnostics);
                }
                for (i, item) in items.iter().enumerate() {
                    if items[..i].contains(item) {
                        diagnostics.push(
                            Diagnostic::error(format!("Duplicate set element in '{}'", path))
                                .with_detail(format!("{} appears more than once", item))
                                .with_attribute(path),
                        );
                    }
                }
            }
            None => diagnostics.push(type_error(path, "set", value)),
        },
    }
}

fn validate_nested_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match value {
        None | Some(Value::Null) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required block '{}'", path))
                        .with_detail("This block is required")
                        .with_attribute(path),
                );
            }
        }
        Some(v) => validate_block(&nested.block, v, path, diagnostics),
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for attribute '{}'", path))
        .with_detail(format!("Expected {}, got {}", expected, value_type_name(got)))
        .with_attribute(path)
}

// Value checks

/// Check a SQL Server identifier (`sysname`).
pub fn check_sysname(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("must not be empty".to_string());
    }
    if name.encode_utf16().count() > SYSNAME_MAX_LEN {
        return Err(format!("must be at most {} characters", SYSNAME_MAX_LEN));
    }
    if name.contains('\0') {
        return Err("must not contain NUL characters".to_string());
    }
    Ok(())
}

/// Check a SID literal such as `0x0105000000000009030000...`.
pub fn check_sid(sid: &str) -> Result<(), String> {
    let digits = sid
        .strip_prefix("0x")
        .or_else(|| sid.strip_prefix("0X"))
        .ok_or_else(|| "must start with 0x".to_string())?;
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err("must contain an even, non-zero number of hex digits".to_string());
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("must contain only hex digits".to_string());
    }
    if digits.len() / 2 > SID_MAX_BYTES {
        return Err(format!("must be at most {} bytes", SID_MAX_BYTES));
    }
    Ok(())
}

/// Check a GUID in its canonical 8-4-4-4-12 form.
pub fn check_guid(value: &str) -> Result<(), String> {
    let groups: Vec<&str> = value.split('-').collect();
    let lengths = [8, 4, 4, 4, 12];
    let well_formed = groups.len() == lengths.len()
        && groups
            .iter()
            .zip(lengths)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()));
    if well_formed {
        Ok(())
    } else {
        Err("must be a GUID (xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx)".to_string())
    }
}

/// Check a database permission name against [`DATABASE_PERMISSIONS`].
pub fn check_database_permission(permission: &str) -> Result<(), String> {
    if DATABASE_PERMISSIONS.contains(&permission) {
        Ok(())
    } else if DATABASE_PERMISSIONS.contains(&permission.to_ascii_uppercase().as_str()) {
        Err(format!(
            "must be upper case, use '{}'",
            permission.to_ascii_uppercase()
        ))
    } else {
        Err(format!("'{}' is not a database permission", permission))
    }
}

/// Apply a value check to an optional string attribute, adding a diagnostic.
pub fn check_attribute(
    value: &Value,
    path: &str,
    check: fn(&str) -> Result<(), String>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let target = path
        .split('.')
        .try_fold(value, |current, segment| current.get(segment));
    if let Some(Value::String(s)) = target {
        if let Err(reason) = check(s) {
            diagnostics.push(
                Diagnostic::error(format!("Invalid value for attribute '{}'", path))
                    .with_detail(format!("The value {}", reason))
                    .with_attribute(path),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, AttributeFlags, Block, NestedBlock, Schema};
    use serde_json::json;

    #[test]
    fn test_validate_required_string() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());

        assert!(validate(&schema, &json!({"name": "app"})).is_empty());

        let diagnostics = validate(&schema, &json!({}));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("name".to_string()));

        let diagnostics = validate(&schema, &json!({"name": null}));
        assert_eq!(diagnostics.len(), 1);

        let diagnostics = validate(&schema, &json!({"name": 123}));
        assert!(diagnostics[0].summary.contains("Invalid type"));
    }

    #[test]
    fn test_validate_computed_attribute_skipped() {
        let schema = Schema::v0().with_attribute("principal_id", Attribute::computed_int64());
        assert!(validate(&schema, &json!({})).is_empty());
        assert!(validate(&schema, &json!({"principal_id": "x"})).is_empty());
    }

    #[test]
    fn test_validate_int64() {
        let schema = Schema::v0().with_attribute("port", Attribute::optional_int64());
        assert!(validate(&schema, &json!({"port": 1433})).is_empty());
        assert_eq!(validate(&schema, &json!({"port": 14.5})).len(), 1);
        assert_eq!(validate(&schema, &json!({"port": "1433"})).len(), 1);
    }

    #[test]
    fn test_validate_string_set() {
        let schema = Schema::v0().with_attribute(
            "roles",
            Attribute::string_set(AttributeFlags::optional()),
        );

        assert!(validate(&schema, &json!({"roles": ["db_owner", "db_datareader"]})).is_empty());

        let diagnostics = validate(&schema, &json!({"roles": ["db_owner", 1]}));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("roles.1".to_string()));

        let diagnostics = validate(&schema, &json!({"roles": ["db_owner", "db_owner"]}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("Duplicate"));

        let diagnostics = validate(&schema, &json!({"roles": "db_owner"}));
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_validate_conflicts_reported_once() {
        let schema = Schema::v0()
            .with_attribute(
                "login_name",
                Attribute::optional_string().with_conflicts(&["password"]),
            )
            .with_attribute(
                "password",
                Attribute::optional_string().with_conflicts(&["login_name"]),
            );

        assert!(validate(&schema, &json!({"login_name": "app"})).is_empty());
        assert!(validate(&schema, &json!({"password": "secret"})).is_empty());

        let diagnostics = validate(&schema, &json!({"login_name": "app", "password": "secret"}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("Conflicting"));
    }

    #[test]
    fn test_validate_one_sided_conflict() {
        let schema = Schema::v0()
            .with_attribute(
                "object_id",
                Attribute::optional_string().with_conflicts(&["login_name"]),
            )
            .with_attribute("login_name", Attribute::optional_string());

        let diagnostics = validate(&schema, &json!({"object_id": "x", "login_name": "app"}));
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_validate_at_most_one_of() {
        let credentials = Block::new().with_attribute("username", Attribute::required_string());
        let schema = Schema::v0().with_block(
            "server",
            NestedBlock::single(
                Block::new()
                    .with_attribute("host", Attribute::required_string())
                    .with_block("login", NestedBlock::single(credentials.clone()))
                    .with_block("azure_login", NestedBlock::single(credentials))
                    .with_at_most_one_of(&["login", "azure_login"]),
            )
            .required(),
        );

        let ok = json!({"server": {"host": "db", "login": {"username": "sa"}}});
        assert!(validate(&schema, &ok).is_empty());

        let none = json!({"server": {"host": "db"}});
        assert!(validate(&schema, &none).is_empty());

        let both = json!({"server": {
            "host": "db",
            "login": {"username": "sa"},
            "azure_login": {"username": "sp"}
        }});
        let diagnostics = validate(&schema, &both);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("server".to_string()));

        let missing = json!({});
        let diagnostics = validate(&schema, &missing);
        assert!(diagnostics[0].summary.contains("Missing required block"));
    }

    #[test]
    fn test_validate_nested_attribute_path() {
        let schema = Schema::v0().with_block(
            "server",
            NestedBlock::single(Block::new().with_attribute("port", Attribute::optional_int64())),
        );
        let diagnostics = validate(&schema, &json!({"server": {"port": "x"}}));
        assert_eq!(diagnostics[0].attribute, Some("server.port".to_string()));
    }

    #[test]
    fn test_validate_root_not_object() {
        let schema = Schema::v0().with_attribute("name", Attribute::required_string());
        let diagnostics = validate(&schema, &json!("not an object"));
        assert!(diagnostics[0].summary.contains("Expected object"));
        assert!(!validate(&schema, &json!([])).is_empty());
        assert!(validate(&schema, &json!({"name": "x"})).is_empty());
    }

    #[test]
    fn test_check_sysname() {
        assert!(check_sysname("app_user").is_ok());
        assert!(check_sysname("name with ] bracket").is_ok());
        assert!(check_sysname("").is_err());
        assert!(check_sysname("   ").is_err());
        assert!(check_sysname(&"a".repeat(128)).is_ok());
        assert!(check_sysname(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_check_sid() {
        assert!(check_sid("0x01050000000000090300000048B1E5CFA4A1A54E8D8B1DC8E0A0C3A2").is_ok());
        assert!(check_sid("0x0A").is_ok());
        assert!(check_sid("0x").is_err());
        assert!(check_sid("0xABC").is_err());
        assert!(check_sid("0xZZ").is_err());
        assert!(check_sid("ABCD").is_err());
        assert!(check_sid(&format!("0x{}", "00".repeat(86))).is_err());
    }

    #[test]
    fn test_check_guid() {
        assert!(check_guid("8f3b1c52-0a6d-4d3e-9d8e-6a1a2b3c4d5e").is_ok());
        assert!(check_guid("8f3b1c52-0a6d-4d3e-9d8e").is_err());
        assert!(check_guid("8f3b1c52x0a6d-4d3e-9d8e-6a1a2b3c4d5e").is_err());
    }

    #[test]
    fn test_check_database_permission() {
        assert!(check_database_permission("SELECT").is_ok());
        assert!(check_database_permission("VIEW DATABASE STATE").is_ok());
        let err = check_database_permission("select").unwrap_err();
        assert!(err.contains("SELECT"));
        assert!(check_database_permission("SELECT; DROP TABLE x").is_err());
    }

    #[test]
    fn test_check_attribute_nested_path() {
        let mut diagnostics = Vec::new();
        let value = json!({"server": {"azure_login": {"tenant_id": "nope"}}});
        check_attribute(&value, "server.azure_login.tenant_id", check_guid, &mut diagnostics);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].attribute,
            Some("server.azure_login.tenant_id".to_string())
        );

        let mut diagnostics = Vec::new();
        check_attribute(&json!({}), "sid", check_sid, &mut diagnostics);
        assert!(diagnostics.is_empty());
    }
}
