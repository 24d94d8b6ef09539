//! SQL statements, parameters and result rows.
//!
//! Values supplied by configuration are never spliced into SQL text. Plain
//! queries bind them as `@P1..@Pn`. DDL, which cannot take parameters for
//! names or literals, is assembled server-side with [`DynamicSql`]:
//!
//! ```text
//! DECLARE @sql nvarchar(max) = N'CREATE USER ' + QUOTENAME(@P1);
//! IF @@VERSION NOT LIKE N'Microsoft SQL Azure%' SET @sql = @sql + ...;
//! EXEC (@sql);
//! ```
//!
//! Identifiers pass through `QUOTENAME`, string literals through a doubled
//! `REPLACE` so that passwords longer than 128 characters still work.

use std::collections::BTreeMap;
use std::fmt;

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    /// `nvarchar` value.
    Text(String),
    /// `bigint` value.
    Int(i64),
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for SqlParam {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// A SQL batch with its bound parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Batch text with `@Pn` placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<SqlParam>,
}

impl Statement {
    /// Create a statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next parameter.
    pub fn bind(mut self, value: impl Into<SqlParam>) -> Self {
        self.params.push(value.into());
        self
    }

    /// The text parameter at `index`, if any.
    pub fn text_param(&self, index: usize) -> Option<&str> {
        match self.params.get(index) {
            Some(SqlParam::Text(s)) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Parameters may hold passwords and are never printed.
        write!(f, "{} ({} params)", self.sql, self.params.len())
    }
}

struct Segment {
    condition: Option<String>,
    parts: Vec<String>,
}

/// Builder for DDL executed as server-side dynamic SQL.
///
/// [`bind`](Self::bind) returns the placeholder for a value; the placeholder
/// can then be used as an identifier, a literal, or inside conditions, as
/// many times as needed.
pub struct DynamicSql {
    params: Vec<SqlParam>,
    segments: Vec<Segment>,
    guard: Option<String>,
}

impl Default for DynamicSql {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicSql {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            params: Vec::new(),
            segments: vec![Segment {
                condition: None,
                parts: Vec::new(),
            }],
            guard: None,
        }
    }

    /// Bind a value and return its placeholder (`@P1`, `@P2`, ...).
    pub fn bind(&mut self, value: impl Into<SqlParam>) -> String {
        self.params.push(value.into());
        format!("@P{}", self.params.len())
    }

    fn push(&mut self, part: String) -> &mut Self {
        if let Some(segment) = self.segments.last_mut() {
            segment.parts.push(part);
        }
        self
    }

    /// Append fixed statement text. Must never contain configuration values.
    pub fn text(&mut self, text: &str) -> &mut Self {
        self.push(format!("N'{}'", text.replace('\'', "''")))
    }

    /// Append a bound value as a bracket-quoted identifier.
    pub fn ident(&mut self, placeholder: &str) -> &mut Self {
        self.push(format!("QUOTENAME({})", placeholder))
    }

    /// Append a bound value as a quoted string literal.
    pub fn literal(&mut self, placeholder: &str) -> &mut Self {
        self.push(format!(
            "N'''' + REPLACE({}, N'''', N'''''') + N''''",
            placeholder
        ))
    }

    /// Append a raw `nvarchar` expression.
    pub fn expr(&mut self, expression: &str) -> &mut Self {
        self.push(expression.to_string())
    }

    /// Following parts are only appended when `condition` holds at runtime.
    pub fn begin_if(&mut self, condition: impl Into<String>) -> &mut Self {
        self.segments.push(Segment {
            condition: Some(condition.into()),
            parts: Vec::new(),
        });
        self
    }

    /// Close a [`begin_if`](Self::begin_if) section.
    pub fn end_if(&mut self) -> &mut Self {
        self.segments.push(Segment {
            condition: None,
            parts: Vec::new(),
        });
        self
    }

    /// Only execute the assembled statement when `condition` holds.
    pub fn guard(&mut self, condition: impl Into<String>) -> &mut Self {
        self.guard = Some(condition.into());
        self
    }

    /// Produce the final batch.
    pub fn build(self) -> Statement {
        let mut sql = String::from("DECLARE @sql nvarchar(max) = N'';\n");
        for segment in self.segments.iter().filter(|s| !s.parts.is_empty()) {
            let assignment = format!("SET @sql = @sql + {};\n", segment.parts.join(" + "));
            match &segment.condition {
                Some(condition) => sql.push_str(&format!("IF {} {}", condition, assignment)),
                None => sql.push_str(&assignment),
            }
        }
        match self.guard {
            Some(condition) => sql.push_str(&format!("IF {}\n    EXEC (@sql);", condition)),
            None => sql.push_str("EXEC (@sql);"),
        }
        Statement {
            sql,
            params: self.params,
        }
    }
}

/// Condition that is true on Azure SQL Database.
pub const IS_AZURE_SQL: &str = "@@VERSION LIKE N'Microsoft SQL Azure%'";

/// Condition that is true everywhere except Azure SQL Database.
pub const IS_NOT_AZURE_SQL: &str = "@@VERSION NOT LIKE N'Microsoft SQL Azure%'";

/// A single column value from a result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// `bit`.
    Bool(bool),
    /// Any integer column.
    Int(i64),
    /// Character, GUID and hex-formatted binary columns.
    Text(String),
}

impl SqlValue {
    /// Convert to the JSON representation stored in state.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A result row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: BTreeMap<String, SqlValue>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    /// Builder-style NULL column.
    pub fn with_null(mut self, column: impl Into<String>) -> Self {
        self.columns.insert(column.into(), SqlValue::Null);
        self
    }

    /// Insert or replace a column.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.columns.insert(column.into(), value.into());
    }

    /// Raw column value.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    /// Column as text; NULL and missing columns are `None`.
    pub fn text(&self, column: &str) -> Option<&str> {
        match self.columns.get(column) {
            Some(SqlValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Column as integer; NULL and missing columns are `None`.
    pub fn int(&self, column: &str) -> Option<i64> {
        match self.columns.get(column) {
            Some(SqlValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Column as JSON, NULL and missing columns become `null`.
    pub fn json(&self, column: &str) -> serde_json::Value {
        self.columns
            .get(column)
            .map(SqlValue::to_json)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Format bytes as an upper-case `0x` literal, as `CONVERT(varchar, sid, 1)` does.
pub fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_binding() {
        let stmt = Statement::new("SELECT principal_id FROM sys.sql_logins WHERE name = @P1")
            .bind("app");
        assert_eq!(stmt.params, vec![SqlParam::Text("app".to_string())]);
        assert_eq!(stmt.text_param(0), Some("app"));
        assert_eq!(stmt.text_param(1), None);
    }

    #[test]
    fn test_statement_display_hides_params() {
        let stmt = Statement::new("ALTER LOGIN x").bind("s3cret!");
        let shown = stmt.to_string();
        assert!(!shown.contains("s3cret!"));
        assert!(shown.contains("1 params"));
    }

    #[test]
    fn test_dynamic_sql_identifier_and_literal() {
        let mut sql = DynamicSql::new();
        let name = sql.bind("app");
        let password = sql.bind("it's");
        sql.text("CREATE LOGIN ")
            .ident(&name)
            .text(" WITH PASSWORD = ")
            .literal(&password);
        let stmt = sql.build();

        assert_eq!(
            stmt.sql,
            "DECLARE @sql nvarchar(max) = N'';\n\
             SET @sql = @sql + N'CREATE LOGIN ' + QUOTENAME(@P1) + N' WITH PASSWORD = ' + N'''' + REPLACE(@P2, N'''', N'''''') + N'''';\n\
             EXEC (@sql);"
        );
        assert_eq!(stmt.params.len(), 2);
        assert_eq!(stmt.text_param(1), Some("it's"));
    }

    #[test]
    fn test_dynamic_sql_conditional_segment() {
        let mut sql = DynamicSql::new();
        let name = sql.bind("app");
        let db = sql.bind("appdb");
        sql.text("CREATE LOGIN ")
            .ident(&name)
            .begin_if(IS_NOT_AZURE_SQL)
            .text(", DEFAULT_DATABASE = ")
            .ident(&db)
            .end_if();
        let stmt = sql.build();

        assert!(stmt.sql.contains(
            "IF @@VERSION NOT LIKE N'Microsoft SQL Azure%' SET @sql = @sql + N', DEFAULT_DATABASE = ' + QUOTENAME(@P2);"
        ));
        assert!(stmt.sql.ends_with("EXEC (@sql);"));
    }

    #[test]
    fn test_dynamic_sql_guard() {
        let mut sql = DynamicSql::new();
        let name = sql.bind("app");
        sql.text("DROP USER ").ident(&name);
        sql.guard(format!(
            "EXISTS (SELECT 1 FROM sys.database_principals WHERE name = {})",
            name
        ));
        let stmt = sql.build();
        assert!(stmt.sql.ends_with(
            "IF EXISTS (SELECT 1 FROM sys.database_principals WHERE name = @P1)\n    EXEC (@sql);"
        ));
    }

    #[test]
    fn test_text_escapes_quotes() {
        let mut sql = DynamicSql::new();
        sql.text("'");
        assert!(sql.build().sql.contains("N''''"));
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new()
            .with("name", "app")
            .with("principal_id", 267i64)
            .with_null("default_language_name");

        assert_eq!(row.text("name"), Some("app"));
        assert_eq!(row.int("principal_id"), Some(267));
        assert_eq!(row.text("default_language_name"), None);
        assert_eq!(row.json("principal_id"), serde_json::json!(267));
        assert_eq!(row.json("missing"), serde_json::Value::Null);
    }

    #[test]
    fn test_hex_literal() {
        assert_eq!(hex_literal(&[0x01, 0xab, 0x00]), "0x01AB00");
        assert_eq!(hex_literal(&[]), "0x");
    }
}
