//! Schema-driven planning.
//!
//! The planned state starts from the proposed configuration, gets schema
//! defaults, and keeps provider-computed values from the prior state. It is
//! then diffed against the prior state attribute by attribute.

use serde_json::{Map, Value};

use crate::schema::{Attribute, AttributeType, Block, Schema};
use crate::types::{AttributeChange, PlanResult};

/// Placeholder shown instead of sensitive values in plan output.
pub const SENSITIVE_PLACEHOLDER: &str = "(sensitive value)";

/// Compute the plan for moving from `prior` to `proposed`.
///
/// - `prior` of `None` (or `null`) plans a create.
/// - `proposed` of `null` plans a destroy.
pub fn plan(schema: &Schema, prior: Option<&Value>, proposed: &Value) -> PlanResult {
    let prior = prior.filter(|p| !p.is_null());

    if proposed.is_null() {
        let mut changes = Vec::new();
        if let Some(prior) = prior {
            diff_block(&schema.block, prior, &Value::Null, "", false, &mut changes);
        }
        return PlanResult::with_changes(Value::Null, changes, false);
    }

    let mut planned = fill_block(&schema.block, proposed, prior);
    let mut changes = Vec::new();
    let requires_replace = diff_block(
        &schema.block,
        prior.unwrap_or(&Value::Null),
        &planned,
        "",
        false,
        &mut changes,
    ) && prior.is_some();

    if requires_replace {
        // The replacement is a new object; nothing computed carries over.
        reset_computed(&schema.block, &mut planned, proposed);
    }

    if changes.is_empty() {
        PlanResult::no_change(planned)
    } else {
        PlanResult::with_changes(planned, changes, requires_replace)
    }
}

/// Apply defaults and carry computed values from `prior`.
fn fill_block(block: &Block, proposed: &Value, prior: Option<&Value>) -> Value {
    let mut out = proposed.as_object().cloned().unwrap_or_default();

    for (name, attr) in &block.attributes {
        let configured = out.get(name).map(|v| !v.is_null()).unwrap_or(false);
        if configured {
            continue;
        }
        let carried = prior
            .filter(|_| attr.flags.computed)
            .and_then(|p| p.get(name))
            .filter(|v| !v.is_null());
        let value = carried
            .cloned()
            .or_else(|| attr.default.clone())
            .unwrap_or(Value::Null);
        out.insert(name.clone(), value);
    }

    for (name, nested) in &block.blocks {
        let value = match out.get(name).filter(|v| v.is_object()) {
            Some(proposed_block) => fill_block(
                &nested.block,
                proposed_block,
                prior.and_then(|p| p.get(name)).filter(|v| v.is_object()),
            ),
            None => Value::Null,
        };
        out.insert(name.clone(), value);
    }

    Value::Object(out)
}

/// Null out computed attributes that the configuration does not set.
fn reset_computed(block: &Block, planned: &mut Value, proposed: &Value) {
    let Some(obj) = planned.as_object_mut() else {
        return;
    };
    for (name, attr) in &block.attributes {
        let configured = proposed.get(name).map(|v| !v.is_null()).unwrap_or(false);
        if attr.flags.computed && !configured && attr.default.is_none() {
            obj.insert(name.clone(), Value::Null);
        }
    }
}

/// Record differences between `before` and `after`. Returns whether any
/// changed attribute forces replacement.
fn diff_block(
    block: &Block,
    before: &Value,
    after: &Value,
    path: &str,
    force_new: bool,
    changes: &mut Vec<AttributeChange>,
) -> bool {
    let mut replace = false;

    for (name, attr) in &block.attributes {
        let old = present(before.get(name));
        let new = present(after.get(name));
        if values_equal(&attr.attr_type, old, new) {
            continue;
        }
        changes.push(AttributeChange::new(
            join(path, name),
            old.map(|v| mask(attr, v)),
            new.map(|v| mask(attr, v)),
        ));
        replace |= force_new || attr.force_new;
    }

    for (name, nested) in &block.blocks {
        let old = before.get(name).unwrap_or(&Value::Null);
        let new = after.get(name).unwrap_or(&Value::Null);
        if old.is_null() && new.is_null() {
            continue;
        }
        replace |= diff_block(
            &nested.block,
            old,
            new,
            &join(path, name),
            force_new || nested.force_new,
            changes,
        );
    }

    replace
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn mask(attr: &Attribute, value: &Value) -> Value {
    if attr.flags.sensitive {
        Value::String(SENSITIVE_PLACEHOLDER.to_string())
    } else {
        value.clone()
    }
}

/// Equality that ignores element order for sets.
fn values_equal(attr_type: &AttributeType, a: Option<&Value>, b: Option<&Value>) -> bool {
    match (attr_type, a, b) {
        (AttributeType::Set(_), Some(Value::Array(x)), Some(Value::Array(y))) => {
            x.len() == y.len() && x.iter().all(|item| y.contains(item))
        }
        // An empty set and an unset one are the same thing.
        (AttributeType::Set(_), Some(Value::Array(x)), None)
        | (AttributeType::Set(_), None, Some(Value::Array(x))) => x.is_empty(),
        _ => a == b,
    }
}

fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

/// Copy `value` with every sensitive attribute replaced by the placeholder,
/// for logging states.
pub fn redact(block: &Block, value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return value.clone();
    };
    let mut out = Map::new();
    for (key, v) in obj {
        let redacted = if let Some(attr) = block.attributes.get(key) {
            if v.is_null() { v.clone() } else { mask(attr, v) }
        } else if let Some(nested) = block.blocks.get(key) {
            redact(&nested.block, v)
        } else {
            v.clone()
        };
        out.insert(key.clone(), redacted);
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeFlags, NestedBlock};
    use serde_json::json;

    fn login_schema() -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute("login_name", Attribute::required_string().with_force_new())
            .with_attribute("password", Attribute::required_string().sensitive())
            .with_attribute(
                "default_database",
                Attribute::optional_string().with_default(json!("master")),
            )
            .with_attribute("default_language", Attribute::optional_computed_string())
            .with_attribute("principal_id", Attribute::computed_int64())
            .with_attribute(
                "roles",
                Attribute::string_set(AttributeFlags::optional_computed()),
            )
            .with_block(
                "server",
                NestedBlock::single(
                    Block::new()
                        .with_attribute("host", Attribute::required_string().with_force_new()),
                )
                .required(),
            )
    }

    fn prior() -> Value {
        json!({
            "id": "sqlserver://db:1433/app",
            "login_name": "app",
            "password": "old",
            "default_database": "master",
            "default_language": "us_english",
            "principal_id": 267,
            "roles": ["db_owner", "db_datareader"],
            "server": {"host": "db"}
        })
    }

    #[test]
    fn test_plan_create() {
        let proposed = json!({
            "login_name": "app",
            "password": "s3cret",
            "server": {"host": "db"}
        });
        let result = plan(&login_schema(), None, &proposed);

        assert!(!result.requires_replace);
        assert_eq!(result.planned_state["default_database"], json!("master"));
        assert!(result.planned_state["principal_id"].is_null());
        assert!(result.planned_state["id"].is_null());

        let paths: Vec<&str> = result.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["default_database", "login_name", "password", "server.host"]
        );
        let password = result.changes.iter().find(|c| c.path == "password").unwrap();
        assert_eq!(password.after, Some(json!(SENSITIVE_PLACEHOLDER)));
    }

    #[test]
    fn test_plan_no_change_carries_computed() {
        let proposed = json!({
            "login_name": "app",
            "password": "old",
            "server": {"host": "db"}
        });
        let result = plan(&login_schema(), Some(&prior()), &proposed);

        assert!(result.changes.is_empty(), "{:?}", result.changes);
        assert_eq!(result.planned_state["principal_id"], json!(267));
        assert_eq!(result.planned_state["default_language"], json!("us_english"));
        assert_eq!(result.planned_state["id"], json!("sqlserver://db:1433/app"));
    }

    #[test]
    fn test_plan_in_place_update() {
        let proposed = json!({
            "login_name": "app",
            "password": "new",
            "default_database": "appdb",
            "server": {"host": "db"}
        });
        let result = plan(&login_schema(), Some(&prior()), &proposed);

        assert!(!result.requires_replace);
        assert_eq!(result.changes.len(), 2);
        let password = result.changes.iter().find(|c| c.path == "password").unwrap();
        assert_eq!(password.before, Some(json!(SENSITIVE_PLACEHOLDER)));
        assert_eq!(result.planned_state["principal_id"], json!(267));
    }

    #[test]
    fn test_plan_force_new_resets_computed() {
        let proposed = json!({
            "login_name": "renamed",
            "password": "old",
            "server": {"host": "db"}
        });
        let result = plan(&login_schema(), Some(&prior()), &proposed);

        assert!(result.requires_replace);
        assert!(result.planned_state["principal_id"].is_null());
        assert!(result.planned_state["id"].is_null());
    }

    #[test]
    fn test_plan_nested_force_new() {
        let proposed = json!({
            "login_name": "app",
            "password": "old",
            "server": {"host": "other"}
        });
        let result = plan(&login_schema(), Some(&prior()), &proposed);
        assert!(result.requires_replace);
        assert_eq!(result.changes[0].path, "server.host");
    }

    #[test]
    fn test_plan_set_order_is_ignored() {
        let proposed = json!({
            "login_name": "app",
            "password": "old",
            "roles": ["db_datareader", "db_owner"],
            "server": {"host": "db"}
        });
        let result = plan(&login_schema(), Some(&prior()), &proposed);
        assert!(result.changes.is_empty());
    }

    #[test]
    fn test_plan_destroy() {
        let result = plan(&login_schema(), Some(&prior()), &Value::Null);
        assert!(result.planned_state.is_null());
        assert!(!result.requires_replace);
        assert!(result.changes.iter().all(|c| c.after.is_none()));
        assert!(result.changes.iter().any(|c| c.path == "server.host"));
    }

    #[test]
    fn test_redact() {
        let redacted = redact(&login_schema().block, &prior());
        assert_eq!(redacted["password"], json!(SENSITIVE_PLACEHOLDER));
        assert_eq!(redacted["login_name"], json!("app"));
    }
}
