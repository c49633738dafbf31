use std::path::Path;

use serde_json::Value;

use crate::condition::{parse_condition, Expr};
use crate::errors::AuthzError;
use crate::policy::{parse_kdl_document, ParsedRule};
use crate::types::{FieldType, TypeRegistry};

/// A rule with its condition parsed once at load time.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub actors: Vec<String>,
    pub actions: Vec<String>,
    pub resource_type: String,
    pub condition: Option<Expr>,
}

impl CompiledRule {
    /// A rule applies when its resource type matches and its actor/action
    /// lists are empty or contain a match. An actor pattern matches either
    /// the actor as a string or the actor object's `name` field.
    pub fn applies_to(&self, actor: &Value, action: &str, resource_type: &str) -> bool {
        if self.resource_type != resource_type {
            return false;
        }
        if !self.actions.is_empty() && !self.actions.iter().any(|a| a == action) {
            return false;
        }
        self.actors.is_empty() || self.actors.iter().any(|p| actor_matches(actor, p))
    }
}

fn actor_matches(actor: &Value, pattern: &str) -> bool {
    match actor {
        Value::String(s) => s == pattern,
        Value::Object(map) => map
            .get("name")
            .and_then(|v| v.as_str())
            .is_some_and(|n| n == pattern),
        _ => false,
    }
}

/// The loaded policy. Immutable once published; `Engine` replaces the whole
/// snapshot on load/clear rather than mutating it in place.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn matching<'a>(
        &'a self,
        actor: &'a Value,
        action: &'a str,
        resource_type: &'a str,
    ) -> impl Iterator<Item = &'a CompiledRule> {
        self.rules
            .iter()
            .filter(move |r| r.applies_to(actor, action, resource_type))
    }
}

/// Compile parsed rules: parse condition expressions and validate every
/// resource path against the registry, so malformed policies fail at load
/// rather than at request time.
pub fn compile_rules(
    parsed: Vec<ParsedRule>,
    registry: &TypeRegistry,
) -> Result<Vec<CompiledRule>, AuthzError> {
    let mut rules = Vec::with_capacity(parsed.len());
    for rule in parsed {
        if !registry.contains(&rule.resource_type) {
            return Err(AuthzError::InvalidPolicy(format!(
                "rule `{}` references unregistered resource type `{}`",
                rule.name, rule.resource_type
            )));
        }
        let condition = match &rule.condition {
            Some(text) => {
                let expr = parse_condition(text)?;
                validate_expr(&expr, &rule.name, &rule.resource_type, registry)?;
                Some(expr)
            }
            None => None,
        };
        rules.push(CompiledRule {
            name: rule.name,
            actors: rule.actors,
            actions: rule.actions,
            resource_type: rule.resource_type,
            condition,
        });
    }
    Ok(rules)
}

/// Load all `.kdl` policy files from a directory, in path order.
pub fn load_dir(dir: &Path) -> Result<Vec<ParsedRule>, AuthzError> {
    if !dir.is_dir() {
        return Err(AuthzError::InvalidPolicy(format!(
            "policies directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    let mut all_rules = Vec::new();
    for entry in entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AuthzError::PolicyLoadError {
                path: path.display().to_string(),
                source,
            })?;
        all_rules.extend(parse_kdl_document(&contents)?);
    }

    Ok(all_rules)
}

/// Walk an expression checking that every path is rooted at a known
/// identifier and that resource paths resolve through the registry:
/// intermediate segments must be relationship fields, the final segment a
/// primitive field or a relationship (for whole-row comparison).
fn validate_expr(
    expr: &Expr,
    rule_name: &str,
    resource_type: &str,
    registry: &TypeRegistry,
) -> Result<(), AuthzError> {
    match expr {
        Expr::Literal(_) => Ok(()),
        Expr::List(items) => {
            for item in items {
                validate_expr(item, rule_name, resource_type, registry)?;
            }
            Ok(())
        }
        Expr::Path(segments) => validate_path(segments, rule_name, resource_type, registry),
        Expr::BinOp { left, right, .. } => {
            validate_expr(left, rule_name, resource_type, registry)?;
            validate_expr(right, rule_name, resource_type, registry)
        }
        Expr::UnaryNot(inner) => validate_expr(inner, rule_name, resource_type, registry),
        Expr::In {
            element,
            collection,
        } => {
            validate_expr(element, rule_name, resource_type, registry)?;
            validate_expr(collection, rule_name, resource_type, registry)
        }
    }
}

fn validate_path(
    segments: &[String],
    rule_name: &str,
    resource_type: &str,
    registry: &TypeRegistry,
) -> Result<(), AuthzError> {
    match segments[0].as_str() {
        "actor" | "action" => Ok(()),
        "resource" => {
            let mut ty = resource_type.to_string();
            let rest = &segments[1..];
            for (i, seg) in rest.iter().enumerate() {
                match registry.field(&ty, seg) {
                    None => {
                        return Err(AuthzError::InvalidPolicy(format!(
                            "rule `{rule_name}`: unknown field `{seg}` on type `{ty}`"
                        )));
                    }
                    Some(FieldType::Relation(rel)) => {
                        ty = rel.other_type.clone();
                    }
                    Some(_) if i + 1 < rest.len() => {
                        return Err(AuthzError::InvalidPolicy(format!(
                            "rule `{rule_name}`: field `{seg}` on type `{ty}` is not a relationship"
                        )));
                    }
                    Some(_) => {}
                }
            }
            Ok(())
        }
        other => Err(AuthzError::InvalidPolicy(format!(
            "rule `{rule_name}`: unknown identifier root `{other}` (expected `actor`, `action` or `resource`)"
        ))),
    }
}
