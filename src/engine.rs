//! The authorization engine: policy state plus the check and list entry
//! points.
//!
//! `is_allowed` evaluates conditions directly against the concrete resource
//! (relationship paths resolve by correlated fetch, with exists-any
//! semantics over the related rows). `allowed_resources` leaves the
//! resource symbolic and compiles the conditions into a [`Filter`]. For
//! every condition the filter compiler supports, the two agree: a resource
//! passes the check exactly when the list query returns it.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::backend::FetchBackend;
use crate::condition::{as_number, values_equal, BinOp, Expr};
use crate::constraint::extract;
use crate::errors::AuthzError;
use crate::filter::Filter;
use crate::loader::{compile_rules, load_dir, RuleSet};
use crate::partial::{partial_eval, Branches};
use crate::policy::parse_kdl_document;
use crate::types::{Constraint, ConstraintKind, FieldType, TypeRegistry};

pub struct Engine {
    registry: TypeRegistry,
    /// Copy-on-write snapshot: loads replace the `Arc`, in-flight requests
    /// keep evaluating against the rules they started with.
    rules: RwLock<Arc<RuleSet>>,
}

impl Engine {
    pub fn new(registry: TypeRegistry) -> Self {
        Self {
            registry,
            rules: RwLock::new(Arc::new(RuleSet::default())),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn snapshot(&self) -> Arc<RuleSet> {
        let guard = match self.rules.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }

    fn publish(&self, rules: RuleSet) {
        let mut guard = match self.rules.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(rules);
    }

    /// Parse and compile a KDL policy document, appending its rules to the
    /// loaded set.
    pub fn load_str(&self, source: &str) -> Result<(), AuthzError> {
        let compiled = compile_rules(parse_kdl_document(source)?, &self.registry)?;
        let added = compiled.len();
        let mut next = RuleSet {
            rules: self.snapshot().rules.clone(),
        };
        next.rules.extend(compiled);
        tracing::info!(added, total = next.rules.len(), "loaded policy rules");
        self.publish(next);
        Ok(())
    }

    /// Load every `.kdl` file from a directory, in path order.
    pub fn load_path(&self, dir: &Path) -> Result<(), AuthzError> {
        let compiled = compile_rules(load_dir(dir)?, &self.registry)?;
        let added = compiled.len();
        let mut next = RuleSet {
            rules: self.snapshot().rules.clone(),
        };
        next.rules.extend(compiled);
        tracing::info!(
            added,
            total = next.rules.len(),
            dir = %dir.display(),
            "loaded policy rules"
        );
        self.publish(next);
        Ok(())
    }

    pub fn clear_rules(&self) {
        tracing::info!("cleared policy rules");
        self.publish(RuleSet::default());
    }

    /// Compile the filter selecting every `resource_type` row the actor may
    /// perform `action` on. This is the surface for query backends that
    /// translate filters natively (e.g. into SQL).
    pub fn filter_for(
        &self,
        actor: &Value,
        action: &str,
        resource_type: &str,
    ) -> Result<Filter, AuthzError> {
        if !self.registry.contains(resource_type) {
            return Err(AuthzError::UnknownType(resource_type.to_string()));
        }

        let rules = self.snapshot();
        let mut branches: Branches = Vec::new();
        for rule in rules.matching(actor, action, resource_type) {
            match &rule.condition {
                // Unconditional rule: one trivially true branch.
                None => branches.push(Vec::new()),
                Some(expr) => branches.extend(partial_eval(expr, actor, action)?),
            }
        }
        tracing::debug!(
            stage = "evaluated",
            resource_type,
            branches = branches.len()
        );

        let tree = extract(&branches, resource_type, &self.registry)?;
        tracing::debug!(stage = "extracted", resource_type);

        let filter = Filter::compile(&tree);
        tracing::debug!(stage = "compiled", resource_type, ?filter);
        Ok(filter)
    }

    /// Check one concrete resource instance by ordinary condition
    /// evaluation, no filter machinery. Evaluation errors propagate; a
    /// failed check is never reported as a plain `false`.
    pub fn is_allowed(
        &self,
        actor: &Value,
        action: &str,
        resource: &Value,
        resource_type: &str,
        backend: &dyn FetchBackend,
    ) -> Result<bool, AuthzError> {
        if !self.registry.contains(resource_type) {
            return Err(AuthzError::UnknownType(resource_type.to_string()));
        }
        let rules = self.snapshot();
        let eval = GroundEval {
            registry: &self.registry,
            backend,
            actor,
            action,
            resource,
            resource_type,
        };
        for rule in rules.matching(actor, action, resource_type) {
            match &rule.condition {
                None => return Ok(true),
                Some(expr) => {
                    if eval.eval_bool(expr)? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Every `resource_type` row the actor may perform `action` on.
    /// Relationship clauses are resolved eagerly; rows are fetched lazily,
    /// one grounded conjunct at a time, with duplicates suppressed.
    pub fn allowed_resources<'a>(
        &self,
        actor: &Value,
        action: &str,
        resource_type: &str,
        backend: &'a dyn FetchBackend,
    ) -> Result<AllowedResources<'a>, AuthzError> {
        let filter = self.filter_for(actor, action, resource_type)?;
        let conjuncts = filter.ground(backend)?;
        tracing::debug!(
            stage = "executing",
            resource_type,
            conjuncts = conjuncts.len()
        );
        Ok(AllowedResources {
            backend,
            type_name: resource_type.to_string(),
            conjuncts: conjuncts.into(),
            buffer: VecDeque::new(),
            seen: Vec::new(),
            failed: false,
        })
    }
}

// ─── Ground evaluation ──────────────────────────────────────────────────

/// A resolved operand: either one concrete value, or the candidate values a
/// resource path produced. Children hops fan out, so a path can stand for
/// several values at once; comparisons hold when any candidate pair does,
/// mirroring the existence clauses the filter compiler emits.
enum Resolved {
    Value(Value),
    Candidates(Vec<Value>),
}

impl Resolved {
    fn items(&self) -> &[Value] {
        match self {
            Resolved::Value(v) => std::slice::from_ref(v),
            Resolved::Candidates(vs) => vs,
        }
    }
}

struct GroundEval<'a> {
    registry: &'a TypeRegistry,
    backend: &'a dyn FetchBackend,
    actor: &'a Value,
    action: &'a str,
    resource: &'a Value,
    resource_type: &'a str,
}

impl GroundEval<'_> {
    fn eval_bool(&self, expr: &Expr) -> Result<bool, AuthzError> {
        match expr {
            Expr::Literal(Value::Bool(b)) => Ok(*b),
            Expr::Literal(_) | Expr::List(_) => Err(AuthzError::InvalidCondition(
                "condition must evaluate to a boolean".into(),
            )),
            // Bare boolean field, e.g. `resource.is_fooey`.
            Expr::Path(_) => Ok(self
                .eval_value(expr)?
                .items()
                .iter()
                .any(|v| *v == Value::Bool(true))),
            Expr::UnaryNot(inner) => Ok(!self.eval_bool(inner)?),
            Expr::In {
                element,
                collection,
            } => {
                let element = self.eval_value(element)?;
                let collection = self.eval_value(collection)?;
                self.contains(&collection, &element)
            }
            Expr::BinOp { op, left, right } => match op {
                BinOp::And => Ok(self.eval_bool(left)? && self.eval_bool(right)?),
                BinOp::Or => Ok(self.eval_bool(left)? || self.eval_bool(right)?),
                BinOp::Eq | BinOp::Ne => {
                    let l = self.eval_value(left)?;
                    let r = self.eval_value(right)?;
                    let test: fn(&Value, &Value) -> bool = match op {
                        BinOp::Eq => |a, b| values_equal(a, b),
                        _ => |a, b| !values_equal(a, b),
                    };
                    Ok(l.items()
                        .iter()
                        .any(|a| r.items().iter().any(|b| test(a, b))))
                }
                BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
                    let l = self.eval_value(left)?;
                    let r = self.eval_value(right)?;
                    self.compare_numeric(*op, &l, &r)
                }
            },
        }
    }

    fn eval_value(&self, expr: &Expr) -> Result<Resolved, AuthzError> {
        match expr {
            Expr::Literal(v) => Ok(Resolved::Value(v.clone())),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match self.eval_value(item)? {
                        Resolved::Value(v) => values.push(v),
                        Resolved::Candidates(_) => {
                            return Err(AuthzError::InvalidCondition(
                                "resource expression inside a list literal".into(),
                            ));
                        }
                    }
                }
                Ok(Resolved::Value(Value::Array(values)))
            }
            Expr::Path(segments) => match segments[0].as_str() {
                "resource" => Ok(Resolved::Candidates(self.resolve_resource(&segments[1..])?)),
                "action" if segments.len() == 1 => {
                    Ok(Resolved::Value(Value::String(self.action.to_string())))
                }
                "actor" => Ok(Resolved::Value(walk_json(self.actor, &segments[1..]))),
                _ => Ok(Resolved::Value(Value::Null)),
            },
            // Boolean-valued subexpression used as an operand.
            _ => Ok(Resolved::Value(Value::Bool(self.eval_bool(expr)?))),
        }
    }

    /// Walk a resource path, fanning out over relationship hops: a parent
    /// hop replaces each candidate with its related row(s), a children hop
    /// with every row referencing back. A path ending at a relationship
    /// field yields the related rows themselves.
    fn resolve_resource(&self, segments: &[String]) -> Result<Vec<Value>, AuthzError> {
        let mut candidates = vec![self.resource.clone()];
        let mut type_name = self.resource_type.to_string();
        for segment in segments {
            match self.registry.field(&type_name, segment) {
                Some(FieldType::Relation(rel)) => {
                    let mut next = Vec::new();
                    for candidate in &candidates {
                        let key = candidate.get(&rel.my_field).cloned().unwrap_or(Value::Null);
                        next.extend(self.backend.fetch(
                            &rel.other_type,
                            &[Constraint::new(&rel.other_field, ConstraintKind::Eq, key)],
                        )?);
                    }
                    type_name = rel.other_type.clone();
                    candidates = next;
                }
                Some(_) => {
                    // Primitive fields are final segments (checked at load).
                    candidates = candidates
                        .iter()
                        .map(|c| c.get(segment).cloned().unwrap_or(Value::Null))
                        .collect();
                }
                None => {
                    return Err(AuthzError::UnknownField {
                        type_name,
                        field: segment.clone(),
                    });
                }
            }
        }
        Ok(candidates)
    }

    fn contains(&self, collection: &Resolved, element: &Resolved) -> Result<bool, AuthzError> {
        let members = match collection {
            Resolved::Value(Value::Array(items)) => items.as_slice(),
            Resolved::Value(_) => {
                return Err(AuthzError::InvalidCondition(
                    "`in` requires a list or a resource collection on the right side".into(),
                ));
            }
            Resolved::Candidates(rows) => rows.as_slice(),
        };
        Ok(element
            .items()
            .iter()
            .any(|e| members.iter().any(|m| values_equal(m, e))))
    }

    fn compare_numeric(
        &self,
        op: BinOp,
        left: &Resolved,
        right: &Resolved,
    ) -> Result<bool, AuthzError> {
        for a in left.items() {
            for b in right.items() {
                let (Some(x), Some(y)) = (as_number(a), as_number(b)) else {
                    return Err(AuthzError::InvalidCondition(
                        "comparison operator requires numeric operands".into(),
                    ));
                };
                let holds = match op {
                    BinOp::Gt => x > y,
                    BinOp::Lt => x < y,
                    BinOp::Ge => x >= y,
                    BinOp::Le => x <= y,
                    _ => false,
                };
                if holds {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn walk_json(value: &Value, segments: &[String]) -> Value {
    let mut current = value;
    for segment in segments {
        current = current.get(segment).unwrap_or(&Value::Null);
    }
    current.clone()
}

/// Lazy, deduplicating stream of authorized rows. Fuses after the first
/// backend error.
pub struct AllowedResources<'a> {
    backend: &'a dyn FetchBackend,
    type_name: String,
    conjuncts: VecDeque<Vec<Constraint>>,
    buffer: VecDeque<Value>,
    seen: Vec<Value>,
    failed: bool,
}

impl Iterator for AllowedResources<'_> {
    type Item = Result<Value, AuthzError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Some(Ok(row));
            }
            let conjunct = self.conjuncts.pop_front()?;
            match self.backend.fetch(&self.type_name, &conjunct) {
                Ok(rows) => {
                    for row in rows {
                        if !self.seen.contains(&row) {
                            self.seen.push(row.clone());
                            self.buffer.push_back(row);
                        }
                    }
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::types::{FieldType, RegistryBuilder};
    use serde_json::json;

    fn engine() -> Engine {
        let registry = RegistryBuilder::new()
            .register(
                "Bar",
                vec![("id", FieldType::String), ("is_cool", FieldType::Boolean)],
            )
            .unwrap()
            .register(
                "Foo",
                vec![
                    ("id", FieldType::String),
                    ("bar_id", FieldType::String),
                    ("is_fooey", FieldType::Boolean),
                    ("bar", FieldType::parent("Bar", "bar_id", "id")),
                ],
            )
            .unwrap()
            .build()
            .unwrap();
        Engine::new(registry)
    }

    fn backend() -> MemoryBackend {
        let mut b = MemoryBackend::new();
        b.extend(
            "Bar",
            vec![
                json!({"id": "hello", "is_cool": true}),
                json!({"id": "goodbye", "is_cool": false}),
            ],
        );
        b.extend(
            "Foo",
            vec![
                json!({"id": "one", "bar_id": "hello", "is_fooey": true}),
                json!({"id": "two", "bar_id": "goodbye", "is_fooey": false}),
            ],
        );
        b
    }

    #[test]
    fn test_no_rules_denies() {
        let engine = engine();
        let backend = backend();
        let foo = json!({"id": "one", "bar_id": "hello", "is_fooey": true});
        assert!(!engine
            .is_allowed(&json!("steve"), "get", &foo, "Foo", &backend)
            .unwrap());
        assert_eq!(
            engine.filter_for(&json!("steve"), "get", "Foo").unwrap(),
            Filter::Never
        );
    }

    #[test]
    fn test_load_str_appends_and_clear_resets() {
        let engine = engine();
        engine
            .load_str(r#"rule "a" { resource "Foo"; condition "resource.is_fooey == true"; }"#)
            .unwrap();
        engine
            .load_str(r#"rule "b" { resource "Bar"; }"#)
            .unwrap();
        assert_eq!(engine.snapshot().rules.len(), 2);
        engine.clear_rules();
        assert_eq!(engine.snapshot().rules.len(), 0);
    }

    #[test]
    fn test_is_allowed_direct_field() {
        let engine = engine();
        engine
            .load_str(r#"rule "a" { resource "Foo"; condition "resource.is_fooey == true"; }"#)
            .unwrap();
        let backend = backend();
        let fooey = json!({"id": "one", "bar_id": "hello", "is_fooey": true});
        let plain = json!({"id": "two", "bar_id": "goodbye", "is_fooey": false});
        assert!(engine
            .is_allowed(&json!("x"), "get", &fooey, "Foo", &backend)
            .unwrap());
        assert!(!engine
            .is_allowed(&json!("x"), "get", &plain, "Foo", &backend)
            .unwrap());
    }

    #[test]
    fn test_is_allowed_relationship_hop() {
        let engine = engine();
        engine
            .load_str(r#"rule "a" { resource "Foo"; condition "resource.bar.is_cool == true"; }"#)
            .unwrap();
        let backend = backend();
        let cool = json!({"id": "one", "bar_id": "hello", "is_fooey": true});
        let uncool = json!({"id": "two", "bar_id": "goodbye", "is_fooey": false});
        assert!(engine
            .is_allowed(&json!("x"), "get", &cool, "Foo", &backend)
            .unwrap());
        assert!(!engine
            .is_allowed(&json!("x"), "get", &uncool, "Foo", &backend)
            .unwrap());
    }

    #[test]
    fn test_allowed_resources_streams_rows() {
        let engine = engine();
        engine
            .load_str(r#"rule "a" { resource "Foo"; condition "resource.bar.is_cool == true"; }"#)
            .unwrap();
        let backend = backend();
        let rows: Result<Vec<_>, _> = engine
            .allowed_resources(&json!("x"), "get", "Foo", &backend)
            .unwrap()
            .collect();
        let rows = rows.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "one");
    }

    #[test]
    fn test_unknown_resource_type_errors() {
        let engine = engine();
        let err = engine.filter_for(&json!("x"), "get", "Nope").unwrap_err();
        assert!(matches!(err, AuthzError::UnknownType(_)));
    }

    #[test]
    fn test_iterator_fuses_on_backend_error() {
        let engine = engine();
        // Rule for Foo, but the backend has no Foo collection.
        engine
            .load_str(r#"rule "a" { resource "Foo"; }"#)
            .unwrap();
        let backend = MemoryBackend::new();
        let mut iter = engine
            .allowed_resources(&json!("x"), "get", "Foo", &backend)
            .unwrap();
        assert!(matches!(iter.next(), Some(Err(AuthzError::Backend(_)))));
        assert!(iter.next().is_none());
    }
}
