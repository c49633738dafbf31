//! Partial evaluation of rule conditions.
//!
//! A condition is evaluated with `actor` and `action` bound to concrete
//! values and `resource` left symbolic. The result is the set of ways the
//! rule can still be satisfied, in disjunctive normal form: each branch is
//! a conjunction of atomic conditions on resource paths. Constructs that
//! cannot be represented as a finite constraint tree fail with
//! `UnsupportedConstruct` instead of approximating.

use serde_json::Value;

use crate::condition::{as_number, values_equal, BinOp, Expr};
use crate::errors::AuthzError;
use crate::types::ConstraintKind;

/// An atomic condition on a resource path, before registry resolution.
/// `path` is relative to the resource variable; multi-segment paths
/// traverse relationship fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub path: Vec<String>,
    pub kind: ConstraintKind,
    pub value: Value,
}

/// Disjunctive normal form: OR of branches, AND of atoms within a branch.
/// `vec![]` is unsatisfiable; `vec![vec![]]` is trivially true.
pub type Branches = Vec<Vec<Atom>>;

enum PartialValue {
    /// Fully evaluated to a concrete JSON value.
    Ground(Value),
    /// The value of `resource.<path>`, still symbolic.
    Path(Vec<String>),
    /// A boolean-valued symbolic expression.
    Cond(Branches),
}

/// Evaluate `expr` with the resource symbolic, returning the DNF branches
/// under which the rule grants access.
pub fn partial_eval(expr: &Expr, actor: &Value, action: &str) -> Result<Branches, AuthzError> {
    to_branches(eval(expr, actor, action)?)
}

fn eval(expr: &Expr, actor: &Value, action: &str) -> Result<PartialValue, AuthzError> {
    match expr {
        Expr::Literal(v) => Ok(PartialValue::Ground(v.clone())),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match eval(item, actor, action)? {
                    PartialValue::Ground(v) => values.push(v),
                    PartialValue::Path(p) => {
                        return Err(AuthzError::UnsupportedConstruct(format!(
                            "resource expression `resource.{}` inside a list literal",
                            p.join(".")
                        )));
                    }
                    PartialValue::Cond(_) => {
                        return Err(AuthzError::InvalidCondition(
                            "boolean expression inside a list literal".into(),
                        ));
                    }
                }
            }
            Ok(PartialValue::Ground(Value::Array(values)))
        }
        Expr::Path(segments) => Ok(eval_path(segments, actor, action)),
        Expr::UnaryNot(inner) => match eval(inner, actor, action)? {
            PartialValue::Ground(Value::Bool(b)) => Ok(PartialValue::Ground(Value::Bool(!b))),
            PartialValue::Ground(_) => Err(AuthzError::InvalidCondition(
                "`!` operator requires a boolean operand".into(),
            )),
            pv => Ok(PartialValue::Cond(negate_branches(to_branches(pv)?)?)),
        },
        Expr::In {
            element,
            collection,
        } => {
            let elem = eval(element, actor, action)?;
            let coll = eval(collection, actor, action)?;
            eval_in(elem, coll)
        }
        Expr::BinOp { op, left, right } => match op {
            BinOp::And => {
                let l = to_branches(eval(left, actor, action)?)?;
                if l.is_empty() {
                    // Ground-false conjunct; the branch can never match.
                    return Ok(PartialValue::Cond(Vec::new()));
                }
                let r = to_branches(eval(right, actor, action)?)?;
                Ok(PartialValue::Cond(and_branches(&l, &r)))
            }
            BinOp::Or => {
                let mut l = to_branches(eval(left, actor, action)?)?;
                let r = to_branches(eval(right, actor, action)?)?;
                l.extend(r);
                Ok(PartialValue::Cond(l))
            }
            BinOp::Eq => eval_comparison(
                eval(left, actor, action)?,
                eval(right, actor, action)?,
                ConstraintKind::Eq,
            ),
            BinOp::Ne => eval_comparison(
                eval(left, actor, action)?,
                eval(right, actor, action)?,
                ConstraintKind::Neq,
            ),
            BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
                let l = eval(left, actor, action)?;
                let r = eval(right, actor, action)?;
                eval_ordered(*op, l, r)
            }
        },
    }
}

fn eval_path(segments: &[String], actor: &Value, action: &str) -> PartialValue {
    match segments[0].as_str() {
        "resource" => PartialValue::Path(segments[1..].to_vec()),
        "action" if segments.len() == 1 => {
            PartialValue::Ground(Value::String(action.to_string()))
        }
        "actor" => PartialValue::Ground(walk_json(actor, &segments[1..])),
        _ => PartialValue::Ground(Value::Null),
    }
}

fn walk_json(value: &Value, segments: &[String]) -> Value {
    let mut current = value;
    for seg in segments {
        current = current.get(seg).unwrap_or(&Value::Null);
    }
    current.clone()
}

fn eval_comparison(
    left: PartialValue,
    right: PartialValue,
    kind: ConstraintKind,
) -> Result<PartialValue, AuthzError> {
    match (left, right) {
        (PartialValue::Ground(a), PartialValue::Ground(b)) => {
            let eq = values_equal(&a, &b);
            Ok(PartialValue::Ground(Value::Bool(match kind {
                ConstraintKind::Eq => eq,
                _ => !eq,
            })))
        }
        (PartialValue::Path(p), PartialValue::Ground(v))
        | (PartialValue::Ground(v), PartialValue::Path(p)) => {
            Ok(PartialValue::Cond(vec![vec![Atom {
                path: p,
                kind,
                value: v,
            }]]))
        }
        (PartialValue::Path(a), PartialValue::Path(b)) => {
            Err(AuthzError::UnsupportedConstruct(format!(
                "unification between two resource expressions (`resource.{}` and `resource.{}`)",
                a.join("."),
                b.join(".")
            )))
        }
        _ => Err(AuthzError::InvalidCondition(
            "cannot compare boolean expressions".into(),
        )),
    }
}

fn eval_ordered(
    op: BinOp,
    left: PartialValue,
    right: PartialValue,
) -> Result<PartialValue, AuthzError> {
    match (left, right) {
        (PartialValue::Ground(a), PartialValue::Ground(b)) => {
            let (Some(x), Some(y)) = (as_number(&a), as_number(&b)) else {
                return Err(AuthzError::InvalidCondition(
                    "comparison operator requires numeric operands".into(),
                ));
            };
            let result = match op {
                BinOp::Gt => x > y,
                BinOp::Lt => x < y,
                BinOp::Ge => x >= y,
                BinOp::Le => x <= y,
                _ => unreachable!(),
            };
            Ok(PartialValue::Ground(Value::Bool(result)))
        }
        _ => Err(AuthzError::UnsupportedConstruct(
            "ordered comparison on a resource field".into(),
        )),
    }
}

fn eval_in(element: PartialValue, collection: PartialValue) -> Result<PartialValue, AuthzError> {
    match (element, collection) {
        (PartialValue::Ground(e), PartialValue::Ground(Value::Array(items))) => Ok(
            PartialValue::Ground(Value::Bool(items.iter().any(|v| values_equal(v, &e)))),
        ),
        (PartialValue::Path(p), PartialValue::Ground(Value::Array(items))) => {
            Ok(PartialValue::Cond(vec![vec![Atom {
                path: p,
                kind: ConstraintKind::In,
                value: Value::Array(items),
            }]]))
        }
        (_, PartialValue::Ground(_)) => Err(AuthzError::InvalidCondition(
            "`in` requires a list or a resource collection on the right side".into(),
        )),
        // Membership of a concrete value in a resource collection compiles
        // to an existence condition on the related type.
        (PartialValue::Ground(e), PartialValue::Path(p)) => {
            Ok(PartialValue::Cond(vec![vec![Atom {
                path: p,
                kind: ConstraintKind::Eq,
                value: e,
            }]]))
        }
        (PartialValue::Path(a), PartialValue::Path(b)) => {
            Err(AuthzError::UnsupportedConstruct(format!(
                "membership between two resource expressions (`resource.{}` in `resource.{}`)",
                a.join("."),
                b.join(".")
            )))
        }
        _ => Err(AuthzError::InvalidCondition(
            "`in` operands must be values".into(),
        )),
    }
}

fn to_branches(pv: PartialValue) -> Result<Branches, AuthzError> {
    match pv {
        PartialValue::Cond(branches) => Ok(branches),
        PartialValue::Ground(Value::Bool(true)) => Ok(vec![vec![]]),
        PartialValue::Ground(Value::Bool(false)) => Ok(Vec::new()),
        PartialValue::Ground(_) => Err(AuthzError::InvalidCondition(
            "condition must evaluate to a boolean".into(),
        )),
        // Bare boolean resource field, e.g. `resource.is_fooey`.
        PartialValue::Path(p) => Ok(vec![vec![Atom {
            path: p,
            kind: ConstraintKind::Eq,
            value: Value::Bool(true),
        }]]),
    }
}

fn and_branches(left: &Branches, right: &Branches) -> Branches {
    let mut out = Vec::with_capacity(left.len() * right.len());
    for l in left {
        for r in right {
            let mut branch = l.clone();
            branch.extend(r.iter().cloned());
            out.push(branch);
        }
    }
    out
}

/// De Morgan over the DNF. Only sound for direct-field atoms: negating a
/// condition that traverses a relationship would flip an existence test
/// into a universal one, which the filter model cannot express.
fn negate_branches(branches: Branches) -> Result<Branches, AuthzError> {
    let mut acc: Branches = vec![vec![]];
    for branch in branches {
        let mut alternatives: Branches = Vec::with_capacity(branch.len());
        for atom in branch {
            alternatives.push(vec![negate_atom(atom)?]);
        }
        acc = and_branches(&acc, &alternatives);
    }
    Ok(acc)
}

fn negate_atom(atom: Atom) -> Result<Atom, AuthzError> {
    if atom.path.len() > 1 {
        return Err(AuthzError::UnsupportedConstruct(format!(
            "negation over a relationship traversal (`resource.{}`)",
            atom.path.join(".")
        )));
    }
    let kind = match atom.kind {
        ConstraintKind::Eq => ConstraintKind::Neq,
        ConstraintKind::Neq => ConstraintKind::Eq,
        ConstraintKind::In => ConstraintKind::Nin,
        ConstraintKind::Nin => ConstraintKind::In,
    };
    Ok(Atom { kind, ..atom })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::parse_condition;
    use serde_json::json;

    fn eval_str(cond: &str, actor: Value, action: &str) -> Result<Branches, AuthzError> {
        let expr = parse_condition(cond).unwrap();
        partial_eval(&expr, &actor, action)
    }

    fn atom(path: &[&str], kind: ConstraintKind, value: Value) -> Atom {
        Atom {
            path: path.iter().map(|s| s.to_string()).collect(),
            kind,
            value,
        }
    }

    #[test]
    fn test_simple_equality() {
        let branches = eval_str("resource.is_fooey == true", json!("steve"), "get").unwrap();
        assert_eq!(
            branches,
            vec![vec![atom(&["is_fooey"], ConstraintKind::Eq, json!(true))]]
        );
    }

    #[test]
    fn test_literal_on_left() {
        let branches = eval_str("true == resource.is_fooey", json!("steve"), "get").unwrap();
        assert_eq!(
            branches,
            vec![vec![atom(&["is_fooey"], ConstraintKind::Eq, json!(true))]]
        );
    }

    #[test]
    fn test_membership_in_list() {
        let branches =
            eval_str("resource.bar.is_cool in [true, false]", json!("steve"), "get").unwrap();
        assert_eq!(
            branches,
            vec![vec![atom(
                &["bar", "is_cool"],
                ConstraintKind::In,
                json!([true, false])
            )]]
        );
    }

    #[test]
    fn test_ground_membership_in_collection_path() {
        let branches = eval_str(
            "actor.name in resource.roles.user_name",
            json!({"name": "leina"}),
            "get",
        )
        .unwrap();
        assert_eq!(
            branches,
            vec![vec![atom(
                &["roles", "user_name"],
                ConstraintKind::Eq,
                json!("leina")
            )]]
        );
    }

    #[test]
    fn test_conjunction_crosses_disjunction() {
        let branches = eval_str(
            "(resource.a == 1 || resource.b == 2) && resource.c == 3",
            json!("x"),
            "get",
        )
        .unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].len(), 2);
        assert_eq!(branches[1][0], atom(&["b"], ConstraintKind::Eq, json!(2)));
        assert_eq!(branches[1][1], atom(&["c"], ConstraintKind::Eq, json!(3)));
    }

    #[test]
    fn test_ground_true_conjunct_disappears() {
        let branches = eval_str(
            r#"actor.name == "steve" && resource.is_fooey == true"#,
            json!({"name": "steve"}),
            "get",
        )
        .unwrap();
        assert_eq!(
            branches,
            vec![vec![atom(&["is_fooey"], ConstraintKind::Eq, json!(true))]]
        );
    }

    #[test]
    fn test_ground_false_conjunct_drops_branch() {
        let branches = eval_str(
            r#"actor.name == "steve" && resource.is_fooey == true"#,
            json!({"name": "leina"}),
            "get",
        )
        .unwrap();
        assert!(branches.is_empty());
    }

    #[test]
    fn test_ground_false_short_circuits_unsupported() {
        // The right-hand side is unsupported, but the ground-false left
        // conjunct already decides the branch.
        let branches = eval_str(
            r#"actor.name == "steve" && resource.size > 3"#,
            json!({"name": "leina"}),
            "get",
        )
        .unwrap();
        assert!(branches.is_empty());
    }

    #[test]
    fn test_action_binding() {
        let branches = eval_str(
            r#"action == "get" && resource.x == 1"#,
            json!("steve"),
            "get",
        )
        .unwrap();
        assert_eq!(branches.len(), 1);
        let none = eval_str(
            r#"action == "get" && resource.x == 1"#,
            json!("steve"),
            "delete",
        )
        .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_bare_boolean_field() {
        let branches = eval_str("resource.is_fooey", json!("x"), "get").unwrap();
        assert_eq!(
            branches,
            vec![vec![atom(&["is_fooey"], ConstraintKind::Eq, json!(true))]]
        );
    }

    #[test]
    fn test_negated_equality_becomes_neq() {
        let branches = eval_str("!(resource.x == 1)", json!("a"), "get").unwrap();
        assert_eq!(
            branches,
            vec![vec![atom(&["x"], ConstraintKind::Neq, json!(1))]]
        );
    }

    #[test]
    fn test_negated_membership_becomes_nin() {
        let branches = eval_str("!(resource.x in [1, 2])", json!("a"), "get").unwrap();
        assert_eq!(
            branches,
            vec![vec![atom(&["x"], ConstraintKind::Nin, json!([1, 2]))]]
        );
    }

    #[test]
    fn test_negated_conjunction_distributes() {
        let branches =
            eval_str("!(resource.a == 1 && resource.b == 2)", json!("x"), "get").unwrap();
        assert_eq!(
            branches,
            vec![
                vec![atom(&["a"], ConstraintKind::Neq, json!(1))],
                vec![atom(&["b"], ConstraintKind::Neq, json!(2))],
            ]
        );
    }

    #[test]
    fn test_negation_over_traversal_unsupported() {
        let err = eval_str("!(resource.bar.is_cool == true)", json!("a"), "get").unwrap_err();
        assert!(matches!(err, AuthzError::UnsupportedConstruct(_)));
    }

    #[test]
    fn test_ordered_comparison_on_resource_unsupported() {
        let err = eval_str("resource.size > 3", json!("a"), "get").unwrap_err();
        assert!(matches!(err, AuthzError::UnsupportedConstruct(_)));
    }

    #[test]
    fn test_unification_between_partials_unsupported() {
        let err = eval_str("resource.a == resource.b", json!("x"), "get").unwrap_err();
        assert!(matches!(err, AuthzError::UnsupportedConstruct(_)));
    }

    #[test]
    fn test_resource_path_in_list_unsupported() {
        let err = eval_str("resource.a in [resource.b, 1]", json!("x"), "get").unwrap_err();
        assert!(matches!(err, AuthzError::UnsupportedConstruct(_)));
    }

    #[test]
    fn test_ordered_comparison_on_ground_values() {
        let branches = eval_str(
            "actor.age >= 18 && resource.x == 1",
            json!({"age": 21}),
            "get",
        )
        .unwrap();
        assert_eq!(branches.len(), 1);
    }
}
