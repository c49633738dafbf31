//! Resolution of DNF branches against the type registry.
//!
//! The partial evaluator produces atoms on raw paths; this module resolves
//! each path through the registered relationship graph and produces a
//! [`ConstraintTree`]: equality tests on the resource's own columns plus
//! correlated existence tests on related types.

use serde_json::Value;

use crate::errors::AuthzError;
use crate::partial::{Atom, Branches};
use crate::types::{Constraint, ConstraintKind, RelationKind, Relationship, TypeRegistry};

/// Hard bound on relationship hops within a single condition. Deep chains
/// almost always indicate a policy mistake, and the bound keeps grounding
/// costs predictable.
pub const MAX_RELATION_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintTree {
    /// Matches every row of the type.
    Always,
    /// A test on one of the type's own columns.
    Leaf(Constraint),
    All(Vec<ConstraintTree>),
    Any(Vec<ConstraintTree>),
    /// There exists a row of `type_name` whose `other_field` equals this
    /// row's `my_field` and which satisfies `tree`.
    Related {
        type_name: String,
        my_field: String,
        other_field: String,
        tree: Box<ConstraintTree>,
    },
}

/// Resolve DNF branches into a constraint tree for `resource_type`. The
/// result is an `Any` over one subtree per branch.
pub fn extract(
    branches: &Branches,
    resource_type: &str,
    registry: &TypeRegistry,
) -> Result<ConstraintTree, AuthzError> {
    let mut disjuncts = Vec::with_capacity(branches.len());
    for branch in branches {
        disjuncts.push(branch_tree(branch, resource_type, registry, 0)?);
    }
    Ok(ConstraintTree::Any(disjuncts))
}

/// Build the conjunction tree for one branch. Atoms on a shared parent edge
/// are merged into one `Related` node, because a parent edge selects a
/// single row and the atoms constrain that same row. Atoms on a children
/// edge stay independent: each describes its own related row.
fn branch_tree(
    atoms: &[Atom],
    type_name: &str,
    registry: &TypeRegistry,
    depth: usize,
) -> Result<ConstraintTree, AuthzError> {
    if depth > MAX_RELATION_DEPTH {
        return Err(AuthzError::RelationDepthExceeded {
            depth: MAX_RELATION_DEPTH,
        });
    }

    let mut parts: Vec<ConstraintTree> = Vec::new();
    let mut parent_groups: Vec<(Relationship, Vec<Atom>)> = Vec::new();

    for atom in atoms {
        if atom.path.is_empty() {
            return Err(AuthzError::Evaluation(
                "bare `resource` cannot be constrained".into(),
            ));
        }
        let field = &atom.path[0];
        let rel = match registry.field(type_name, field) {
            None => {
                return Err(AuthzError::UnknownField {
                    type_name: type_name.to_string(),
                    field: field.clone(),
                });
            }
            Some(ty) => ty.as_relation(),
        };

        match rel {
            None if atom.path.len() == 1 => {
                parts.push(ConstraintTree::Leaf(Constraint::new(
                    field,
                    atom.kind,
                    atom.value.clone(),
                )));
            }
            None => {
                return Err(AuthzError::Evaluation(format!(
                    "field `{field}` on type `{type_name}` is not a relationship"
                )));
            }
            Some(rel) if atom.path.len() == 1 => {
                // Whole-row comparison against a concrete instance.
                parts.push(instance_node(atom, rel, depth)?);
            }
            Some(rel) => {
                let tail = Atom {
                    path: atom.path[1..].to_vec(),
                    kind: atom.kind,
                    value: atom.value.clone(),
                };
                match rel.kind {
                    RelationKind::Parent => {
                        match parent_groups.iter_mut().find(|(r, _)| r == rel) {
                            Some((_, tails)) => tails.push(tail),
                            None => parent_groups.push((rel.clone(), vec![tail])),
                        }
                    }
                    RelationKind::Children => {
                        let inner =
                            branch_tree(&[tail], &rel.other_type, registry, depth + 1)?;
                        parts.push(related_node(rel, inner));
                    }
                }
            }
        }
    }

    for (rel, tails) in parent_groups {
        let inner = branch_tree(&tails, &rel.other_type, registry, depth + 1)?;
        parts.push(related_node(&rel, inner));
    }

    Ok(conjoin(parts))
}

/// A comparison whose path terminates at a relationship field, e.g.
/// `resource.bar == <row>` or `<row> in resource.tags`. Only equality
/// against a concrete object is expressible; the object's attributes become
/// per-column constraints on the related type.
fn instance_node(
    atom: &Atom,
    rel: &Relationship,
    depth: usize,
) -> Result<ConstraintTree, AuthzError> {
    if depth + 1 > MAX_RELATION_DEPTH {
        return Err(AuthzError::RelationDepthExceeded {
            depth: MAX_RELATION_DEPTH,
        });
    }
    if atom.kind != ConstraintKind::Eq {
        return Err(AuthzError::UnsupportedConstruct(format!(
            "non-equality comparison on relationship field `{}`",
            atom.path.join(".")
        )));
    }
    let Value::Object(attrs) = &atom.value else {
        return Err(AuthzError::UnsupportedConstruct(format!(
            "relationship field `{}` compared against a non-object value",
            atom.path.join(".")
        )));
    };
    let leaves = attrs
        .iter()
        .map(|(k, v)| ConstraintTree::Leaf(Constraint::new(k, ConstraintKind::Eq, v.clone())))
        .collect();
    Ok(related_node(rel, conjoin(leaves)))
}

fn related_node(rel: &Relationship, inner: ConstraintTree) -> ConstraintTree {
    ConstraintTree::Related {
        type_name: rel.other_type.clone(),
        my_field: rel.my_field.clone(),
        other_field: rel.other_field.clone(),
        tree: Box::new(inner),
    }
}

fn conjoin(mut parts: Vec<ConstraintTree>) -> ConstraintTree {
    match parts.len() {
        0 => ConstraintTree::Always,
        1 => parts.remove(0),
        _ => ConstraintTree::All(parts),
    }
}
