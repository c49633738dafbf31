//! The compiled filter handed to data backends.
//!
//! A [`Filter`] is the simplified form of a constraint tree: trivially
//! true/false subtrees are folded away so backends never see vacuous
//! clauses. Backends that can only fetch by flat constraint lists use
//! [`Filter::ground`], which resolves every existence clause into an `In`
//! constraint over concrete correlation keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::FetchBackend;
use crate::condition::values_equal;
use crate::constraint::ConstraintTree;
use crate::errors::AuthzError;
use crate::types::{Constraint, ConstraintKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Every row of the type matches.
    Always,
    /// No row matches. A backend receiving this fetches nothing.
    Never,
    /// A test on one of the type's own columns.
    Field(Constraint),
    All(Vec<Filter>),
    Any(Vec<Filter>),
    /// A correlated existence test: some row of `type_name` has
    /// `other_field` equal to this row's `my_field` and matches `inner`.
    Exists {
        type_name: String,
        my_field: String,
        other_field: String,
        inner: Box<Filter>,
    },
}

impl Filter {
    /// Simplify a constraint tree into a filter. `In` over an empty list
    /// can never match and `Nin` over an empty list always does; folding
    /// those first lets whole branches collapse.
    pub fn compile(tree: &ConstraintTree) -> Filter {
        match tree {
            ConstraintTree::Always => Filter::Always,
            ConstraintTree::Leaf(c) => compile_leaf(c),
            ConstraintTree::All(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                for part in parts {
                    match Filter::compile(part) {
                        Filter::Never => return Filter::Never,
                        Filter::Always => {}
                        f => out.push(f),
                    }
                }
                match out.len() {
                    0 => Filter::Always,
                    1 => out.remove(0),
                    _ => Filter::All(out),
                }
            }
            ConstraintTree::Any(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                for part in parts {
                    match Filter::compile(part) {
                        Filter::Always => return Filter::Always,
                        Filter::Never => {}
                        f => out.push(f),
                    }
                }
                match out.len() {
                    0 => Filter::Never,
                    1 => out.remove(0),
                    _ => Filter::Any(out),
                }
            }
            ConstraintTree::Related {
                type_name,
                my_field,
                other_field,
                tree,
            } => match Filter::compile(tree) {
                Filter::Never => Filter::Never,
                inner => Filter::Exists {
                    type_name: type_name.clone(),
                    my_field: my_field.clone(),
                    other_field: other_field.clone(),
                    inner: Box::new(inner),
                },
            },
        }
    }

    /// The independently satisfiable alternatives of this filter. A
    /// top-level `Any` splits; everything else is a single alternative.
    pub fn disjuncts(&self) -> Vec<Filter> {
        match self {
            Filter::Any(parts) => parts.clone(),
            other => vec![other.clone()],
        }
    }

    /// Flatten the filter into a DNF of plain column constraints, resolving
    /// every `Exists` clause by fetching the related rows through `backend`
    /// and substituting their correlation keys. The result is a union of
    /// constraint lists; a row matches when any list matches it entirely.
    pub fn ground<B: FetchBackend + ?Sized>(
        &self,
        backend: &B,
    ) -> Result<Vec<Vec<Constraint>>, AuthzError> {
        match self {
            Filter::Always => Ok(vec![vec![]]),
            Filter::Never => Ok(Vec::new()),
            Filter::Field(c) => Ok(vec![vec![c.clone()]]),
            Filter::All(parts) => {
                let mut acc: Vec<Vec<Constraint>> = vec![vec![]];
                for part in parts {
                    let grounded = part.ground(backend)?;
                    let mut next = Vec::with_capacity(acc.len() * grounded.len());
                    for left in &acc {
                        for right in &grounded {
                            let mut conjunct = left.clone();
                            conjunct.extend(right.iter().cloned());
                            next.push(conjunct);
                        }
                    }
                    acc = next;
                }
                Ok(acc)
            }
            Filter::Any(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    out.extend(part.ground(backend)?);
                }
                Ok(out)
            }
            Filter::Exists {
                type_name,
                my_field,
                other_field,
                inner,
            } => {
                let keys = self.exists_keys(type_name, other_field, inner, backend)?;
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![vec![Constraint::new(
                    my_field,
                    ConstraintKind::In,
                    Value::Array(keys),
                )]])
            }
        }
    }

    /// Fetch the rows an `Exists` clause refers to and project their
    /// correlation keys, deduplicated.
    fn exists_keys<B: FetchBackend + ?Sized>(
        &self,
        type_name: &str,
        other_field: &str,
        inner: &Filter,
        backend: &B,
    ) -> Result<Vec<Value>, AuthzError> {
        let mut rows: Vec<Value> = Vec::new();
        for conjunct in inner.ground(backend)? {
            for row in backend.fetch(type_name, &conjunct)? {
                if !rows.contains(&row) {
                    rows.push(row);
                }
            }
        }
        let mut keys: Vec<Value> = Vec::new();
        for row in &rows {
            let key = row.get(other_field).unwrap_or(&Value::Null);
            if !keys.iter().any(|k| values_equal(k, key)) {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }
}

fn compile_leaf(c: &Constraint) -> Filter {
    let empty = c.value.as_array().is_some_and(|a| a.is_empty());
    match c.kind {
        ConstraintKind::In if empty => Filter::Never,
        ConstraintKind::Nin if empty => Filter::Always,
        _ => Filter::Field(c.clone()),
    }
}
