use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::values_equal;
use crate::errors::AuthzError;

/// Cardinality of a relationship edge. `Parent` points at a single related
/// row; `Children` points at the rows of the other type referencing back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    Parent,
    Children,
}

/// A declared foreign-key-style link between two registered types.
/// `my_field` lives on the owning type, `other_field` on `other_type`;
/// a related row is one where `other_field` equals the owner's `my_field`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationKind,
    pub other_type: String,
    pub my_field: String,
    pub other_field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Relation(Relationship),
}

impl FieldType {
    /// Shorthand for a parent relationship field.
    pub fn parent(other_type: &str, my_field: &str, other_field: &str) -> Self {
        FieldType::Relation(Relationship {
            kind: RelationKind::Parent,
            other_type: other_type.to_string(),
            my_field: my_field.to_string(),
            other_field: other_field.to_string(),
        })
    }

    /// Shorthand for a children relationship field.
    pub fn children(other_type: &str, my_field: &str, other_field: &str) -> Self {
        FieldType::Relation(Relationship {
            kind: RelationKind::Children,
            other_type: other_type.to_string(),
            my_field: my_field.to_string(),
            other_field: other_field.to_string(),
        })
    }

    pub fn as_relation(&self) -> Option<&Relationship> {
        match self {
            FieldType::Relation(rel) => Some(rel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub fields: BTreeMap<String, FieldType>,
}

/// Collects type definitions before cross-type validation. Relationship
/// edges may reference types registered later (or the owning type itself),
/// so cyclic graphs like Org → Repo → Issue with back-references register
/// cleanly; all edges are checked in [`RegistryBuilder::build`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: BTreeMap<String, TypeDef>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        name: &str,
        fields: Vec<(&str, FieldType)>,
    ) -> Result<Self, AuthzError> {
        if self.types.contains_key(name) {
            return Err(AuthzError::DuplicateType(name.to_string()));
        }
        let fields = fields
            .into_iter()
            .map(|(f, ty)| (f.to_string(), ty))
            .collect();
        self.types.insert(
            name.to_string(),
            TypeDef {
                name: name.to_string(),
                fields,
            },
        );
        Ok(self)
    }

    /// Validate every relationship edge and close the registry. Fails if an
    /// edge references an unregistered type, or if either correlation field
    /// is missing or is itself a relationship.
    pub fn build(self) -> Result<TypeRegistry, AuthzError> {
        for def in self.types.values() {
            for (field, ty) in &def.fields {
                let Some(rel) = ty.as_relation() else {
                    continue;
                };
                let other = self
                    .types
                    .get(&rel.other_type)
                    .ok_or_else(|| AuthzError::UnknownType(rel.other_type.clone()))?;
                check_correlation_field(def, &rel.my_field, field)?;
                check_correlation_field(other, &rel.other_field, field)?;
            }
        }
        Ok(TypeRegistry { types: self.types })
    }
}

fn check_correlation_field(def: &TypeDef, field: &str, edge: &str) -> Result<(), AuthzError> {
    match def.fields.get(field) {
        None => Err(AuthzError::UnknownField {
            type_name: def.name.clone(),
            field: field.to_string(),
        }),
        Some(FieldType::Relation(_)) => Err(AuthzError::InvalidRelationship(format!(
            "correlation field `{field}` of edge `{edge}` on `{}` is itself a relationship",
            def.name
        ))),
        Some(_) => Ok(()),
    }
}

/// Immutable, name-indexed description of every resource type's fields and
/// relationships. Looked up by type name rather than by reference, so
/// mutually referencing type graphs never form ownership cycles.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeDef>,
}

impl TypeRegistry {
    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldType> {
        self.types.get(type_name).and_then(|d| d.fields.get(field))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }
}

// ─── Constraints ────────────────────────────────────────────────────────

/// Wire shape consumed by backend adapters: `{field, kind, value}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Eq,
    Neq,
    In,
    Nin,
}

/// An atomic condition on a single field of a single type. For `In`/`Nin`
/// the value is a JSON array of candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub field: String,
    pub kind: ConstraintKind,
    pub value: Value,
}

impl Constraint {
    pub fn new(field: &str, kind: ConstraintKind, value: Value) -> Self {
        Self {
            field: field.to_string(),
            kind,
            value,
        }
    }

    /// Attribute-lookup matching used by in-memory adapters. `Eq` fails a
    /// row on mismatch; `In` fails a row when the attribute is absent from
    /// the candidate set.
    pub fn matches(&self, instance: &Value) -> bool {
        let attr = instance.get(&self.field).unwrap_or(&Value::Null);
        match self.kind {
            ConstraintKind::Eq => values_equal(attr, &self.value),
            ConstraintKind::Neq => !values_equal(attr, &self.value),
            ConstraintKind::In => self
                .value
                .as_array()
                .is_some_and(|set| set.iter().any(|v| values_equal(attr, v))),
            ConstraintKind::Nin => !self
                .value
                .as_array()
                .is_some_and(|set| set.iter().any(|v| values_equal(attr, v))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn foo_bar_registry() -> Result<TypeRegistry, AuthzError> {
        RegistryBuilder::new()
            .register(
                "Bar",
                vec![("id", FieldType::String), ("is_cool", FieldType::Boolean)],
            )?
            .register(
                "Foo",
                vec![
                    ("id", FieldType::String),
                    ("bar_id", FieldType::String),
                    ("is_fooey", FieldType::Boolean),
                    ("bar", FieldType::parent("Bar", "bar_id", "id")),
                ],
            )?
            .build()
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = foo_bar_registry().unwrap();
        assert!(reg.contains("Foo"));
        assert_eq!(reg.field("Foo", "is_fooey"), Some(&FieldType::Boolean));
        let rel = reg.field("Foo", "bar").unwrap().as_relation().unwrap();
        assert_eq!(rel.other_type, "Bar");
        assert_eq!(rel.kind, RelationKind::Parent);
        assert!(reg.field("Foo", "nope").is_none());
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let err = RegistryBuilder::new()
            .register("Foo", vec![("id", FieldType::String)])
            .unwrap()
            .register("Foo", vec![("id", FieldType::String)])
            .unwrap_err();
        assert!(matches!(err, AuthzError::DuplicateType(_)));
    }

    #[test]
    fn test_unregistered_other_type_rejected() {
        let err = RegistryBuilder::new()
            .register(
                "Foo",
                vec![
                    ("bar_id", FieldType::String),
                    ("bar", FieldType::parent("Bar", "bar_id", "id")),
                ],
            )
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, AuthzError::UnknownType(t) if t == "Bar"));
    }

    #[test]
    fn test_missing_correlation_field_rejected() {
        let err = RegistryBuilder::new()
            .register("Bar", vec![("id", FieldType::String)])
            .unwrap()
            .register(
                "Foo",
                vec![("bar", FieldType::parent("Bar", "bar_id", "id"))],
            )
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            AuthzError::UnknownField { type_name, field } if type_name == "Foo" && field == "bar_id"
        ));
    }

    #[test]
    fn test_cyclic_type_graph_registers() {
        // Org → Repo → Issue with a children edge back from Org to Repo.
        let reg = RegistryBuilder::new()
            .register(
                "Org",
                vec![
                    ("name", FieldType::String),
                    ("repos", FieldType::children("Repo", "name", "org_name")),
                ],
            )
            .unwrap()
            .register(
                "Repo",
                vec![
                    ("name", FieldType::String),
                    ("org_name", FieldType::String),
                    ("org", FieldType::parent("Org", "org_name", "name")),
                ],
            )
            .unwrap()
            .register(
                "Issue",
                vec![
                    ("name", FieldType::String),
                    ("repo_name", FieldType::String),
                    ("repo", FieldType::parent("Repo", "repo_name", "name")),
                ],
            )
            .unwrap()
            .build()
            .unwrap();
        assert!(reg.contains("Org"));
        assert!(reg.field("Org", "repos").unwrap().as_relation().is_some());
    }

    #[test]
    fn test_constraint_matching() {
        let row = json!({"id": "a", "n": 3, "flag": true});
        assert!(Constraint::new("flag", ConstraintKind::Eq, json!(true)).matches(&row));
        assert!(!Constraint::new("flag", ConstraintKind::Eq, json!(false)).matches(&row));
        assert!(Constraint::new("n", ConstraintKind::Eq, json!(3.0)).matches(&row));
        assert!(Constraint::new("n", ConstraintKind::In, json!([1, 2, 3])).matches(&row));
        assert!(!Constraint::new("n", ConstraintKind::In, json!([])).matches(&row));
        assert!(Constraint::new("n", ConstraintKind::Nin, json!([4])).matches(&row));
        assert!(Constraint::new("missing", ConstraintKind::Neq, json!("x")).matches(&row));
    }

    #[test]
    fn test_constraint_wire_shape() {
        let c = Constraint::new("is_fooey", ConstraintKind::Eq, json!(true));
        let wire = serde_json::to_value(&c).unwrap();
        assert_eq!(
            wire,
            json!({"field": "is_fooey", "kind": "Eq", "value": true})
        );
        let back: Constraint = serde_json::from_value(wire).unwrap();
        assert_eq!(back, c);
    }
}
