//! Data access traits and the in-memory reference backend.

use std::collections::HashMap;

use serde_json::Value;

use crate::condition::values_equal;
use crate::errors::AuthzError;
use crate::filter::Filter;
use crate::types::Constraint;

/// Fetches rows of a named type matching a flat conjunction of column
/// constraints. This is the minimal surface an adapter must provide; the
/// engine grounds relationship clauses into constraint lists before calling
/// it, so an adapter never sees a join.
pub trait FetchBackend {
    fn fetch(&self, type_name: &str, constraints: &[Constraint]) -> Result<Vec<Value>, AuthzError>;
}

/// Backends that can evaluate a whole [`Filter`], including `Exists`
/// clauses, natively. A SQL adapter would translate `Exists` into a
/// correlated subquery instead of round-tripping keys through the engine.
pub trait QueryBackend: FetchBackend {
    fn apply(&self, type_name: &str, filter: &Filter) -> Result<Vec<Value>, AuthzError>;
}

/// Rows held as JSON objects, keyed by type name. Used by the tests and as
/// the model implementation adapters are checked against.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    collections: HashMap<String, Vec<Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, type_name: &str, row: Value) {
        self.collections
            .entry(type_name.to_string())
            .or_default()
            .push(row);
    }

    pub fn extend(&mut self, type_name: &str, rows: Vec<Value>) {
        self.collections
            .entry(type_name.to_string())
            .or_default()
            .extend(rows);
    }

    fn rows(&self, type_name: &str) -> Result<&[Value], AuthzError> {
        self.collections
            .get(type_name)
            .map(|v| v.as_slice())
            .ok_or_else(|| AuthzError::Backend(format!("no collection for type `{type_name}`")))
    }

    fn row_matches(&self, row: &Value, filter: &Filter) -> Result<bool, AuthzError> {
        match filter {
            Filter::Always => Ok(true),
            Filter::Never => Ok(false),
            Filter::Field(c) => Ok(c.matches(row)),
            Filter::All(parts) => {
                for part in parts {
                    if !self.row_matches(row, part)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Any(parts) => {
                for part in parts {
                    if self.row_matches(row, part)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Exists {
                type_name,
                my_field,
                other_field,
                inner,
            } => {
                let key = row.get(my_field).unwrap_or(&Value::Null);
                for related in self.rows(type_name)? {
                    let other = related.get(other_field).unwrap_or(&Value::Null);
                    if values_equal(other, key) && self.row_matches(related, inner)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

impl FetchBackend for MemoryBackend {
    fn fetch(&self, type_name: &str, constraints: &[Constraint]) -> Result<Vec<Value>, AuthzError> {
        Ok(self
            .rows(type_name)?
            .iter()
            .filter(|row| constraints.iter().all(|c| c.matches(row)))
            .cloned()
            .collect())
    }
}

impl QueryBackend for MemoryBackend {
    fn apply(&self, type_name: &str, filter: &Filter) -> Result<Vec<Value>, AuthzError> {
        let mut out = Vec::new();
        for row in self.rows(type_name)? {
            if self.row_matches(row, filter)? {
                out.push(row.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConstraintKind;
    use serde_json::json;

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
                json!({"id": "two", "bar_id": "goodbye", "is_fooey": true}),
                json!({"id": "three", "bar_id": "hello", "is_fooey": false}),
            ],
        );
        b
    }

    #[test]
    fn test_fetch_filters_rows() {
        let b = backend();
        let rows = b
            .fetch(
                "Foo",
                &[Constraint::new("is_fooey", ConstraintKind::Eq, json!(true))],
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_fetch_unknown_collection_errors() {
        let err = backend().fetch("Nope", &[]).unwrap_err();
        assert!(matches!(err, AuthzError::Backend(_)));
    }

    #[test]
    fn test_apply_resolves_exists_by_correlation() {
        let b = backend();
        let filter = Filter::Exists {
            type_name: "Bar".into(),
            my_field: "bar_id".into(),
            other_field: "id".into(),
            inner: Box::new(Filter::Field(Constraint::new(
                "is_cool",
                ConstraintKind::Eq,
                json!(true),
            ))),
        };
        let rows = b.apply("Foo", &filter).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["one", "three"]);
    }

    #[test]
    fn test_apply_agrees_with_grounded_fetch() {
        let b = backend();
        let filter = Filter::Exists {
            type_name: "Bar".into(),
            my_field: "bar_id".into(),
            other_field: "id".into(),
            inner: Box::new(Filter::Field(Constraint::new(
                "is_cool",
                ConstraintKind::Eq,
                json!(true),
            ))),
        };
        let applied = b.apply("Foo", &filter).unwrap();
        let mut fetched = Vec::new();
        for conjunct in filter.ground(&b).unwrap() {
            for row in b.fetch("Foo", &conjunct).unwrap() {
                if !fetched.contains(&row) {
                    fetched.push(row);
                }
            }
        }
        assert_eq!(applied, fetched);
    }
}
