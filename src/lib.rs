//! Policy-based authorization with data filtering.
//!
//! Policies are KDL documents whose rules name an actor set, an action set,
//! a registered resource type and an optional condition expression. The
//! engine answers two questions from the same rules:
//!
//! * [`Engine::is_allowed`]: may this actor perform this action on this
//!   resource instance?
//! * [`Engine::allowed_resources`]: which rows of this type may the actor
//!   act on? The condition is partially evaluated with the resource left
//!   symbolic and compiled into a [`Filter`] the data layer can execute,
//!   so the rows are selected at the source instead of fetched and sieved.
//!
//! ```
//! use aperture::{Engine, FieldType, MemoryBackend, RegistryBuilder};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), aperture::AuthzError> {
//! let registry = RegistryBuilder::new()
//!     .register("Bar", vec![
//!         ("id", FieldType::String),
//!         ("is_cool", FieldType::Boolean),
//!     ])?
//!     .register("Foo", vec![
//!         ("id", FieldType::String),
//!         ("bar_id", FieldType::String),
//!         ("bar", FieldType::parent("Bar", "bar_id", "id")),
//!     ])?
//!     .build()?;
//!
//! let engine = Engine::new(registry);
//! engine.load_str(r#"
//!     rule "cool-bars-only" {
//!         actions {
//!             - "get"
//!         }
//!         resource "Foo"
//!         condition "resource.bar.is_cool == true"
//!     }
//! "#)?;
//!
//! let mut backend = MemoryBackend::new();
//! backend.insert("Bar", json!({"id": "hello", "is_cool": true}));
//! backend.insert("Foo", json!({"id": "one", "bar_id": "hello"}));
//!
//! let rows: Result<Vec<_>, _> = engine
//!     .allowed_resources(&json!("steve"), "get", "Foo", &backend)?
//!     .collect();
//! assert_eq!(rows?.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod condition;
pub mod constraint;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod loader;
pub mod partial;
pub mod policy;
pub mod types;

pub use backend::{FetchBackend, MemoryBackend, QueryBackend};
pub use constraint::{ConstraintTree, MAX_RELATION_DEPTH};
pub use engine::{AllowedResources, Engine};
pub use errors::AuthzError;
pub use filter::Filter;
pub use types::{
    Constraint, ConstraintKind, FieldType, RegistryBuilder, RelationKind, Relationship,
    TypeRegistry,
};
