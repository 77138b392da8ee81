//! # Tessera DB Model
//!
//! Statement data model for Tessera.
//!
//! This crate provides:
//! - Value types: `Iri`, `BlankNode`, `Resource`, `Literal`, `Value`
//! - `Statement` - an immutable (subject, predicate, object, context) quad
//! - `StatementPattern` and `ContextFilter` for wildcard matching
//! - `StagingModel` / `ModelFactory` - pluggable in-memory statement
//!   collections used to stage uncommitted changes
//! - `ValueFactory` - convenience constructor for values and statements
//!
//! ## Design Principles
//!
//! 1. **Immutable values**: all value types are cheap to clone (`Arc<str>`
//!    backed) and compare structurally
//! 2. **Strict total ordering**: statements order by (subject, predicate,
//!    object, context) so staging models can stay sorted
//! 3. **No global registries**: staging model implementations are supplied
//!    through an explicit `ModelFactory` object

pub mod model;
pub mod namespace;
pub mod pattern;
pub mod statement;
pub mod value;

pub use model::{ModelFactory, StagingModel, TreeModel, TreeModelFactory};
pub use namespace::Namespace;
pub use pattern::{ContextFilter, StatementPattern};
pub use statement::Statement;
pub use value::{BlankNode, Iri, Literal, Resource, Value, ValueFactory, XSD_STRING};
