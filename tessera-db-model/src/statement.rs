//! Statement - the fundamental data unit
//!
//! A `Statement` is an immutable (subject, predicate, object, context) quad.
//! `context` is the named graph; `None` is the default (unnamed) graph.
//!
//! ## Ordering
//!
//! Statements order by (subject, predicate, object, context), which keeps
//! tree-backed staging models sorted by subject first.

use crate::value::{Iri, Resource, Value};
use std::fmt;

/// An immutable RDF statement
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Statement {
    subject: Resource,
    predicate: Iri,
    object: Value,
    context: Option<Resource>,
}

impl Statement {
    /// Create a statement in the default graph
    pub fn new(subject: Resource, predicate: Iri, object: Value) -> Self {
        Self::with_context(subject, predicate, object, None)
    }

    /// Create a statement with an explicit context
    pub fn with_context(
        subject: Resource,
        predicate: Iri,
        object: Value,
        context: Option<Resource>,
    ) -> Self {
        Statement {
            subject,
            predicate,
            object,
            context,
        }
    }

    /// The subject
    pub fn subject(&self) -> &Resource {
        &self.subject
    }

    /// The predicate
    pub fn predicate(&self) -> &Iri {
        &self.predicate
    }

    /// The object
    pub fn object(&self) -> &Value {
        &self.object
    }

    /// The context (named graph), `None` for the default graph
    pub fn context(&self) -> Option<&Resource> {
        self.context.as_ref()
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)?;
        if let Some(ctx) = &self.context {
            write!(f, " {}", ctx)?;
        }
        write!(f, " .")
    }
}
