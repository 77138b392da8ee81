//! Staging models - in-memory statement collections
//!
//! A `StagingModel` holds the approved/deprecated statements of one pending
//! change. The default `TreeModel` is a sorted set; stores that stage very
//! large transactions can plug in their own implementation (for example one
//! that spills to disk) through a `ModelFactory` passed into the store
//! constructor. No global registry is involved.

use crate::pattern::StatementPattern;
use crate::statement::Statement;
use std::collections::BTreeSet;

/// An in-memory, mutable collection of statements used for staging
pub trait StagingModel: Send {
    /// Add a statement. Returns false if it was already present.
    fn add(&mut self, statement: Statement) -> bool;

    /// Remove a statement. Returns true if it was present.
    fn remove(&mut self, statement: &Statement) -> bool;

    /// Remove every statement matching the pattern, returning how many
    fn remove_matching(&mut self, pattern: &StatementPattern) -> usize;

    /// Exact membership test
    fn contains(&self, statement: &Statement) -> bool;

    /// Is any statement matching the pattern present?
    fn contains_matching(&self, pattern: &StatementPattern) -> bool;

    /// Collect all statements matching the pattern
    fn matching(&self, pattern: &StatementPattern) -> Vec<Statement>;

    /// Snapshot of every statement
    fn statements(&self) -> Vec<Statement>;

    /// Number of statements
    fn len(&self) -> usize;

    /// True when no statements are staged
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory for staging models
///
/// Passed into store/branch constructors so the staging representation is a
/// caller decision, not a process-wide one.
pub trait ModelFactory: Send + Sync {
    /// Create an empty staging model
    fn create_model(&self) -> Box<dyn StagingModel>;
}

/// Sorted-set staging model
///
/// Statements are kept in a `BTreeSet` ordered by (subject, predicate,
/// object, context). Pattern scans are linear; staged changes are expected
/// to be small relative to the backing store.
#[derive(Default, Debug)]
pub struct TreeModel {
    statements: BTreeSet<Statement>,
}

impl TreeModel {
    /// Create an empty model
    pub fn new() -> Self {
        Self::default()
    }
}

impl StagingModel for TreeModel {
    fn add(&mut self, statement: Statement) -> bool {
        self.statements.insert(statement)
    }

    fn remove(&mut self, statement: &Statement) -> bool {
        self.statements.remove(statement)
    }

    fn remove_matching(&mut self, pattern: &StatementPattern) -> usize {
        let before = self.statements.len();
        self.statements.retain(|st| !pattern.matches(st));
        before - self.statements.len()
    }

    fn contains(&self, statement: &Statement) -> bool {
        self.statements.contains(statement)
    }

    fn contains_matching(&self, pattern: &StatementPattern) -> bool {
        self.statements.iter().any(|st| pattern.matches(st))
    }

    fn matching(&self, pattern: &StatementPattern) -> Vec<Statement> {
        self.statements
            .iter()
            .filter(|st| pattern.matches(st))
            .cloned()
            .collect()
    }

    fn statements(&self) -> Vec<Statement> {
        self.statements.iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.statements.len()
    }
}

/// Factory producing `TreeModel` instances
#[derive(Default, Debug, Clone, Copy)]
pub struct TreeModelFactory;

impl ModelFactory for TreeModelFactory {
    fn create_model(&self) -> Box<dyn StagingModel> {
        Box::new(TreeModel::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Iri, Resource, Value};

    fn stmt(s: &str, ctx: Option<&str>) -> Statement {
        Statement::with_context(
            Resource::iri(s),
            Iri::new("urn:p"),
            Value::iri("urn:o"),
            ctx.map(Resource::iri),
        )
    }

    #[test]
    fn test_add_remove() {
        let mut model = TreeModel::new();
        assert!(model.add(stmt("urn:a", None)));
        assert!(!model.add(stmt("urn:a", None)));
        assert_eq!(model.len(), 1);
        assert!(model.remove(&stmt("urn:a", None)));
        assert!(model.is_empty());
    }

    #[test]
    fn test_remove_matching_by_context() {
        let mut model = TreeModel::new();
        model.add(stmt("urn:a", Some("urn:g1")));
        model.add(stmt("urn:b", Some("urn:g1")));
        model.add(stmt("urn:c", Some("urn:g2")));

        let pattern = StatementPattern::any()
            .in_contexts(vec![Some(Resource::iri("urn:g1"))]);
        assert_eq!(model.remove_matching(&pattern), 2);
        assert_eq!(model.len(), 1);
        assert!(model.contains(&stmt("urn:c", Some("urn:g2"))));
    }

    #[test]
    fn test_matching_returns_sorted() {
        let mut model = TreeModel::new();
        model.add(stmt("urn:c", None));
        model.add(stmt("urn:a", None));
        model.add(stmt("urn:b", None));

        let all = model.matching(&StatementPattern::any());
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }
}
