//! Statement patterns with wildcard matching
//!
//! A `StatementPattern` matches statements field by field, with `None`
//! standing for "any value". Contexts are filtered separately through
//! `ContextFilter`, because a context term can itself be the default graph
//! (`None`) and "no filter" must stay distinct from "default graph only".

use crate::statement::Statement;
use crate::value::{Iri, Resource, Value};
use std::fmt;

/// Context (named graph) filter for a pattern
///
/// `Any` matches every context. `In(set)` matches statements whose context is
/// one of the listed entries, where a `None` entry means the default graph.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum ContextFilter {
    /// Match any context, including the default graph
    #[default]
    Any,
    /// Match only the listed contexts (`None` = default graph)
    In(Vec<Option<Resource>>),
}

impl ContextFilter {
    /// Filter for a single context
    pub fn only(context: Option<Resource>) -> Self {
        ContextFilter::In(vec![context])
    }

    /// Does this filter accept the given context?
    pub fn accepts(&self, context: Option<&Resource>) -> bool {
        match self {
            ContextFilter::Any => true,
            ContextFilter::In(contexts) => {
                contexts.iter().any(|c| c.as_ref() == context)
            }
        }
    }
}

/// A statement pattern: `None` fields are wildcards
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct StatementPattern {
    /// Subject to match, or any
    pub subject: Option<Resource>,
    /// Predicate to match, or any
    pub predicate: Option<Iri>,
    /// Object to match, or any
    pub object: Option<Value>,
    /// Context filter
    pub contexts: ContextFilter,
}

impl StatementPattern {
    /// The all-wildcard pattern (matches every statement)
    pub fn any() -> Self {
        Self::default()
    }

    /// Create a pattern from optional terms with no context filter
    pub fn new(
        subject: Option<Resource>,
        predicate: Option<Iri>,
        object: Option<Value>,
    ) -> Self {
        StatementPattern {
            subject,
            predicate,
            object,
            contexts: ContextFilter::Any,
        }
    }

    /// Restrict this pattern to the given contexts
    pub fn in_contexts(mut self, contexts: Vec<Option<Resource>>) -> Self {
        self.contexts = ContextFilter::In(contexts);
        self
    }

    /// Is every field a wildcard?
    pub fn is_all_wildcard(&self) -> bool {
        self.subject.is_none()
            && self.predicate.is_none()
            && self.object.is_none()
            && self.contexts == ContextFilter::Any
    }

    /// Does this pattern match the given statement?
    pub fn matches(&self, statement: &Statement) -> bool {
        if let Some(s) = &self.subject {
            if s != statement.subject() {
                return false;
            }
        }
        if let Some(p) = &self.predicate {
            if p != statement.predicate() {
                return false;
            }
        }
        if let Some(o) = &self.object {
            if o != statement.object() {
                return false;
            }
        }
        self.contexts.accepts(statement.context())
    }
}

impl fmt::Display for StatementPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn term<T: fmt::Display>(t: &Option<T>) -> String {
            match t {
                Some(v) => v.to_string(),
                None => "?".to_string(),
            }
        }
        write!(
            f,
            "{} {} {}",
            term(&self.subject),
            term(&self.predicate),
            term(&self.object)
        )?;
        if let ContextFilter::In(contexts) = &self.contexts {
            let rendered: Vec<String> = contexts
                .iter()
                .map(|c| match c {
                    Some(r) => r.to_string(),
                    None => "default".to_string(),
                })
                .collect();
            write!(f, " [{}]", rendered.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(s: &str, o: &str, ctx: Option<&str>) -> Statement {
        Statement::with_context(
            Resource::iri(s),
            Iri::new("urn:p"),
            Value::iri(o),
            ctx.map(Resource::iri),
        )
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let p = StatementPattern::any();
        assert!(p.matches(&stmt("urn:s", "urn:o", None)));
        assert!(p.matches(&stmt("urn:s", "urn:o", Some("urn:g"))));
        assert!(p.is_all_wildcard());
    }

    #[test]
    fn test_bound_terms_filter() {
        let p = StatementPattern::new(Some(Resource::iri("urn:s")), None, None);
        assert!(p.matches(&stmt("urn:s", "urn:o", None)));
        assert!(!p.matches(&stmt("urn:x", "urn:o", None)));
    }

    #[test]
    fn test_default_graph_filter_is_not_any() {
        let p = StatementPattern::any().in_contexts(vec![None]);
        assert!(p.matches(&stmt("urn:s", "urn:o", None)));
        assert!(!p.matches(&stmt("urn:s", "urn:o", Some("urn:g"))));
    }

    #[test]
    fn test_context_list_filter() {
        let p = StatementPattern::any()
            .in_contexts(vec![Some(Resource::iri("urn:g1")), Some(Resource::iri("urn:g2"))]);
        assert!(p.matches(&stmt("urn:s", "urn:o", Some("urn:g1"))));
        assert!(p.matches(&stmt("urn:s", "urn:o", Some("urn:g2"))));
        assert!(!p.matches(&stmt("urn:s", "urn:o", Some("urn:g3"))));
        assert!(!p.matches(&stmt("urn:s", "urn:o", None)));
    }
}
