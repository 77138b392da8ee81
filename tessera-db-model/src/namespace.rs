//! Namespace bindings (prefix to name)

use std::fmt;

/// A namespace binding: a short prefix mapped to a namespace name
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Namespace {
    prefix: String,
    name: String,
}

impl Namespace {
    /// Create a namespace binding
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Namespace {
            prefix: prefix.into(),
            name: name.into(),
        }
    }

    /// The prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The namespace name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: <{}>", self.prefix, self.name)
    }
}
