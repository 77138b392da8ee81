//! RDF value types
//!
//! All value types are immutable and backed by `Arc<str>`, so cloning a value
//! (or a statement) is a couple of reference-count bumps. Equality and
//! ordering are structural.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Datatype IRI assigned to plain literals
pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";

/// Datatype IRI for language-tagged literals
pub const RDF_LANG_STRING: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#langString";

/// An IRI reference
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Iri(Arc<str>);

impl Iri {
    /// Create an IRI from a string
    pub fn new(iri: impl AsRef<str>) -> Self {
        Iri(Arc::from(iri.as_ref()))
    }

    /// The IRI string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Iri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

/// A blank node, identified by a store-local label
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BlankNode(Arc<str>);

impl BlankNode {
    /// Create a blank node with the given label
    pub fn new(id: impl AsRef<str>) -> Self {
        BlankNode(Arc::from(id.as_ref()))
    }

    /// The blank node label (without the `_:` prefix)
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlankNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_:{}", self.0)
    }
}

/// A resource: either an IRI or a blank node
///
/// Resources appear in subject position and as context (named graph)
/// identifiers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Resource {
    /// An IRI resource
    Iri(Iri),
    /// A blank node
    Blank(BlankNode),
}

impl Resource {
    /// Create an IRI resource
    pub fn iri(iri: impl AsRef<str>) -> Self {
        Resource::Iri(Iri::new(iri))
    }
}

impl From<Iri> for Resource {
    fn from(iri: Iri) -> Self {
        Resource::Iri(iri)
    }
}

impl From<BlankNode> for Resource {
    fn from(node: BlankNode) -> Self {
        Resource::Blank(node)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Iri(iri) => iri.fmt(f),
            Resource::Blank(b) => b.fmt(f),
        }
    }
}

/// A literal value with datatype and optional language tag
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Literal {
    label: Arc<str>,
    datatype: Iri,
    language: Option<Arc<str>>,
}

impl Literal {
    /// Create a plain literal (datatype `xsd:string`)
    pub fn new(label: impl AsRef<str>) -> Self {
        Literal {
            label: Arc::from(label.as_ref()),
            datatype: Iri::new(XSD_STRING),
            language: None,
        }
    }

    /// Create a typed literal
    pub fn typed(label: impl AsRef<str>, datatype: Iri) -> Self {
        Literal {
            label: Arc::from(label.as_ref()),
            datatype,
            language: None,
        }
    }

    /// Create a language-tagged literal (datatype `rdf:langString`)
    pub fn tagged(label: impl AsRef<str>, language: impl AsRef<str>) -> Self {
        Literal {
            label: Arc::from(label.as_ref()),
            datatype: Iri::new(RDF_LANG_STRING),
            language: Some(Arc::from(language.as_ref())),
        }
    }

    /// The lexical form
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The datatype IRI
    pub fn datatype(&self) -> &Iri {
        &self.datatype
    }

    /// The language tag, if any
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.label)?;
        if let Some(lang) = &self.language {
            write!(f, "@{}", lang)
        } else if self.datatype.as_str() != XSD_STRING {
            write!(f, "^^{}", self.datatype)
        } else {
            Ok(())
        }
    }
}

/// Any RDF value: a resource or a literal
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Value {
    /// A resource (IRI or blank node)
    Resource(Resource),
    /// A literal
    Literal(Literal),
}

impl Value {
    /// Create an IRI value
    pub fn iri(iri: impl AsRef<str>) -> Self {
        Value::Resource(Resource::iri(iri))
    }

    /// Create a plain literal value
    pub fn literal(label: impl AsRef<str>) -> Self {
        Value::Literal(Literal::new(label))
    }
}

impl From<Resource> for Value {
    fn from(r: Resource) -> Self {
        Value::Resource(r)
    }
}

impl From<Literal> for Value {
    fn from(l: Literal) -> Self {
        Value::Literal(l)
    }
}

impl From<Iri> for Value {
    fn from(iri: Iri) -> Self {
        Value::Resource(Resource::Iri(iri))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Resource(r) => r.fmt(f),
            Value::Literal(l) => l.fmt(f),
        }
    }
}

/// Factory for values and statements
///
/// Blank node labels are unique per factory instance. One factory is shared
/// by a store facade and every connection above it.
#[derive(Debug, Default)]
pub struct ValueFactory {
    bnode_counter: AtomicU64,
}

impl ValueFactory {
    /// Create a new value factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an IRI
    pub fn iri(&self, iri: impl AsRef<str>) -> Iri {
        Iri::new(iri)
    }

    /// Create a fresh blank node
    pub fn bnode(&self) -> BlankNode {
        let n = self.bnode_counter.fetch_add(1, Ordering::Relaxed);
        BlankNode::new(format!("b{}", n))
    }

    /// Create a plain literal
    pub fn literal(&self, label: impl AsRef<str>) -> Literal {
        Literal::new(label)
    }

    /// Create a typed literal
    pub fn typed_literal(&self, label: impl AsRef<str>, datatype: Iri) -> Literal {
        Literal::typed(label, datatype)
    }

    /// Create a language-tagged literal
    pub fn lang_literal(&self, label: impl AsRef<str>, language: impl AsRef<str>) -> Literal {
        Literal::tagged(label, language)
    }
}
