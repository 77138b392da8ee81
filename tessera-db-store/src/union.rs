//! Union composition over two branches
//!
//! A [`UnionBranch`] presents a primary and an additional branch as one
//! logical statement container: reads see the bag union of both sides,
//! writes go only to the primary. The store facade uses this to expose
//! explicit and inferred statements as a single graph while keeping sinks
//! scoped to the explicit side.

use crate::error::Result;
use crate::isolation::IsolationLevel;
use crate::iter::{BoxIter, ChainCursor, ClosableIter, VecCursor};
use crate::source::{Branch, Dataset, Sink, Source};
use tessera_db_model::{Namespace, Resource, Statement, StatementPattern};

/// Primary plus additional branch, read as one
pub struct UnionBranch {
    primary: Box<dyn Branch>,
    additional: Box<dyn Branch>,
}

impl UnionBranch {
    /// Combine two branches; sinks target `primary`
    pub fn new(primary: Box<dyn Branch>, additional: Box<dyn Branch>) -> Self {
        UnionBranch {
            primary,
            additional,
        }
    }
}

impl Source for UnionBranch {
    fn fork(&self) -> Box<dyn Branch> {
        Box::new(UnionBranch::new(self.primary.fork(), self.additional.fork()))
    }

    fn dataset(&self, level: IsolationLevel) -> Result<Box<dyn Dataset>> {
        let primary = self.primary.dataset(level)?;
        let additional = match self.additional.dataset(level) {
            Ok(additional) => additional,
            Err(e) => {
                let _ = primary.close();
                return Err(e);
            }
        };
        Ok(Box::new(UnionDataset {
            primary,
            additional,
        }))
    }

    fn sink(&self, level: IsolationLevel) -> Result<Box<dyn Sink>> {
        self.primary.sink(level)
    }

    fn close(&self) -> Result<()> {
        let primary = self.primary.close();
        let additional = self.additional.close();
        primary.and(additional)
    }
}

impl Branch for UnionBranch {
    fn prepare(&self) -> Result<()> {
        self.primary.prepare()?;
        self.additional.prepare()
    }

    fn flush(&self) -> Result<()> {
        self.primary.flush()?;
        self.additional.flush()
    }
}

/// Bag union of two datasets; primary wins namespace-prefix ties
pub struct UnionDataset {
    primary: Box<dyn Dataset>,
    additional: Box<dyn Dataset>,
}

impl Dataset for UnionDataset {
    fn statements(&self, pattern: &StatementPattern) -> Result<BoxIter<Statement>> {
        let primary = self.primary.statements(pattern)?;
        let additional = self.additional.statements(pattern)?;
        Ok(ChainCursor::boxed(primary, additional))
    }

    fn namespace(&self, prefix: &str) -> Result<Option<String>> {
        match self.primary.namespace(prefix)? {
            Some(name) => Ok(Some(name)),
            None => self.additional.namespace(prefix),
        }
    }

    fn namespaces(&self) -> Result<BoxIter<Namespace>> {
        let mut bindings = Vec::new();
        let mut primary = self.primary.namespaces()?;
        while let Some(namespace) = primary.next()? {
            bindings.push(namespace);
        }
        primary.close()?;
        let mut additional = self.additional.namespaces()?;
        while let Some(namespace) = additional.next()? {
            if !bindings.iter().any(|b| b.prefix() == namespace.prefix()) {
                bindings.push(namespace);
            }
        }
        additional.close()?;
        Ok(VecCursor::boxed(bindings))
    }

    fn context_ids(&self) -> Result<BoxIter<Resource>> {
        let primary = self.primary.context_ids()?;
        let additional = self.additional.context_ids()?;
        Ok(ChainCursor::boxed(primary, additional))
    }

    fn close(&self) -> Result<()> {
        let primary = self.primary.close();
        let additional = self.additional.close();
        primary.and(additional)
    }
}
