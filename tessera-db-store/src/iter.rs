//! Closable, single-pass sequences
//!
//! Backing stores may hold open cursors or locks while a result sequence is
//! being consumed, so sequences carry an explicit `close` in addition to
//! `next`. The ownership rule: a wrapper exclusively owns the sequence it
//! wraps and closes it when itself closed, including on early termination.
//! Concrete cursors also close themselves on drop, so an early `?` return
//! cannot leak backing resources; an explicit `close()` is still the way to
//! observe a close failure.
//!
//! Sequences are single-pass. Restarting a read means calling the dataset
//! again, not rewinding a cursor.

use crate::error::Result;

/// A closable, single-pass sequence of items
pub trait ClosableIter: Send {
    /// The element type
    type Item;

    /// Advance to the next item, or `None` when exhausted
    fn next(&mut self) -> Result<Option<Self::Item>>;

    /// Release underlying resources. Idempotent; after close, `next` returns
    /// `None`.
    fn close(&mut self) -> Result<()>;
}

/// Boxed statement-or-similar sequence
pub type BoxIter<T> = Box<dyn ClosableIter<Item = T>>;

impl<T> ClosableIter for BoxIter<T> {
    type Item = T;

    fn next(&mut self) -> Result<Option<T>> {
        (**self).next()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Drain a sequence into a `Vec`, closing it afterwards even on error
pub fn collect_all<T>(mut iter: BoxIter<T>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    let result = loop {
        match iter.next() {
            Ok(Some(item)) => out.push(item),
            Ok(None) => break Ok(out),
            Err(e) => break Err(e),
        }
    };
    iter.close()?;
    result
}

/// The empty sequence
pub struct EmptyCursor<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: 'static> EmptyCursor<T> {
    /// Boxed empty sequence
    pub fn boxed() -> BoxIter<T> {
        Box::new(EmptyCursor {
            _marker: std::marker::PhantomData,
        })
    }
}

impl<T> ClosableIter for EmptyCursor<T> {
    type Item = T;

    fn next(&mut self) -> Result<Option<T>> {
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sequence over an owned `Vec`
pub struct VecCursor<T> {
    items: std::vec::IntoIter<T>,
    closed: bool,
}

impl<T: Send + 'static> VecCursor<T> {
    /// Create a cursor over the given items
    pub fn new(items: Vec<T>) -> Self {
        VecCursor {
            items: items.into_iter(),
            closed: false,
        }
    }

    /// Boxed cursor over the given items
    pub fn boxed(items: Vec<T>) -> BoxIter<T> {
        Box::new(Self::new(items))
    }
}

impl<T: Send> ClosableIter for VecCursor<T> {
    type Item = T;

    fn next(&mut self) -> Result<Option<T>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.items.next())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Filtering wrapper; owns and closes the wrapped sequence
pub struct FilterCursor<T, F> {
    inner: BoxIter<T>,
    accept: F,
    closed: bool,
}

impl<T, F> FilterCursor<T, F>
where
    T: Send + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    /// Create a filtering cursor
    pub fn new(inner: BoxIter<T>, accept: F) -> Self {
        FilterCursor {
            inner,
            accept,
            closed: false,
        }
    }

    /// Boxed filtering cursor
    pub fn boxed(inner: BoxIter<T>, accept: F) -> BoxIter<T> {
        Box::new(Self::new(inner, accept))
    }
}

impl<T, F> ClosableIter for FilterCursor<T, F>
where
    T: Send,
    F: FnMut(&T) -> bool + Send,
{
    type Item = T;

    fn next(&mut self) -> Result<Option<T>> {
        if self.closed {
            return Ok(None);
        }
        while let Some(item) = self.inner.next()? {
            if (self.accept)(&item) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.inner.close()?;
        }
        Ok(())
    }
}

impl<T, F> Drop for FilterCursor<T, F> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.inner.close();
        }
    }
}

/// Bag-union of two sequences: first exhausts, then second
///
/// No duplicate suppression is applied.
pub struct ChainCursor<T> {
    first: Option<BoxIter<T>>,
    second: Option<BoxIter<T>>,
    closed: bool,
}

impl<T: Send + 'static> ChainCursor<T> {
    /// Create a chained cursor
    pub fn new(first: BoxIter<T>, second: BoxIter<T>) -> Self {
        ChainCursor {
            first: Some(first),
            second: Some(second),
            closed: false,
        }
    }

    /// Boxed chained cursor
    pub fn boxed(first: BoxIter<T>, second: BoxIter<T>) -> BoxIter<T> {
        Box::new(Self::new(first, second))
    }
}

impl<T: Send> ClosableIter for ChainCursor<T> {
    type Item = T;

    fn next(&mut self) -> Result<Option<T>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(first) = &mut self.first {
            if let Some(item) = first.next()? {
                return Ok(Some(item));
            }
            // first side exhausted; release it before draining the second
            if let Some(mut first) = self.first.take() {
                first.close()?;
            }
        }
        match &mut self.second {
            Some(second) => second.next(),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut result = Ok(());
        if let Some(mut first) = self.first.take() {
            if let Err(e) = first.close() {
                result = Err(e);
            }
        }
        if let Some(mut second) = self.second.take() {
            if let Err(e) = second.close() {
                result = Err(e);
            }
        }
        result
    }
}

impl<T> Drop for ChainCursor<T> {
    fn drop(&mut self) {
        if !self.closed {
            if let Some(mut first) = self.first.take() {
                let _ = first.close();
            }
            if let Some(mut second) = self.second.take() {
                let _ = second.close();
            }
        }
    }
}
