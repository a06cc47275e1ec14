//! Batching and unbatching of sample streams

use shard_core::{FieldValue, Result, Sample};

/// A group of samples delivered together
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample keys in batch order
    pub fn keys(&self) -> Vec<&str> {
        self.samples.iter().map(|s| s.key.as_str()).collect()
    }

    /// One field across the batch; `None` where a sample lacks it
    pub fn column(&self, field: &str) -> Vec<Option<&FieldValue>> {
        self.samples.iter().map(|s| s.get(field)).collect()
    }
}

impl IntoIterator for Batch {
    type Item = Sample;
    type IntoIter = std::vec::IntoIter<Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.into_iter()
    }
}

/// Groups samples into batches of `size`.
///
/// Errors are forwarded immediately; samples collected so far stay pending
/// for the next batch.
pub struct Batched<I> {
    inner: I,
    size: usize,
    keep_partial: bool,
    pending: Vec<Sample>,
    done: bool,
}

impl<I> Batched<I>
where
    I: Iterator<Item = Result<Sample>>,
{
    pub fn new(inner: I, size: usize, keep_partial: bool) -> Self {
        let size = size.max(1);
        Self {
            inner,
            size,
            keep_partial,
            pending: Vec::with_capacity(size),
            done: false,
        }
    }
}

impl<I> Iterator for Batched<I>
where
    I: Iterator<Item = Result<Sample>>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        while !self.done {
            match self.inner.next() {
                Some(Ok(sample)) => {
                    self.pending.push(sample);
                    if self.pending.len() == self.size {
                        let fresh = Vec::with_capacity(self.size);
                        let full = std::mem::replace(&mut self.pending, fresh);
                        return Some(Ok(Batch::new(full)));
                    }
                }
                Some(Err(e)) => return Some(Err(e)),
                None => self.done = true,
            }
        }

        if self.keep_partial && !self.pending.is_empty() {
            return Some(Ok(Batch::new(std::mem::take(&mut self.pending))));
        }
        self.pending.clear();
        None
    }
}

/// Flattens batches back into samples
pub struct Unbatch<I> {
    inner: I,
    current: std::vec::IntoIter<Sample>,
}

impl<I> Unbatch<I>
where
    I: Iterator<Item = Result<Batch>>,
{
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            current: Vec::new().into_iter(),
        }
    }
}

impl<I> Iterator for Unbatch<I>
where
    I: Iterator<Item = Result<Batch>>,
{
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Result<Sample>> {
        loop {
            if let Some(sample) = self.current.next() {
                return Some(Ok(sample));
            }
            match self.inner.next()? {
                Ok(batch) => self.current = batch.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
