//! Fixed-length epochs over long or endless streams

/// Cuts a stream into epochs of exactly `length` successful items.
///
/// Errors are forwarded but do not count toward the length. When an epoch
/// ends, [`next_epoch`](WithEpoch::next_epoch) resumes the same underlying
/// stream where it stopped.
#[derive(Debug)]
pub struct WithEpoch<I> {
    inner: I,
    length: u64,
    produced: u64,
}

impl<I> WithEpoch<I> {
    pub fn new(inner: I, length: u64) -> Self {
        Self {
            inner,
            length,
            produced: 0,
        }
    }

    /// Items per epoch
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Items produced in the current epoch
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Start the next epoch on the same stream
    pub fn next_epoch(&mut self) {
        self.produced = 0;
    }

    pub fn into_inner(self) -> I {
        self.inner
    }
}

impl<I, T, E> Iterator for WithEpoch<I>
where
    I: Iterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.produced >= self.length {
            return None;
        }
        let item = self.inner.next()?;
        if item.is_ok() {
            self.produced += 1;
        }
        Some(item)
    }
}
