//! Bounded reservoir shuffle

use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Approximate shuffle holding at most `capacity` items.
///
/// The buffer is topped up from the source before every emission and a
/// uniformly random buffered item is emitted. Errors skip the buffer and
/// come out as soon as they are pulled.
pub struct Shuffled<I, T, E>
where
    I: Iterator<Item = Result<T, E>>,
{
    inner: I,
    buffer: Vec<T>,
    capacity: usize,
    rng: ChaCha8Rng,
    exhausted: bool,
}

impl<I, T, E> Shuffled<I, T, E>
where
    I: Iterator<Item = Result<T, E>>,
{
    /// `capacity` of 0 or 1 passes items through in order
    pub fn new(inner: I, capacity: usize, rng: ChaCha8Rng) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(capacity.min(1 << 16)),
            capacity,
            rng,
            exhausted: false,
        }
    }

    /// Items currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl<I, T, E> Iterator for Shuffled<I, T, E>
where
    I: Iterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.capacity <= 1 {
            return self.inner.next();
        }

        while !self.exhausted && self.buffer.len() < self.capacity {
            match self.inner.next() {
                Some(Ok(item)) => self.buffer.push(item),
                Some(Err(e)) => return Some(Err(e)),
                None => self.exhausted = true,
            }
        }

        if self.buffer.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..self.buffer.len());
        Some(Ok(self.buffer.swap_remove(pick)))
    }
}
