use super::{error::StreamError, StreamResult};
use std::collections::VecDeque;

/// FIFO of chunks paired with the cost the queuing strategy assigned them.
///
/// `total_size` is kept equal to the sum of the entry sizes; it is clamped at
/// zero on dequeue so floating point drift can never make it negative.
pub(crate) struct SizedQueue<T> {
    entries: VecDeque<(T, f64)>,
    total_size: f64,
}

impl<T> Default for SizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SizedQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total_size: 0.0,
        }
    }

    /// Append `chunk` with a strategy computed `size`.
    ///
    /// On an invalid size the chunk is handed back untouched together with the
    /// error; callers error the owning stream with it.
    pub(crate) fn enqueue(&mut self, chunk: T, size: f64) -> Result<(), (T, StreamError)> {
        if let Err(e) = validate_size(size) {
            return Err((chunk, e));
        }
        self.entries.push_back((chunk, size));
        self.total_size += size;
        Ok(())
    }

    pub(crate) fn dequeue(&mut self) -> Option<T> {
        self.dequeue_entry().map(|(chunk, _)| chunk)
    }

    /// Like [`dequeue`](Self::dequeue) but also returns the entry's cost.
    pub(crate) fn dequeue_entry(&mut self) -> Option<(T, f64)> {
        let (chunk, size) = self.entries.pop_front()?;
        self.total_size -= size;
        if self.total_size < 0.0 || self.entries.is_empty() {
            self.total_size = 0.0;
        }
        Some((chunk, size))
    }

    pub(crate) fn peek(&self) -> Option<&T> {
        self.entries.front().map(|(chunk, _)| chunk)
    }

    pub(crate) fn peek_mut(&mut self) -> Option<&mut T> {
        self.entries.front_mut().map(|(chunk, _)| chunk)
    }

    /// Lower the cost of the head entry after part of it was consumed in place.
    pub(crate) fn consume_head(&mut self, cost: f64) {
        if let Some((_, size)) = self.entries.front_mut() {
            let taken = cost.min(*size);
            *size -= taken;
            self.total_size = (self.total_size - taken).max(0.0);
        }
    }

    pub(crate) fn total_size(&self) -> f64 {
        self.total_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }
}

fn validate_size(size: f64) -> StreamResult<()> {
    if !size.is_finite() || size < 0.0 {
        return Err(StreamError::range_error(format!(
            "chunk size must be a finite, non-negative number, got {}",
            size
        )));
    }
    Ok(())
}
