pub mod byte_source_trait;
pub mod byte_state;
pub mod error;
pub mod native;
pub mod pipe;
pub(crate) mod queue;
pub mod readable;
pub(crate) mod signal;
pub mod transform;
pub mod writable;

// Re-export main types
pub use byte_source_trait::*;
pub use byte_state::*;
pub use error::*;
pub use native::*;
pub use pipe::*;
pub use readable::*;
pub use signal::PendingOp;
pub use transform::*;
pub use writable::*;

pub type StreamResult<T> = Result<T, error::StreamError>;

/// Generic queuing strategy trait
///
/// Sizes and high-water marks are `f64` so a strategy may report fractional
/// costs; a negative, infinite or NaN size errors the stream that produced it.
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk
    fn size(&self, chunk: &T) -> f64;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> f64;
}

/// Count-based strategy
#[derive(Clone, Debug)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> f64 {
        1.0
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Clone, Debug)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<&[u8]> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &&[u8]) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Strategy backed by a user supplied size function.
pub struct SizeFnQueuingStrategy<F> {
    size: F,
    high_water_mark: f64,
}

impl<F> SizeFnQueuingStrategy<F> {
    pub fn new(high_water_mark: f64, size: F) -> Self {
        Self {
            size,
            high_water_mark,
        }
    }
}

impl<T, F> QueuingStrategy<T> for SizeFnQueuingStrategy<F>
where
    F: Fn(&T) -> f64,
{
    fn size(&self, chunk: &T) -> f64 {
        (self.size)(chunk)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Rejects high-water marks a stream cannot be built with.
pub(crate) fn validate_high_water_mark(high_water_mark: f64) -> StreamResult<f64> {
    if high_water_mark.is_nan() || high_water_mark < 0.0 {
        return Err(StreamError::range_error(format!(
            "invalid high water mark: {}",
            high_water_mark
        )));
    }
    Ok(high_water_mark)
}
