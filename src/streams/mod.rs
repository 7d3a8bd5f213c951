pub mod duplex;
pub mod error;
pub(crate) mod lifecycle;
pub mod observer;
pub mod pipe;
pub mod queue;
pub mod readable;
pub mod signal;
pub mod transform;
pub mod writable;

#[cfg(test)]
pub(crate) mod test_util;

// Re-export main types
pub use duplex::*;
pub use error::*;
pub use observer::ListenerId;
pub use pipe::*;
pub use queue::*;
pub use readable::*;
pub use signal::*;
pub use transform::*;
pub use writable::*;

use crate::platform::MaybeSend;
use bytes::{Bytes, BytesMut};
use std::fmt;

/// Default high-water mark for byte streams (64 KiB).
pub const DEFAULT_BYTE_HIGH_WATER_MARK: usize = 64 * 1024;
/// Default high-water mark for object streams, counted in entries.
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;
/// Largest high-water mark a readable grows to on large `read(size)` requests.
pub const MAX_HIGH_WATER_MARK: usize = 1 << 30;

/// Anything that can travel through a stream.
///
/// Chunks are cloned when one emission reaches several data observers,
/// e.g. a readable piped into more than one destination.
pub trait Chunk: Clone + MaybeSend + 'static {}

impl<T: Clone + MaybeSend + 'static> Chunk for T {}

/// Byte-oriented payloads that can be measured, split and coalesced.
pub trait ByteChunk: Chunk {
    fn byte_len(&self) -> usize;

    /// Split off and return the first `at` bytes, leaving the rest in `self`.
    fn split_to(&mut self, at: usize) -> Self;

    fn concat(parts: Vec<Self>) -> Self;
}

impl ByteChunk for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn split_to(&mut self, at: usize) -> Self {
        let rest = self.split_off(at.min(self.len()));
        std::mem::replace(self, rest)
    }

    fn concat(parts: Vec<Self>) -> Self {
        parts.concat()
    }
}

impl ByteChunk for String {
    fn byte_len(&self) -> usize {
        self.len()
    }

    /// Splits on the first char boundary at or after `at`.
    fn split_to(&mut self, at: usize) -> Self {
        let mut at = at.min(self.len());
        while !self.is_char_boundary(at) {
            at += 1;
        }
        let rest = self.split_off(at);
        std::mem::replace(self, rest)
    }

    fn concat(parts: Vec<Self>) -> Self {
        parts.concat()
    }
}

impl ByteChunk for Bytes {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn split_to(&mut self, at: usize) -> Self {
        Bytes::split_to(self, at.min(self.len()))
    }

    fn concat(parts: Vec<Self>) -> Self {
        if parts.len() == 1 {
            return parts.into_iter().next().unwrap_or_default();
        }
        let total = parts.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for part in &parts {
            buf.extend_from_slice(part);
        }
        buf.freeze()
    }
}

/// Encoding hint carried alongside each queued chunk.
///
/// The hint is handed to the commit primitive untouched; no transcoding
/// happens inside the stream machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    Buffer,
    Utf8,
    Ascii,
    Latin1,
    Base64,
    Hex,
    Ucs2,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Buffer => "buffer",
            Encoding::Utf8 => "utf8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin1",
            Encoding::Base64 => "base64",
            Encoding::Hex => "hex",
            Encoding::Ucs2 => "ucs2",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic queuing strategy trait
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk
    fn size(&self, chunk: &T) -> usize;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> usize;
}

/// Count-based strategy, one unit per chunk
#[derive(Debug, Clone)]
pub struct CountQueuingStrategy {
    high_water_mark: usize,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl Default for CountQueuingStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_OBJECT_HIGH_WATER_MARK)
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> usize {
        1
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Debug, Clone)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: usize,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl Default for ByteLengthQueuingStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_BYTE_HIGH_WATER_MARK)
    }
}

impl<T: ByteChunk> QueuingStrategy<T> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &T) -> usize {
        chunk.byte_len()
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Smallest power of two able to hold `size`, used when a read asks for
/// more than the current high-water mark.
pub(crate) fn grown_high_water_mark(size: usize) -> StreamResult<usize> {
    if size > MAX_HIGH_WATER_MARK {
        return Err(StreamError::OutOfRange {
            name: "size",
            max: MAX_HIGH_WATER_MARK,
            value: size,
        });
    }
    Ok(size.next_power_of_two())
}
