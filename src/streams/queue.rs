use super::{ByteChunk, Encoding};
use std::collections::VecDeque;

/// One buffered chunk together with its accounting data.
#[derive(Debug)]
pub struct QueueEntry<T, M = ()> {
    pub chunk: T,
    pub encoding: Encoding,
    pub size: usize,
    pub meta: M,
}

/// Byte operations used when a queue runs in byte mode.
struct ByteOps<T> {
    len: fn(&T) -> usize,
    split_to: fn(&mut T, usize) -> T,
    concat: fn(Vec<T>) -> T,
}

impl<T> Clone for ByteOps<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ByteOps<T> {}

/// Ordered, length-accounted buffer of pending chunks.
///
/// `len()` is the sum of entry sizes: bytes in byte mode, units reported by
/// the owning stream's queuing strategy otherwise. Every entry counts for at
/// least one unit so that `len() == 0` exactly when the queue is empty.
pub struct ChunkQueue<T, M = ()> {
    entries: VecDeque<QueueEntry<T, M>>,
    length: usize,
    bytes: Option<ByteOps<T>>,
}

impl<T, M> Default for ChunkQueue<T, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, M> ChunkQueue<T, M> {
    /// Object-mode queue: entries are never split or merged.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            length: 0,
            bytes: None,
        }
    }

    /// Byte-mode queue: `take` coalesces and splits entries.
    pub fn bytes() -> Self
    where
        T: ByteChunk,
    {
        Self {
            entries: VecDeque::new(),
            length: 0,
            bytes: Some(ByteOps {
                len: T::byte_len,
                split_to: T::split_to,
                concat: T::concat,
            }),
        }
    }

    pub fn is_byte_mode(&self) -> bool {
        self.bytes.is_some()
    }

    /// Total buffered size.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of buffered entries, regardless of their size.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn push_back(&mut self, chunk: T, size: usize, encoding: Encoding, meta: M) {
        let size = self.measure(&chunk, size);
        self.length += size;
        self.entries.push_back(QueueEntry {
            chunk,
            encoding,
            size,
            meta,
        });
    }

    pub fn push_front(&mut self, chunk: T, size: usize, encoding: Encoding, meta: M) {
        let size = self.measure(&chunk, size);
        self.length += size;
        self.entries.push_front(QueueEntry {
            chunk,
            encoding,
            size,
            meta,
        });
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry<T, M>> {
        let entry = self.entries.pop_front()?;
        self.length -= entry.size;
        Some(entry)
    }

    pub fn front(&self) -> Option<&QueueEntry<T, M>> {
        self.entries.front()
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = QueueEntry<T, M>> + '_ {
        self.length = 0;
        self.entries.drain(..)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.length = 0;
    }

    fn measure(&self, chunk: &T, size: usize) -> usize {
        match &self.bytes {
            Some(ops) => (ops.len)(chunk).max(1),
            None => size.max(1),
        }
    }
}

impl<T> ChunkQueue<T, ()> {
    /// Take up to `n` units from the front.
    ///
    /// In byte mode entries are merged or split so that exactly
    /// `min(n, len())` bytes come back as one chunk (a split may land a few
    /// bytes later for payloads with boundary constraints). In object mode
    /// the front entry is returned whole.
    pub fn take(&mut self, n: usize) -> Option<T> {
        if n == 0 || self.entries.is_empty() {
            return None;
        }
        let Some(ops) = self.bytes else {
            return self.pop_front().map(|entry| entry.chunk);
        };

        let mut remaining = n.min(self.length);
        let mut parts = Vec::new();
        while remaining > 0 {
            let Some(front) = self.entries.front_mut() else {
                break;
            };
            if front.size <= remaining {
                remaining -= front.size;
                if let Some(entry) = self.pop_front() {
                    parts.push(entry.chunk);
                }
                continue;
            }
            let head = (ops.split_to)(&mut front.chunk, remaining);
            let taken = (ops.len)(&head);
            let rest = (ops.len)(&front.chunk);
            self.length -= front.size - rest;
            front.size = rest;
            if rest == 0 {
                self.entries.pop_front();
            }
            parts.push(head);
            remaining = remaining.saturating_sub(taken);
            break;
        }

        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some((ops.concat)(parts)),
        }
    }

    /// Take everything, merged into one chunk in byte mode.
    pub fn take_all(&mut self) -> Option<T> {
        let length = self.length;
        self.take(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_byte_read_coalesces_and_splits() {
        let mut queue: ChunkQueue<String> = ChunkQueue::bytes();
        queue.push_back("abc".to_string(), 0, Encoding::Utf8, ());
        queue.push_back("de".to_string(), 0, Encoding::Utf8, ());
        assert_eq!(queue.len(), 5);

        assert_eq!(queue.take(4).as_deref(), Some("abcd"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_all().as_deref(), Some("e"));
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn object_mode_returns_whole_entries() {
        let mut queue: ChunkQueue<Vec<u8>> = ChunkQueue::new();
        queue.push_back(vec![1, 2, 3], 1, Encoding::Buffer, ());
        queue.push_back(vec![4], 1, Encoding::Buffer, ());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take(10), Some(vec![1, 2, 3]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unshifted_entries_come_out_first() {
        let mut queue: ChunkQueue<&'static str, u32> = ChunkQueue::new();
        queue.push_back("b", 1, Encoding::Buffer, 2);
        queue.push_front("a", 1, Encoding::Buffer, 1);
        let metas: Vec<u32> = queue.drain().map(|entry| entry.meta).collect();
        assert_eq!(metas, vec![1, 2]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn zero_sized_entries_still_count() {
        let mut queue: ChunkQueue<Vec<u8>> = ChunkQueue::new();
        queue.push_back(Vec::new(), 0, Encoding::Buffer, ());
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
    }

    proptest! {
        #[test]
        fn byte_takes_preserve_order_and_accounting(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..16), 1..12),
            reads in prop::collection::vec(1usize..40, 1..20),
        ) {
            let mut queue: ChunkQueue<Vec<u8>> = ChunkQueue::bytes();
            let mut expected = Vec::new();
            for chunk in &chunks {
                expected.extend_from_slice(chunk);
                queue.push_back(chunk.clone(), 0, Encoding::Buffer, ());
            }
            prop_assert_eq!(queue.len(), expected.len());

            let mut seen = Vec::new();
            for n in reads {
                let before = queue.len();
                if let Some(out) = queue.take(n) {
                    prop_assert_eq!(out.len(), n.min(before));
                    seen.extend_from_slice(&out);
                }
                prop_assert_eq!(queue.len() == 0, queue.is_empty());
            }
            if let Some(rest) = queue.take_all() {
                seen.extend_from_slice(&rest);
            }
            prop_assert_eq!(seen, expected);
            prop_assert_eq!(queue.len(), 0);
        }
    }
}
