//! Compact repository deny set
//!
//! Bits are grouped into chunks of 65,536 ids keyed by the id's high 16
//! bits, so a few ids scattered across the whole id space cost a few
//! chunks rather than one dense bitmap spanning the largest id.
//!
//! # Performance
//!
//! - Membership test: one hash lookup plus one word test
//! - Memory: at most 8 KiB per occupied chunk
//!
//! # Example
//!
//! ```rust
//! use insights_tsdb::aggregation::DenyBitmap;
//!
//! let denied = DenyBitmap::from_ids([3, 70_000, 3]);
//! assert!(denied.contains(3));
//! assert!(denied.contains(70_000));
//! assert!(!denied.contains(4));
//! assert_eq!(denied.len(), 2);
//! ```

use std::collections::HashMap;

use crate::types::RepoId;

const CHUNK_BITS: u32 = 16;
const LOW_MASK: u32 = (1 << CHUNK_BITS) - 1;
const WORDS_PER_CHUNK: usize = (1 << CHUNK_BITS) / 64;

/// Set of denied repository ids
#[derive(Debug, Clone, Default)]
pub struct DenyBitmap {
    /// Chunk words keyed by high bits; a chunk grows only as far as its
    /// largest low id
    chunks: HashMap<u16, Vec<u64>>,

    /// Number of bits set
    cardinality: usize,
}

impl DenyBitmap {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of ids; duplicates are ignored
    pub fn from_ids(ids: impl IntoIterator<Item = RepoId>) -> Self {
        let mut bitmap = Self::new();
        for id in ids {
            bitmap.insert(id);
        }
        bitmap
    }

    #[inline]
    fn split(id: RepoId) -> (u16, usize, u32) {
        // Ids are reinterpreted as unsigned, so negative ids are still distinct
        let raw = id as u32;
        let high = (raw >> CHUNK_BITS) as u16;
        let low = raw & LOW_MASK;
        (high, (low / 64) as usize, low % 64)
    }

    /// Add an id; returns false if it was already present
    pub fn insert(&mut self, id: RepoId) -> bool {
        let (high, word_idx, bit_idx) = Self::split(id);
        let words = self.chunks.entry(high).or_default();

        // Grow if needed
        if word_idx >= words.len() {
            words.resize((word_idx + 1).min(WORDS_PER_CHUNK), 0);
        }

        let mask = 1u64 << bit_idx;
        if words[word_idx] & mask == 0 {
            words[word_idx] |= mask;
            self.cardinality += 1;
            true
        } else {
            false
        }
    }

    /// Membership test
    #[inline]
    pub fn contains(&self, id: RepoId) -> bool {
        let (high, word_idx, bit_idx) = Self::split(id);
        match self.chunks.get(&high) {
            Some(words) => words
                .get(word_idx)
                .map_or(false, |word| word & (1u64 << bit_idx) != 0),
            None => false,
        }
    }

    /// Number of ids in the set
    pub fn len(&self) -> usize {
        self.cardinality
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    /// Ids in the set, in unsigned order
    pub fn to_ids(&self) -> Vec<RepoId> {
        let mut highs: Vec<u16> = self.chunks.keys().copied().collect();
        highs.sort_unstable();

        let mut ids = Vec::with_capacity(self.cardinality);
        for high in highs {
            let words = &self.chunks[&high];
            for (word_idx, word) in words.iter().enumerate() {
                let mut remaining = *word;
                while remaining != 0 {
                    let bit = remaining.trailing_zeros();
                    let raw = (u32::from(high) << CHUNK_BITS) | (word_idx as u32 * 64 + bit);
                    ids.push(raw as RepoId);
                    remaining &= remaining - 1;
                }
            }
        }
        ids
    }

    /// Get memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        self.chunks.values().map(|words| words.len() * 8).sum()
    }
}

impl FromIterator<RepoId> for DenyBitmap {
    fn from_iter<I: IntoIterator<Item = RepoId>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_and_contains() {
        let mut bitmap = DenyBitmap::new();
        assert!(bitmap.insert(0));
        assert!(bitmap.insert(63));
        assert!(bitmap.insert(64));
        assert!(!bitmap.insert(63));

        assert!(bitmap.contains(0));
        assert!(bitmap.contains(64));
        assert!(!bitmap.contains(65));
        assert_eq!(bitmap.len(), 3);
    }

    #[test]
    fn test_sparse_ids_stay_small() {
        let bitmap = DenyBitmap::from_ids([1, i32::MAX, 1 << 20]);
        assert_eq!(bitmap.len(), 3);
        assert!(bitmap.contains(i32::MAX));
        assert!(!bitmap.contains(i32::MAX - 1));
        // Three chunks, none grown to full size
        assert!(bitmap.memory_bytes() < 3 * WORDS_PER_CHUNK * 8);
    }

    #[test]
    fn test_negative_ids() {
        let bitmap = DenyBitmap::from_ids([-1, 5]);
        assert!(bitmap.contains(-1));
        assert!(!bitmap.contains(-2));
        assert_eq!(bitmap.to_ids(), vec![5, -1]);
    }

    proptest! {
        #[test]
        fn prop_matches_hash_set(ids in prop::collection::vec(any::<i32>(), 0..200), probe in any::<i32>()) {
            let bitmap: DenyBitmap = ids.iter().copied().collect();
            let set: std::collections::HashSet<i32> = ids.iter().copied().collect();

            prop_assert_eq!(bitmap.len(), set.len());
            prop_assert_eq!(bitmap.contains(probe), set.contains(&probe));
            for id in &ids {
                prop_assert!(bitmap.contains(*id));
            }
        }
    }
}
