//! Growable bitset indexed by field offset, plus structure-aware compression.

use std::fmt;

use crate::data::Layout;

const WORD_BITS: usize = 64;

/// A set of field offsets.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    /// Empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Empty set with room for `bits` offsets before reallocating.
    #[must_use]
    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: Vec::with_capacity(bits.div_ceil(WORD_BITS)),
        }
    }

    /// Set `bit`, growing as needed.
    pub fn set(&mut self, bit: usize) {
        let word = bit / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (bit % WORD_BITS);
    }

    /// True if `bit` is set.
    #[must_use]
    pub fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / WORD_BITS)
            .is_some_and(|&w| w & (1u64 << (bit % WORD_BITS)) != 0)
    }

    /// Clear `bit`.
    pub fn clear(&mut self, bit: usize) {
        if let Some(w) = self.words.get_mut(bit / WORD_BITS) {
            *w &= !(1u64 << (bit % WORD_BITS));
        }
    }

    /// Clear every bit in `from..to`.
    pub fn clear_range(&mut self, from: usize, to: usize) {
        for bit in from..to {
            self.clear(bit);
        }
    }

    /// Clear every bit, keeping the allocation.
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// True when no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of set bits.
    #[must_use]
    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// First set bit at or after `from`.
    #[must_use]
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        let mut word_idx = from / WORD_BITS;
        if word_idx >= self.words.len() {
            return None;
        }
        let mut word = self.words[word_idx] & (u64::MAX << (from % WORD_BITS));
        loop {
            if word != 0 {
                return Some(word_idx * WORD_BITS + word.trailing_zeros() as usize);
            }
            word_idx += 1;
            if word_idx >= self.words.len() {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    /// Set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.next_set_bit(0);
        std::iter::from_fn(move || {
            let current = next?;
            next = self.next_set_bit(current + 1);
            Some(current)
        })
    }

    /// `self |= other`.
    pub fn or_assign(&mut self, other: &Self) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= *b;
        }
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut bits = Self::new();
        for bit in iter {
            bits.set(bit);
        }
        bits
    }
}

/// Collapse `bits` against `layout`.
///
/// A set structure bit implies all of its sub-fields, so their bits are
/// dropped. A structure whose direct sub-fields are all set (after compressing
/// them) is replaced by its own bit. Returns true if the root ended up set.
pub fn compress(bits: &mut BitSet, layout: &Layout) -> bool {
    if layout.is_empty() {
        return false;
    }
    compress_structure(bits, layout, 0)
}

fn compress_structure(bits: &mut BitSet, layout: &Layout, offset: usize) -> bool {
    let next = layout.fields()[offset].next_offset();
    if bits.get(offset) {
        bits.clear_range(offset + 1, next);
        return true;
    }

    let mut all_set = true;
    let mut any_child = false;
    let children: Vec<usize> = layout.children(offset).collect();
    for &child in &children {
        any_child = true;
        let set = if layout.fields()[child].is_structure() {
            compress_structure(bits, layout, child)
        } else {
            bits.get(child)
        };
        all_set &= set;
    }

    if !(all_set && any_child) {
        return false;
    }
    for child in children {
        bits.clear(child);
    }
    bits.set(offset);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ScalarType, Structure};

    fn layout() -> Layout {
        // 0:root 1:a 2:b{ 3:c 4:d } 5:e
        Layout::new(
            &Structure::builder()
                .add("a", ScalarType::Double)
                .add_nested("b")
                .add("c", ScalarType::Double)
                .add("d", ScalarType::Double)
                .end_nested()
                .add("e", ScalarType::Double)
                .build(),
        )
    }

    #[test]
    fn set_get_clear_across_words() {
        let mut bits = BitSet::new();
        bits.set(3);
        bits.set(64);
        bits.set(130);
        assert!(bits.get(3) && bits.get(64) && bits.get(130));
        assert!(!bits.get(4) && !bits.get(1000));
        assert_eq!(bits.cardinality(), 3);
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![3, 64, 130]);
        bits.clear(64);
        assert_eq!(bits.next_set_bit(4), Some(130));
        bits.clear_all();
        assert!(bits.is_empty());
        assert_eq!(bits.next_set_bit(0), None);
    }

    #[test]
    fn or_assign_grows() {
        let mut a: BitSet = [1].into_iter().collect();
        let b: BitSet = [1, 200].into_iter().collect();
        a.or_assign(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 200]);
    }

    #[test]
    fn compress_full_substructure() {
        let layout = layout();
        let mut bits: BitSet = [3, 4].into_iter().collect();
        assert!(!compress(&mut bits, &layout));
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn compress_everything_to_root() {
        let layout = layout();
        let mut bits: BitSet = [1, 3, 4, 5].into_iter().collect();
        assert!(compress(&mut bits, &layout));
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn compress_drops_descendants_of_set_structure() {
        let layout = layout();
        let mut bits: BitSet = [2, 3, 5].into_iter().collect();
        compress(&mut bits, &layout);
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![2, 5]);
    }

    #[test]
    fn compress_partial_is_unchanged() {
        let layout = layout();
        let mut bits: BitSet = [1, 3].into_iter().collect();
        compress(&mut bits, &layout);
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![1, 3]);
    }
}
