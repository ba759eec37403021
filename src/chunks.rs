//! # Chunk Tracker Module
//!
//! The [ChunkList] tracks file extents of a transaction. A receiver stores the extents it has
//! received so far, which allows to build NAK segment lists and to detect completion. A Class 2
//! sender stores the extents which were requested by NAKs and still need to be re-sent.
//!
//! The list is backed by a [heapless::Vec] and therefore has a capacity known at compile-time.
//! Extents are kept sorted by offset, and overlapping or adjacent extents are always coalesced.
//! When the list is full, the tracker degrades instead of failing. How it degrades depends on
//! the [FullPolicy] of the list, and both policies only ever err towards more work for the
//! sender:
//!
//! - [FullPolicy::KeepLargest] for received extents. The smallest extent, which may be the new
//!   one, is forgotten. The forgotten bytes show up as a gap and get requested again, a byte
//!   which was never received is never reported as present.
//! - [FullPolicy::MergeNearest] for requested extents. The two neighbouring extents separated by
//!   the smallest gap are merged, so a few bytes which were not requested are re-sent as well.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// File extent `[offset, offset + size)`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Chunk {
    pub offset: u64,
    pub size: u64,
}

impl Chunk {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    #[inline]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ChunkError {
    #[error("chunk ({offset}, {size}) overflows the file offset range")]
    Overflow { offset: u64, size: u64 },
}

/// What a full [ChunkList] gives up to make room for a new disjoint extent.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FullPolicy {
    /// Drop the smallest extent. The covered bytes never exceed the added bytes.
    #[default]
    KeepLargest,
    /// Close the smallest gap. Every added byte stays covered.
    MergeNearest,
}

#[derive(Debug, Default, Clone)]
pub struct ChunkList<const N: usize> {
    list: heapless::Vec<Chunk, N>,
    policy: FullPolicy,
}

impl<const N: usize> ChunkList<N> {
    pub const fn new() -> Self {
        Self::with_policy(FullPolicy::KeepLargest)
    }

    pub const fn with_policy(policy: FullPolicy) -> Self {
        Self {
            list: heapless::Vec::new(),
            policy,
        }
    }

    #[inline]
    pub fn policy(&self) -> FullPolicy {
        self.policy
    }

    /// Clear the list and switch to another policy.
    pub fn reset_with(&mut self, policy: FullPolicy) {
        self.list.clear();
        self.policy = policy;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn reset(&mut self) {
        self.list.clear();
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Chunk> {
        self.list.iter()
    }

    /// Lowest extent.
    pub fn first(&self) -> Option<Chunk> {
        self.list.first().copied()
    }

    /// Sum of all extent sizes.
    pub fn covered_bytes(&self) -> u64 {
        self.list.iter().map(|chunk| chunk.size).sum()
    }

    /// Add a new extent and coalesce it with overlapping or adjacent extents.
    ///
    /// Empty extents are ignored.
    pub fn add(&mut self, offset: u64, size: u64) -> Result<(), ChunkError> {
        let end = offset
            .checked_add(size)
            .ok_or(ChunkError::Overflow { offset, size })?;
        if size == 0 {
            return Ok(());
        }
        // Index of the first extent which could touch the new one.
        let first = self.list.partition_point(|chunk| chunk.end() < offset);
        // One past the last extent touching the new one.
        let last = self.list.partition_point(|chunk| chunk.offset <= end);
        if first < last {
            let merged_offset = self.list[first].offset.min(offset);
            let merged_end = self.list[last - 1].end().max(end);
            self.list[first] = Chunk::new(merged_offset, merged_end - merged_offset);
            self.remove_range(first + 1, last);
            return Ok(());
        }
        if self.list.is_full() {
            let new = Chunk::new(offset, size);
            match self.policy {
                FullPolicy::KeepLargest => self.evict_insert(first, new),
                FullPolicy::MergeNearest => self.merge_insert(first, new),
            }
            return Ok(());
        }
        // There is space, so the insertion can not fail.
        let _ = self.list.insert(first, Chunk::new(offset, size));
        Ok(())
    }

    fn remove_range(&mut self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let count = end - start;
        let len = self.list.len();
        self.list.as_mut_slice()[start..].rotate_left(count);
        self.list.truncate(len - count);
    }

    /// Insert into a full list at position `pos` unless the new extent is the smallest one.
    /// Otherwise the smallest stored extent makes room for it.
    fn evict_insert(&mut self, pos: usize, new: Chunk) {
        let Some((smallest, size)) = self
            .list
            .iter()
            .enumerate()
            .map(|(idx, chunk)| (idx, chunk.size))
            .min_by_key(|(_, size)| *size)
        else {
            return;
        };
        if new.size <= size {
            return;
        }
        self.remove_range(smallest, smallest + 1);
        let pos = if pos > smallest { pos - 1 } else { pos };
        let _ = self.list.insert(pos, new);
    }

    /// Insert into a full list at position `pos` by closing the smallest gap of the sequence
    /// which contains the new extent.
    fn merge_insert(&mut self, pos: usize, new: Chunk) {
        let mut best_pair: Option<usize> = None;
        let mut best_gap = u64::MAX;
        for idx in 1..self.list.len() {
            let gap = self.list[idx].offset - self.list[idx - 1].end();
            if gap < best_gap {
                best_gap = gap;
                best_pair = Some(idx - 1);
            }
        }
        let gap_prev = (pos > 0).then(|| new.offset - self.list[pos - 1].end());
        let gap_next = self.list.get(pos).map(|next| next.offset - new.end());
        match (gap_prev, gap_next) {
            (Some(prev), next) if prev <= best_gap && next.map_or(true, |next| prev <= next) => {
                let chunk = &mut self.list[pos - 1];
                chunk.size = new.end() - chunk.offset;
                return;
            }
            (_, Some(next)) if next <= best_gap => {
                let chunk = &mut self.list[pos];
                chunk.size = chunk.end() - new.offset;
                chunk.offset = new.offset;
                return;
            }
            _ => (),
        }
        if let Some(idx) = best_pair {
            let end = self.list[idx + 1].end();
            self.list[idx].size = end - self.list[idx].offset;
            self.remove_range(idx + 1, idx + 2);
            let pos = if pos > idx + 1 { pos - 1 } else { pos };
            let _ = self.list.insert(pos, new);
        }
    }

    /// Remove up to `max_size` bytes from the front of the lowest extent and return the
    /// removed extent.
    pub fn remove_from_first(&mut self, max_size: u64) -> Option<Chunk> {
        let first = self.list.first_mut()?;
        let size = first.size.min(max_size);
        let removed = Chunk::new(first.offset, size);
        first.offset += size;
        first.size -= size;
        if first.size == 0 {
            self.remove_range(0, 1);
        }
        Some(removed)
    }

    /// Iterate over the gaps between the stored extents inside `[start, total)`, in ascending
    /// offset order.
    pub fn gaps(&self, total: u64, start: u64) -> Gaps<'_> {
        Gaps {
            chunks: self.list.as_slice(),
            idx: 0,
            cursor: start,
            total,
        }
    }

    /// True if the extents cover `[0, total)` without gaps.
    pub fn is_complete(&self, total: u64) -> bool {
        self.gaps(total, 0).next().is_none()
    }
}

/// Iterator over the complement of a [ChunkList].
#[derive(Debug, Clone)]
pub struct Gaps<'a> {
    chunks: &'a [Chunk],
    idx: usize,
    cursor: u64,
    total: u64,
}

impl Iterator for Gaps<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        while self.cursor < self.total {
            match self.chunks.get(self.idx) {
                Some(chunk) => {
                    self.idx += 1;
                    if chunk.end() <= self.cursor {
                        continue;
                    }
                    if chunk.offset > self.cursor {
                        let gap_end = chunk.offset.min(self.total);
                        let gap = Chunk::new(self.cursor, gap_end - self.cursor);
                        self.cursor = chunk.end();
                        return Some(gap);
                    }
                    self.cursor = chunk.end();
                }
                None => {
                    let gap = Chunk::new(self.cursor, self.total - self.cursor);
                    self.cursor = self.total;
                    return Some(gap);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::vec::Vec;

    fn assert_invariants<const N: usize>(list: &ChunkList<N>) {
        for pair in list.list.windows(2) {
            // Sorted, non overlapping and never adjacent after coalescing.
            assert!(pair[0].end() < pair[1].offset, "{:?}", pair);
        }
        assert!(list.iter().all(|chunk| chunk.size > 0));
    }

    fn collect<const N: usize>(list: &ChunkList<N>) -> Vec<(u64, u64)> {
        list.iter().map(|c| (c.offset, c.size)).collect()
    }

    #[test]
    fn test_state() {
        let list: ChunkList<4> = ChunkList::new();
        assert!(list.is_empty());
        assert_eq!(list.capacity(), 4);
        assert_eq!(list.first(), None);
        assert!(list.is_complete(0));
        assert!(!list.is_complete(1));
    }

    #[test]
    fn test_empty_chunk_ignored() {
        let mut list: ChunkList<4> = ChunkList::new();
        list.add(10, 0).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_overflow() {
        let mut list: ChunkList<4> = ChunkList::new();
        let error = list.add(u64::MAX, 2).unwrap_err();
        if let ChunkError::Overflow { offset, size } = error {
            assert_eq!(offset, u64::MAX);
            assert_eq!(size, 2);
        } else {
            panic!("unexpected error {:?}", error);
        }
    }

    #[test]
    fn test_adjacent_are_coalesced() {
        let mut list: ChunkList<4> = ChunkList::new();
        list.add(0, 10).unwrap();
        list.add(10, 10).unwrap();
        assert_eq!(collect(&list), [(0, 20)]);
        list.add(30, 5).unwrap();
        list.add(20, 10).unwrap();
        assert_eq!(collect(&list), [(0, 35)]);
    }

    #[test]
    fn test_overlapping_are_coalesced() {
        let mut list: ChunkList<8> = ChunkList::new();
        list.add(100, 50).unwrap();
        list.add(0, 10).unwrap();
        list.add(200, 10).unwrap();
        assert_eq!(collect(&list), [(0, 10), (100, 50), (200, 10)]);
        list.add(5, 200).unwrap();
        assert_eq!(collect(&list), [(0, 210)]);
    }

    #[test]
    fn test_contained_chunk() {
        let mut list: ChunkList<4> = ChunkList::new();
        list.add(0, 100).unwrap();
        list.add(20, 10).unwrap();
        assert_eq!(collect(&list), [(0, 100)]);
    }

    #[test]
    fn test_gaps() {
        let mut list: ChunkList<8> = ChunkList::new();
        list.add(0, 1000).unwrap();
        list.add(2000, 1000).unwrap();
        let gaps: Vec<Chunk> = list.gaps(3000, 0).collect();
        assert_eq!(gaps, [Chunk::new(1000, 1000)]);
        let gaps: Vec<Chunk> = list.gaps(4000, 0).collect();
        assert_eq!(gaps, [Chunk::new(1000, 1000), Chunk::new(3000, 1000)]);
        let gaps: Vec<Chunk> = list.gaps(4000, 2500).collect();
        assert_eq!(gaps, [Chunk::new(3000, 1000)]);
        let gaps: Vec<Chunk> = list.gaps(1500, 0).collect();
        assert_eq!(gaps, [Chunk::new(1000, 500)]);
    }

    #[test]
    fn test_gaps_leading() {
        let mut list: ChunkList<8> = ChunkList::new();
        list.add(500, 500).unwrap();
        let gaps: Vec<Chunk> = list.gaps(1000, 0).collect();
        assert_eq!(gaps, [Chunk::new(0, 500)]);
        assert!(!list.is_complete(1000));
        list.add(0, 500).unwrap();
        assert!(list.is_complete(1000));
    }

    #[test]
    fn test_remove_from_first() {
        let mut list: ChunkList<4> = ChunkList::new();
        list.add(1000, 3000).unwrap();
        list.add(5000, 10).unwrap();
        assert_eq!(list.remove_from_first(1380), Some(Chunk::new(1000, 1380)));
        assert_eq!(list.remove_from_first(1380), Some(Chunk::new(2380, 1380)));
        assert_eq!(list.remove_from_first(1380), Some(Chunk::new(3760, 240)));
        assert_eq!(list.remove_from_first(1380), Some(Chunk::new(5000, 10)));
        assert_eq!(list.remove_from_first(1380), None);
    }

    #[test]
    fn test_full_list_drops_smallest_extent() {
        let mut list: ChunkList<3> = ChunkList::new();
        list.add(0, 10).unwrap();
        list.add(100, 5).unwrap();
        list.add(200, 10).unwrap();
        list.add(300, 20).unwrap();
        assert_eq!(collect(&list), [(0, 10), (200, 10), (300, 20)]);
        // Not larger than anything stored, so it is not kept.
        list.add(150, 10).unwrap();
        assert_eq!(collect(&list), [(0, 10), (200, 10), (300, 20)]);
        list.add(50, 11).unwrap();
        assert_eq!(collect(&list), [(50, 11), (200, 10), (300, 20)]);
        assert_eq!(list.covered_bytes(), 41);
        assert_invariants(&list);
        // Coalescing needs no free slot.
        list.add(61, 139).unwrap();
        assert_eq!(collect(&list), [(50, 160), (300, 20)]);
    }

    #[test]
    fn test_full_list_never_reports_missing_data() {
        let mut list: ChunkList<4> = ChunkList::new();
        // Many disjoint extents with gaps in between, like a lossy link.
        for idx in 0..60u64 {
            list.add(idx * 20, 10).unwrap();
        }
        assert_eq!(list.len(), 4);
        assert_eq!(list.covered_bytes(), 40);
        for chunk in list.iter() {
            assert_eq!(chunk.offset % 20, 0);
            assert_eq!(chunk.size, 10);
        }
        let missing: u64 = list.gaps(1200, 0).map(|gap| gap.size).sum();
        assert_eq!(missing, 1160);
    }

    #[test]
    fn test_reset_with_policy() {
        let mut list: ChunkList<2> = ChunkList::with_policy(FullPolicy::MergeNearest);
        list.add(0, 1).unwrap();
        assert_eq!(list.policy(), FullPolicy::MergeNearest);
        list.reset_with(FullPolicy::KeepLargest);
        assert!(list.is_empty());
        assert_eq!(list.policy(), FullPolicy::KeepLargest);
        list.reset();
        assert_eq!(list.policy(), FullPolicy::KeepLargest);
    }

    #[test]
    fn test_full_list_merges_smallest_gap() {
        let mut list: ChunkList<3> = ChunkList::with_policy(FullPolicy::MergeNearest);
        list.add(0, 10).unwrap();
        list.add(100, 10).unwrap();
        list.add(115, 10).unwrap();
        // The gap between 110 and 115 is the smallest one.
        list.add(300, 10).unwrap();
        assert_eq!(collect(&list), [(0, 10), (100, 25), (300, 10)]);
        assert_invariants(&list);
    }

    #[test]
    fn test_full_list_merges_into_neighbour() {
        let mut list: ChunkList<3> = ChunkList::with_policy(FullPolicy::MergeNearest);
        list.add(0, 10).unwrap();
        list.add(100, 10).unwrap();
        list.add(200, 10).unwrap();
        // The new chunk is closest to its left neighbour.
        list.add(112, 4).unwrap();
        assert_eq!(collect(&list), [(0, 10), (100, 16), (200, 10)]);
        // ... and here closest to its right neighbour.
        list.add(190, 5).unwrap();
        assert_eq!(collect(&list), [(0, 10), (100, 16), (190, 20)]);
        assert_invariants(&list);
    }

    fn random_insertions(policy: FullPolicy, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..50 {
            let mut list: ChunkList<16> = ChunkList::with_policy(policy);
            let mut reference = [false; 2048];
            let mut degraded = false;
            for _ in 0..64 {
                let offset = rng.gen_range(0..2000u64);
                let size = rng.gen_range(0..48u64);
                let touches = list
                    .iter()
                    .any(|c| c.offset <= offset + size && offset <= c.end());
                if list.len() == 16 && !touches && size > 0 {
                    degraded = true;
                }
                list.add(offset, size).unwrap();
                for byte in offset..offset + size {
                    reference[byte as usize] = true;
                }
                assert_invariants(&list);
                let added = reference.iter().filter(|b| **b).count() as u64;
                let covered = |idx: u64| list.iter().any(|c| c.offset <= idx && idx < c.end());
                match policy {
                    FullPolicy::KeepLargest => {
                        assert!(list.covered_bytes() <= added);
                        // Nothing is covered which was not added.
                        for chunk in list.iter() {
                            for idx in chunk.offset..chunk.end() {
                                assert!(reference[idx as usize], "{} never added", idx);
                            }
                        }
                    }
                    FullPolicy::MergeNearest => {
                        assert!(list.covered_bytes() >= added);
                        for (idx, added) in reference.iter().enumerate() {
                            if *added {
                                assert!(covered(idx as u64));
                            }
                        }
                    }
                }
            }
            if !degraded {
                let expected = reference.iter().filter(|b| **b).count() as u64;
                assert_eq!(list.covered_bytes(), expected);
            }
        }
    }

    #[test]
    fn test_random_insertion_keeps_invariants() {
        random_insertions(FullPolicy::KeepLargest, 0x5eed);
    }

    #[test]
    fn test_random_insertion_with_merging_keeps_invariants() {
        random_insertions(FullPolicy::MergeNearest, 0x5eed);
    }

    #[test]
    fn test_complete_file_has_no_gaps() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut list: ChunkList<58> = ChunkList::new();
        let mut offsets: Vec<u64> = (0..30).map(|i| i * 100).collect();
        // Shuffle by swapping random pairs.
        for _ in 0..100 {
            let a = rng.gen_range(0..offsets.len());
            let b = rng.gen_range(0..offsets.len());
            offsets.swap(a, b);
        }
        for offset in offsets {
            list.add(offset, 100).unwrap();
        }
        assert!(list.is_complete(3000));
        assert_eq!(list.gaps(3000, 0).count(), 0);
        assert_eq!(collect(&list), [(0, 3000)]);
    }
}
