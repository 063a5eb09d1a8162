/*!
 * Segregated Free List
 * Free-space bookkeeping for a general heap, kept fully coalesced
 */

use crate::core::limits::{MEDIUM_BLOCK_MAX, SMALL_BLOCK_MAX};
use crate::core::types::Size;
use std::collections::BTreeMap;

/// Free region, as an offset into the heap arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeBlock {
    pub offset: Size,
    pub size: Size,
}

impl FreeBlock {
    #[inline]
    pub fn end(&self) -> Size {
        self.offset + self.size
    }
}

const SMALL_BUCKETS: usize = 7; // 64, 128, ..., 4096 bytes
const MEDIUM_BUCKETS: usize = 16; // 4KB increments up to 64KB

/// Segregated free list
/// - Small blocks (<=4KB): power-of-2 buckets
/// - Medium blocks (4KB-64KB): 4KB increment buckets
/// - Large blocks (>64KB): BTreeMap by size
///
/// A bucket holds blocks whose size is at least its lower bound, so the
/// bucket of the request itself is searched for a real fit and every later
/// bucket satisfies the request outright.
#[derive(Debug)]
pub(crate) struct SegregatedFreeList {
    small_blocks: Vec<Vec<FreeBlock>>,
    medium_blocks: Vec<Vec<FreeBlock>>,
    large_blocks: BTreeMap<Size, Vec<FreeBlock>>,
}

impl SegregatedFreeList {
    pub fn new() -> Self {
        Self {
            small_blocks: vec![Vec::new(); SMALL_BUCKETS],
            medium_blocks: vec![Vec::new(); MEDIUM_BUCKETS],
            large_blocks: BTreeMap::new(),
        }
    }

    fn small_bucket_index(size: Size) -> Option<usize> {
        if size > SMALL_BLOCK_MAX {
            return None;
        }
        // floor(log2(size)) - 6, with everything below 64 bytes in bucket 0
        let size = size.max(64);
        let bucket = (Size::BITS - 1 - size.leading_zeros()) as usize - 6;
        Some(bucket.min(SMALL_BUCKETS - 1))
    }

    fn medium_bucket_index(size: Size) -> Option<usize> {
        if size <= SMALL_BLOCK_MAX || size > MEDIUM_BLOCK_MAX {
            return None;
        }
        let bucket = (size / (4 * 1024)).saturating_sub(1);
        Some(bucket.min(MEDIUM_BUCKETS - 1))
    }

    pub fn insert(&mut self, block: FreeBlock) {
        if block.size == 0 {
            return;
        }
        if let Some(idx) = Self::small_bucket_index(block.size) {
            self.small_blocks[idx].push(block);
        } else if let Some(idx) = Self::medium_bucket_index(block.size) {
            self.medium_blocks[idx].push(block);
        } else {
            self.large_blocks.entry(block.size).or_default().push(block);
        }
    }

    /// Insert a freed region, merging it with free neighbours on both sides
    pub fn insert_merged(&mut self, mut block: FreeBlock) {
        if let Some(next) = self.take_at(block.end()) {
            block.size += next.size;
        }
        if let Some(prev) = self.take_ending_at(block.offset) {
            block.offset = prev.offset;
            block.size += prev.size;
        }
        self.insert(block);
    }

    /// Remove and return the smallest block of at least `size` bytes
    pub fn find_best_fit(&mut self, size: Size) -> Option<FreeBlock> {
        if size <= SMALL_BLOCK_MAX {
            let start = Self::small_bucket_index(size).unwrap_or(0);
            for idx in start..SMALL_BUCKETS {
                if let Some(block) = Self::take_fitting(&mut self.small_blocks[idx], size) {
                    return Some(block);
                }
            }
        }

        if size <= MEDIUM_BLOCK_MAX {
            let start = Self::medium_bucket_index(size.max(SMALL_BLOCK_MAX + 1)).unwrap_or(0);
            for idx in start..MEDIUM_BUCKETS {
                if let Some(block) = Self::take_fitting(&mut self.medium_blocks[idx], size) {
                    return Some(block);
                }
            }
        }

        let key = self.large_blocks.range(size..).next().map(|(s, _)| *s)?;
        let blocks = self.large_blocks.get_mut(&key)?;
        let block = blocks.pop()?;
        if blocks.is_empty() {
            self.large_blocks.remove(&key);
        }
        Some(block)
    }

    /// Lowest-offset block that fits and starts below `limit`
    pub fn take_lowest_fit_below(&mut self, size: Size, limit: Size) -> Option<FreeBlock> {
        let candidate = self
            .iter()
            .filter(|b| b.size >= size && b.offset < limit)
            .min_by_key(|b| b.offset)
            .copied()?;
        self.take_at(candidate.offset)
    }

    fn take_fitting(bucket: &mut Vec<FreeBlock>, size: Size) -> Option<FreeBlock> {
        let idx = bucket
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size >= size)
            .min_by_key(|(_, b)| b.size)
            .map(|(i, _)| i)?;
        Some(bucket.swap_remove(idx))
    }

    /// Remove the free block starting exactly at `offset`
    pub fn take_at(&mut self, offset: Size) -> Option<FreeBlock> {
        self.take_where(|b| b.offset == offset)
    }

    /// Remove the free block ending exactly at `end`
    pub fn take_ending_at(&mut self, end: Size) -> Option<FreeBlock> {
        self.take_where(|b| b.end() == end)
    }

    fn take_where(&mut self, pred: impl Fn(&FreeBlock) -> bool) -> Option<FreeBlock> {
        let buckets = self.small_blocks.iter_mut().chain(self.medium_blocks.iter_mut());
        for bucket in buckets {
            if let Some(idx) = bucket.iter().position(|b| pred(b)) {
                return Some(bucket.swap_remove(idx));
            }
        }

        let mut found = None;
        for (size, blocks) in self.large_blocks.iter_mut() {
            if let Some(idx) = blocks.iter().position(|b| pred(b)) {
                found = Some((*size, blocks.swap_remove(idx)));
                break;
            }
        }
        let (size, block) = found?;
        if self.large_blocks.get(&size).map_or(false, |v| v.is_empty()) {
            self.large_blocks.remove(&size);
        }
        Some(block)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FreeBlock> {
        self.small_blocks
            .iter()
            .chain(self.medium_blocks.iter())
            .flatten()
            .chain(self.large_blocks.values().flatten())
    }

    pub fn len(&self) -> usize {
        let small_count: usize = self.small_blocks.iter().map(|v| v.len()).sum();
        let medium_count: usize = self.medium_blocks.iter().map(|v| v.len()).sum();
        let large_count: usize = self.large_blocks.values().map(|v| v.len()).sum();
        small_count + medium_count + large_count
    }

    pub fn largest(&self) -> Size {
        self.iter().map(|b| b.size).max().unwrap_or(0)
    }
}
