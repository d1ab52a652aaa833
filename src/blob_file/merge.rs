// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::iterator::{BlobFileIterator, ScanEntry};
use interval_heap::IntervalHeap;
use std::cmp::Reverse;

type IteratorIndex = usize;

#[derive(Debug)]
struct IteratorValue {
    index: IteratorIndex,
    entry: ScanEntry,
}

impl PartialEq for IteratorValue {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key
            && self.entry.index.file_number == other.entry.index.file_number
    }
}
impl Eq for IteratorValue {}

impl PartialOrd for IteratorValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IteratorValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.entry.key, Reverse(self.entry.index.file_number))
            .cmp(&(&other.entry.key, Reverse(other.entry.index.file_number)))
    }
}

/// Interleaves multiple blob file iterators into a single stream,
/// ordered by user key, then by file number descending (newer first)
///
/// Does not deduplicate; consumers filter stale versions themselves.
#[allow(clippy::module_name_repetitions)]
pub struct BlobFileMergeIterator {
    iterators: Vec<BlobFileIterator>,
    heap: IntervalHeap<IteratorValue>,
    initialized: bool,
}

impl BlobFileMergeIterator {
    /// Initializes a new merging iterator.
    #[must_use]
    pub fn new(iterators: Vec<BlobFileIterator>) -> Self {
        let heap = IntervalHeap::with_capacity(iterators.len());

        Self {
            iterators,
            heap,
            initialized: false,
        }
    }

    fn advance_iterator(&mut self, idx: usize) -> crate::Result<()> {
        let iterator = self.iterators.get_mut(idx).expect("iter should exist");

        if let Some(entry) = iterator.next() {
            let entry = entry?;
            self.heap.push(IteratorValue { index: idx, entry });
        }

        Ok(())
    }

    fn push_first(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            self.advance_iterator(idx)?;
        }

        Ok(())
    }
}

impl Iterator for BlobFileMergeIterator {
    type Item = crate::Result<ScanEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.push_first());
            self.initialized = true;
        }

        let head = self.heap.pop_min()?;
        fail_iter!(self.advance_iterator(head.index));

        Some(Ok(head.entry))
    }
}
