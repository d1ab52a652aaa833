// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// An LSM sequence number
pub type SeqNo = u64;

/// Thread-safe, monotonically increasing counter
///
/// Used both for LSM sequence numbers and for blob file numbers.
#[derive(Clone, Debug, Default)]
pub struct SequenceNumberCounter(Arc<AtomicU64>);

impl SequenceNumberCounter {
    /// Creates a new counter, setting it to some previous value.
    #[must_use]
    pub fn new(prev: SeqNo) -> Self {
        Self(Arc::new(AtomicU64::new(prev)))
    }

    /// Gets the current value.
    #[must_use]
    pub fn get(&self) -> SeqNo {
        self.0.load(Ordering::Acquire)
    }

    /// Gets the next value, incrementing the counter.
    #[must_use]
    pub fn next(&self) -> SeqNo {
        self.0.fetch_add(1, Ordering::Release)
    }

    /// Sets the counter to the given value if it is higher.
    pub fn fetch_max(&self, value: SeqNo) {
        self.0.fetch_max(value, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_counter() {
        let counter = SequenceNumberCounter::default();
        assert_eq!(0, counter.next());
        assert_eq!(1, counter.next());
        assert_eq!(2, counter.get());

        counter.fetch_max(10);
        assert_eq!(10, counter.get());

        counter.fetch_max(5);
        assert_eq!(10, counter.get());
    }
}
