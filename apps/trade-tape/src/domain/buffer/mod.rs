//! Bounded Display Buffer
//!
//! Newest-first sequence of admitted prints capped at the configured depth.
//! Inserting past capacity evicts from the tail, so the oldest prints always
//! go first.

use std::collections::VecDeque;

use super::trade::TradePrint;

/// Smallest accepted tape depth.
pub const MIN_DEPTH: usize = 1;

/// Largest accepted tape depth.
pub const MAX_DEPTH: usize = 500;

/// Depth outside `[MIN_DEPTH, MAX_DEPTH]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("depth {0} must be between 1 and 500")]
pub struct InvalidDepth(pub usize);

/// A validated tape depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Depth(usize);

impl Depth {
    /// Validate a depth.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidDepth`] if `value` is outside `[1, 500]`.
    pub const fn new(value: usize) -> Result<Self, InvalidDepth> {
        if value < MIN_DEPTH || value > MAX_DEPTH {
            return Err(InvalidDepth(value));
        }
        Ok(Self(value))
    }

    /// Get the depth value.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl Default for Depth {
    fn default() -> Self {
        Self(100)
    }
}

impl TryFrom<usize> for Depth {
    type Error = InvalidDepth;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Depth-capped, newest-first print buffer.
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    depth: Depth,
    prints: VecDeque<TradePrint>,
}

impl BoundedBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new(depth: Depth) -> Self {
        Self {
            depth,
            prints: VecDeque::with_capacity(depth.get()),
        }
    }

    /// Get the configured depth.
    #[must_use]
    pub const fn depth(&self) -> Depth {
        self.depth
    }

    /// Change the depth, evicting the oldest prints if it shrank.
    pub fn set_depth(&mut self, depth: Depth) {
        self.depth = depth;
        self.prints.truncate(depth.get());
    }

    /// Insert a print at the head, evicting the tail if over capacity.
    pub fn insert_at_head(&mut self, print: TradePrint) {
        self.prints.push_front(print);
        self.prints.truncate(self.depth.get());
    }

    /// Replace the contents with a newest-first sequence, keeping at most
    /// `depth` of its leading prints.
    pub fn replace_all(&mut self, prints: impl IntoIterator<Item = TradePrint>) {
        self.prints.clear();
        self.prints
            .extend(prints.into_iter().take(self.depth.get()));
    }

    /// Remove every print.
    pub fn clear(&mut self) {
        self.prints.clear();
    }

    /// Number of prints held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prints.len()
    }

    /// Check if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prints.is_empty()
    }

    /// Iterate newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &TradePrint> {
        self.prints.iter()
    }

    /// Copy the contents, newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TradePrint> {
        self.prints.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::trade::Side;

    fn print(seq: i64) -> TradePrint {
        TradePrint::new(
            "AAPL",
            Decimal::from(100),
            Decimal::from(seq),
            Side::Buy,
            Utc.timestamp_opt(seq, 0).unwrap(),
        )
    }

    fn volumes(buffer: &BoundedBuffer) -> Vec<i64> {
        buffer
            .iter()
            .map(|p| i64::try_from(p.volume.mantissa()).unwrap())
            .collect()
    }

    #[test]
    fn depth_bounds() {
        assert_eq!(Depth::new(0), Err(InvalidDepth(0)));
        assert_eq!(Depth::new(501), Err(InvalidDepth(501)));
        assert_eq!(Depth::new(1).unwrap().get(), 1);
        assert_eq!(Depth::new(500).unwrap().get(), 500);
        assert_eq!(Depth::default().get(), 100);
    }

    #[test]
    fn insert_keeps_newest_first_and_evicts_tail() {
        let mut buffer = BoundedBuffer::new(Depth::new(3).unwrap());

        for seq in 1..=5 {
            buffer.insert_at_head(print(seq));
        }

        assert_eq!(volumes(&buffer), vec![5, 4, 3]);
    }

    #[test]
    fn replace_all_truncates_to_depth() {
        let mut buffer = BoundedBuffer::new(Depth::new(2).unwrap());
        buffer.insert_at_head(print(9));

        buffer.replace_all(vec![print(3), print(2), print(1)]);

        assert_eq!(volumes(&buffer), vec![3, 2]);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut buffer = BoundedBuffer::new(Depth::default());
        buffer.insert_at_head(print(1));

        buffer.clear();
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn shrinking_depth_evicts_oldest() {
        let mut buffer = BoundedBuffer::new(Depth::new(4).unwrap());
        for seq in 1..=4 {
            buffer.insert_at_head(print(seq));
        }

        buffer.set_depth(Depth::new(2).unwrap());

        assert_eq!(volumes(&buffer), vec![4, 3]);
    }

    proptest! {
        #[test]
        fn holds_most_recent_insertions(depth in 1usize..=500, count in 0i64..1200) {
            let mut buffer = BoundedBuffer::new(Depth::new(depth).unwrap());
            for seq in 0..count {
                buffer.insert_at_head(print(seq));
            }

            prop_assert!(buffer.len() <= depth);

            let expected: Vec<i64> = (0..count).rev().take(depth).collect();
            prop_assert_eq!(volumes(&buffer), expected);
        }
    }
}
