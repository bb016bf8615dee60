//! Operations over sequences of values
//!
//! Sequences arrive from writers unsorted and possibly carrying duplicate
//! timestamps. The operations here are pure with respect to their input:
//! deduplication and range exclusion return fresh vectors, leaving the
//! original slice untouched. Deduplication orders by ascending timestamp and
//! resolves ties in favor of the value that arrived last.

use thiserror::Error;

use crate::types::{Timestamp, Value, ValueType};

/// Error produced by type inference over a value sequence
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldTypeError {
    /// The sequence holds no values to infer a type from
    #[error("series contains no values")]
    EmptySeries,

    /// The sequence mixes payload types
    #[error("series contains mixed types: {first} and {second}")]
    Conflict {
        /// Type of the first value in the sequence
        first: ValueType,
        /// First differing type encountered
        second: ValueType,
    },
}

/// Sequence operations over a slice of values
///
/// Implemented for `[Value]` so both slices and vectors pick it up through
/// deref.
pub trait ValuesExt {
    /// Total byte footprint of the sequence
    fn byte_size(&self) -> usize;

    /// Whether timestamps are strictly increasing (no duplicates)
    fn is_strictly_ordered(&self) -> bool;

    /// Sorted, duplicate-free copy of the sequence
    ///
    /// Values are ordered by ascending timestamp. When several values share a
    /// timestamp, the one latest in arrival order wins.
    fn deduplicate(&self) -> Vec<Value>;

    /// Copy of the sequence without values in `min..=max`
    ///
    /// Relative order is preserved, so a sorted input stays sorted.
    fn exclude(&self, min: Timestamp, max: Timestamp) -> Vec<Value>;

    /// Common payload type of the sequence, or the conflict that prevents one
    fn value_type(&self) -> Result<ValueType, FieldTypeError>;
}

impl ValuesExt for [Value] {
    fn byte_size(&self) -> usize {
        self.iter().map(Value::size).sum()
    }

    fn is_strictly_ordered(&self) -> bool {
        self.windows(2).all(|w| w[0].timestamp < w[1].timestamp)
    }

    fn deduplicate(&self) -> Vec<Value> {
        let mut sorted = self.to_vec();
        // Stable sort keeps arrival order within equal timestamps, so the
        // last of a run is the last-written value.
        sorted.sort_by_key(|v| v.timestamp);

        let mut out: Vec<Value> = Vec::with_capacity(sorted.len());
        for v in sorted {
            match out.last_mut() {
                Some(last) if last.timestamp == v.timestamp => *last = v,
                _ => out.push(v),
            }
        }
        out
    }

    fn exclude(&self, min: Timestamp, max: Timestamp) -> Vec<Value> {
        self.iter()
            .filter(|v| v.timestamp < min || v.timestamp > max)
            .cloned()
            .collect()
    }

    fn value_type(&self) -> Result<ValueType, FieldTypeError> {
        let mut iter = self.iter();
        let first = iter.next().ok_or(FieldTypeError::EmptySeries)?.value_type();
        for v in iter {
            let t = v.value_type();
            if t != first {
                return Err(FieldTypeError::Conflict {
                    first,
                    second: t,
                });
            }
        }
        Ok(first)
    }
}
