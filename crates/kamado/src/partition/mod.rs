//! # Dataset Partitioner
//!
//! Splits an ordered record set into contiguous, size-bounded [`BatchUnit`]s.
//! This is the only place batch size limits are enforced.
//!
//! Units are filled to `max` in source order. When the trailing unit would
//! fall below `min`, records are shifted into it from the units before it
//! (each donor keeps at least `min`), so the common case yields full units
//! followed by one partial unit.

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PartitionError;
use crate::record::Record;

/// Inclusive record-count bounds for a Batch Unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchBounds {
    min: usize,
    max: usize,
}

impl BatchBounds {
    /// Create bounds for units of `min..=max` records.
    ///
    /// # Parameters
    ///
    /// * `min` - Smallest acceptable unit, at least 1
    /// * `max` - Largest acceptable unit, at least `min`
    ///
    /// # Returns
    ///
    /// [`PartitionError::InvalidBounds`] when either bound is zero or
    /// `min > max`.
    pub fn new(min: usize, max: usize) -> Result<Self, PartitionError> {
        if min == 0 || max == 0 || min > max {
            return Err(PartitionError::InvalidBounds { min, max });
        }
        Ok(Self { min, max })
    }

    /// Smallest unit size the partitioner aims for.
    pub fn min(&self) -> usize {
        self.min
    }

    /// Largest unit size; never exceeded.
    pub fn max(&self) -> usize {
        self.max
    }
}

/// A contiguous slice of the source, submitted as one job.
#[derive(Clone, Debug)]
pub struct BatchUnit {
    /// Position of this unit within its run.
    pub index: usize,

    /// Offset of the first record in the source.
    pub start: usize,

    /// Records in source order.
    pub records: Arc<Vec<Record>>,
}

impl BatchUnit {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Source offsets covered by this unit.
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len()
    }
}

/// Compute unit ranges for `total` records.
///
/// Pure and deterministic; an empty input yields no ranges.
pub fn plan(total: usize, bounds: BatchBounds) -> Vec<Range<usize>> {
    if total == 0 {
        return vec![];
    }

    let count = total.div_ceil(bounds.max);
    let mut sizes = vec![bounds.max; count];
    sizes[count - 1] = total - bounds.max * (count - 1);

    if count > 1 && sizes[count - 1] < bounds.min {
        let mut deficit = bounds.min - sizes[count - 1];
        for donor in (0..count - 1).rev() {
            let give = deficit.min(sizes[donor] - bounds.min);
            sizes[donor] -= give;
            sizes[count - 1] += give;
            deficit -= give;
            if deficit == 0 {
                break;
            }
        }
        if deficit > 0 {
            warn!(
                total,
                min = bounds.min,
                max = bounds.max,
                last = sizes[count - 1],
                "bounds cannot be met exactly; final unit is below the minimum"
            );
        }
    }

    let mut start = 0;
    sizes
        .into_iter()
        .map(|size| {
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Split `records` into Batch Units according to `bounds`.
pub fn partition(records: Vec<Record>, bounds: BatchBounds) -> Vec<BatchUnit> {
    let ranges = plan(records.len(), bounds);
    let mut remaining = records.into_iter();

    ranges
        .into_iter()
        .enumerate()
        .map(|(index, range)| BatchUnit {
            index,
            start: range.start,
            records: Arc::new(remaining.by_ref().take(range.len()).collect()),
        })
        .collect()
}
