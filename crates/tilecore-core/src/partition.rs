//! Row partitioning across calculator cores.
//!
//! Rows of a tile must divide evenly over the calculators. The assignment
//! is validated up front instead of silently dropping remainder rows.

use crate::error::{ensure_multiple, ensure_nonzero};
use crate::Result;

/// How a tile's rows are dealt out to calculators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPartition {
    /// Calculator `i` owns rows `i * R/P .. (i + 1) * R/P`.
    Contiguous,
    /// Calculator `i` owns rows `i, i + P, i + 2P, ...`.
    Interleaved,
}

impl RowPartition {
    /// Check that `rows` can be split over `calculators` with no remainder.
    pub fn validate(what: &'static str, rows: usize, calculators: usize) -> Result<()> {
        ensure_nonzero("calculator count", calculators)?;
        ensure_multiple(what, rows, calculators)
    }

    /// Rows owned by calculator `index` out of `calculators`.
    pub fn assign(self, rows: usize, calculators: usize, index: usize) -> Result<RowAssignment> {
        Self::validate("tile rows", rows, calculators)?;
        let count = rows / calculators;
        let assignment = match self {
            RowPartition::Contiguous => RowAssignment { start: index * count, count, step: 1 },
            RowPartition::Interleaved => RowAssignment { start: index, count, step: calculators },
        };
        Ok(assignment)
    }
}

/// The rows one calculator owns within a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowAssignment {
    pub start: usize,
    pub count: usize,
    pub step: usize,
}

impl RowAssignment {
    pub fn rows(&self) -> impl Iterator<Item = usize> {
        let RowAssignment { start, count, step } = *self;
        (0..count).map(move |i| start + i * step)
    }

    /// Whether the rows form one contiguous run.
    pub fn is_contiguous(&self) -> bool {
        self.step == 1 || self.count <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous() {
        let a = RowPartition::Contiguous.assign(16, 4, 2).unwrap();
        assert_eq!(a.rows().collect::<Vec<_>>(), vec![8, 9, 10, 11]);
        assert!(a.is_contiguous());
    }

    #[test]
    fn test_interleaved() {
        let a = RowPartition::Interleaved.assign(12, 4, 1).unwrap();
        assert_eq!(a.rows().collect::<Vec<_>>(), vec![1, 5, 9]);
        assert!(!a.is_contiguous());
    }

    #[test]
    fn test_every_row_owned_once() {
        for partition in [RowPartition::Contiguous, RowPartition::Interleaved] {
            let mut seen = vec![0u32; 24];
            for core in 0..8 {
                for r in partition.assign(24, 8, core).unwrap().rows() {
                    seen[r] += 1;
                }
            }
            assert!(seen.iter().all(|&n| n == 1), "{partition:?}: {seen:?}");
        }
    }

    #[test]
    fn test_remainder_rejected() {
        assert!(RowPartition::Contiguous.assign(10, 4, 0).is_err());
        assert!(RowPartition::Interleaved.assign(10, 4, 0).is_err());
        assert!(RowPartition::validate("rows", 8, 0).is_err());
    }
}
