//! Row-major matrix transpose.

use std::ops::Range;

use tilecore_core::{Result, TileError};

/// Write the `cols x rows` transpose of the `rows x cols` matrix `src` to `dst`.
pub fn transpose<T: Copy>(src: &[T], dst: &mut [T], rows: usize, cols: usize) -> Result<()> {
    transpose_rows(src, dst, rows, cols, 0..rows)
}

/// Transpose only the source rows in `range`, filling the matching columns of `dst`.
///
/// Calculators split a transpose by giving each a disjoint row range.
pub fn transpose_rows<T: Copy>(
    src: &[T],
    dst: &mut [T],
    rows: usize,
    cols: usize,
    range: Range<usize>,
) -> Result<()> {
    let len = rows * cols;
    if src.len() < len || dst.len() < len {
        return Err(TileError::OutOfBounds(format!(
            "transpose of {rows}x{cols} needs {len} elements (src {}, dst {})",
            src.len(),
            dst.len()
        )));
    }
    if range.start > range.end || range.end > rows {
        return Err(TileError::OutOfBounds(format!(
            "transpose rows {range:?} outside 0..{rows}"
        )));
    }
    for r in range {
        let row = &src[r * cols..(r + 1) * cols];
        for (c, &x) in row.iter().enumerate() {
            dst[c * rows + r] = x;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_2x3() {
        let src = [1, 2, 3, 4, 5, 6];
        let mut dst = [0; 6];
        transpose(&src, &mut dst, 2, 3).unwrap();
        assert_eq!(dst, [1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_split_transpose_matches_whole() {
        let (rows, cols) = (8, 5);
        let src: Vec<u32> = (0..rows * cols).map(|i| i as u32).collect();
        let mut whole = vec![0u32; rows * cols];
        transpose(&src, &mut whole, rows, cols).unwrap();

        let mut split = vec![0u32; rows * cols];
        for part in 0..4 {
            transpose_rows(&src, &mut split, rows, cols, part * 2..part * 2 + 2).unwrap();
        }
        assert_eq!(whole, split);
    }

    #[test]
    fn test_range_checked() {
        let src = [0.0f32; 4];
        let mut dst = [0.0f32; 4];
        assert!(transpose_rows(&src, &mut dst, 2, 2, 1..3).is_err());
        assert!(transpose(&src[..3], &mut dst, 2, 2).is_err());
    }
}
