// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    ops::{Range, RangeBounds},
};

use num_traits::PrimInt;
use thiserror::Error;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// Check if a byte slice is all zeros.
pub fn is_zero(mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = buf.len().min(ZEROS.len());
        if buf[..n] != ZEROS[..n] {
            return false;
        }

        buf = &buf[n..];
    }

    true
}

#[derive(Debug, Error)]
#[error("{value} not in bounds: {bounds}")]
pub struct OutOfBoundsError {
    value: String,
    bounds: String,
}

/// Ensure that `value` lies within `bounds`, returning the value on success.
pub fn check_bounds<T, R>(value: T, bounds: R) -> Result<T, OutOfBoundsError>
where
    T: PartialOrd + fmt::Debug,
    R: RangeBounds<T> + fmt::Debug,
{
    if !bounds.contains(&value) {
        return Err(OutOfBoundsError {
            value: format!("{value:?}"),
            bounds: format!("{bounds:?}"),
        });
    }

    Ok(value)
}

/// Sort and merge overlapping or adjacent ranges.
pub fn merge_overlapping<T: Ord + Copy>(ranges: &[Range<T>]) -> Vec<Range<T>> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| (r.start, r.end));

    let mut result: Vec<Range<T>> = Vec::with_capacity(sorted.len());

    for range in sorted {
        if let Some(last) = result.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }

        result.push(range);
    }

    result
}

/// Check if `item` falls within any of the sorted, non-overlapping ranges.
pub fn ranges_contains<T: Ord>(ranges: &[Range<T>], item: &T) -> bool {
    ranges
        .binary_search_by(|r| {
            if *item < r.start {
                std::cmp::Ordering::Greater
            } else if *item >= r.end {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .is_ok()
}
